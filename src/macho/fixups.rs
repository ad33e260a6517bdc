//! Chained fixup structures.
//!
//! Input dylibs encode their rebases as linked chains threaded through the
//! segment data: each pointer-sized slot carries, besides its rebase or bind
//! payload, the distance to the next fixup in the same page. The adjustor
//! walks these chains when rewriting a dylib for its new address, so both
//! the LINKEDIT-side header structures and the in-place pointer encodings
//! are modeled here.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use crate::util::read_u16_le;

// =============================================================================
// LINKEDIT Structures
// =============================================================================

/// Header of the LC_DYLD_CHAINED_FIXUPS payload.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChainedFixupsHeader {
    /// Format version (0 for now)
    pub fixups_version: u32,
    /// Offset of dyld_chained_starts_in_image
    pub starts_offset: u32,
    /// Offset of the imports table
    pub imports_offset: u32,
    /// Offset of the symbol strings
    pub symbols_offset: u32,
    /// Number of imports
    pub imports_count: u32,
    /// Import entry format
    pub imports_format: u32,
    /// 0 = uncompressed, 1 = zlib
    pub symbols_format: u32,
}

impl ChainedFixupsHeader {
    /// Size of this header.
    pub const SIZE: usize = 28;
}

/// Fixed-size prefix of dyld_chained_starts_in_segment.
///
/// The trailing `page_start[page_count]` array is read separately. Not
/// written back as a struct: the C layout has tail padding before the
/// page_start array, so in-place edits go through field offsets.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChainedStartsInSegment {
    /// Size of this structure including the page_start array
    pub size: u32,
    /// Page size (0x1000 or 0x4000)
    pub page_size: u16,
    /// One of the DYLD_CHAINED_PTR_* formats
    pub pointer_format: u16,
    /// Offset of this segment from the image's first segment
    pub segment_offset: u64,
    /// For 32-bit formats, values above this are non-pointers
    pub max_valid_pointer: u32,
    /// Number of page_start entries
    pub page_count: u16,
}

impl ChainedStartsInSegment {
    /// Size of the fixed prefix, up to and including `page_count`.
    pub const PREFIX_SIZE: usize = 22;

    /// Byte offset of the `segment_offset` field, for in-place updates.
    pub const SEGMENT_OFFSET_FIELD: usize = 8;
}

/// A parsed view of the chain-start tables for one image.
#[derive(Debug, Clone)]
pub struct ChainStarts {
    /// Per-segment start info, index-aligned with the image's segments.
    /// `None` when a segment has no fixups.
    pub segments: Vec<Option<SegmentChainStarts>>,
}

/// Chain starts for one segment.
#[derive(Debug, Clone)]
pub struct SegmentChainStarts {
    /// Pointer encoding used in this segment.
    pub pointer_format: u16,
    /// Page size in bytes.
    pub page_size: u16,
    /// Offset of this segment from the image's first segment.
    pub segment_offset: u64,
    /// First-fixup offset per page; DYLD_CHAINED_PTR_START_NONE for pages
    /// with no fixups.
    pub page_starts: Vec<u16>,
    /// Offset of this segment's starts structure within the fixups blob,
    /// used to patch `segment_offset` in place.
    pub starts_offset_in_blob: usize,
}

impl ChainStarts {
    /// Parses the chain-start tables from an LC_DYLD_CHAINED_FIXUPS blob.
    ///
    /// Returns `None` if the blob is truncated.
    pub fn parse(blob: &[u8]) -> Option<ChainStarts> {
        let header = ChainedFixupsHeader::read_from_prefix(blob).ok()?.0;
        let starts_base = header.starts_offset as usize;
        if starts_base + 4 > blob.len() {
            return None;
        }

        let seg_count = crate::util::read_u32_le(&blob[starts_base..]) as usize;
        let mut segments = Vec::with_capacity(seg_count);
        for seg_index in 0..seg_count {
            let entry_offset = starts_base + 4 + seg_index * 4;
            if entry_offset + 4 > blob.len() {
                return None;
            }
            let seg_info_offset = crate::util::read_u32_le(&blob[entry_offset..]) as usize;
            if seg_info_offset == 0 {
                segments.push(None);
                continue;
            }

            let info_offset = starts_base + seg_info_offset;
            let info = ChainedStartsInSegment::read_from_prefix(blob.get(info_offset..)?)
                .ok()?
                .0;
            let mut page_starts = Vec::with_capacity(info.page_count as usize);
            for page in 0..info.page_count as usize {
                let off = info_offset + ChainedStartsInSegment::PREFIX_SIZE + page * 2;
                page_starts.push(read_u16_le(blob.get(off..off + 2)?));
            }
            segments.push(Some(SegmentChainStarts {
                pointer_format: info.pointer_format,
                page_size: info.page_size,
                segment_offset: info.segment_offset,
                page_starts,
                starts_offset_in_blob: info_offset,
            }));
        }

        Some(ChainStarts { segments })
    }

    /// Returns the pointer format of the first segment that has fixups, or 0.
    pub fn pointer_format(&self) -> u16 {
        self.segments
            .iter()
            .flatten()
            .map(|s| s.pointer_format)
            .next()
            .unwrap_or(0)
    }
}

/// Returns the chain stride in bytes for a pointer format.
pub fn chain_stride(pointer_format: u16) -> u64 {
    match pointer_format {
        DYLD_CHAINED_PTR_ARM64E
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => 8,
        DYLD_CHAINED_PTR_ARM64E_KERNEL | DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => 4,
        _ => 4,
    }
}

// =============================================================================
// In-Place Pointer Encodings
// =============================================================================

/// An arm64e chained fixup pointer as stored in segment data.
///
/// Layout (rebase): target:43, high8:8, next:11, bind:1, auth:1.
/// Layout (auth rebase): target:32, diversity:16, addrDiv:1, key:2,
/// next:11, bind:1, auth:1.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Arm64ePointer(pub u64);

impl Arm64ePointer {
    /// Returns true for an authenticated fixup.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Returns true for a bind (rather than a rebase).
    #[inline]
    pub fn is_bind(&self) -> bool {
        (self.0 >> 62) & 1 != 0
    }

    /// Returns the offset to the next fixup, in stride units.
    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 51) & 0x7FF
    }

    /// For plain rebases: the 43-bit target.
    #[inline]
    pub fn rebase_target(&self) -> u64 {
        self.0 & 0x07FF_FFFF_FFFF
    }

    /// For plain rebases: the high8 tag byte.
    #[inline]
    pub fn rebase_high8(&self) -> u8 {
        ((self.0 >> 43) & 0xFF) as u8
    }

    /// For auth rebases: the 32-bit target.
    #[inline]
    pub fn auth_target(&self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    /// For auth rebases: the PAC discriminator.
    #[inline]
    pub fn auth_diversity(&self) -> u16 {
        ((self.0 >> 32) & 0xFFFF) as u16
    }

    /// For auth rebases: the address-diversity flag.
    #[inline]
    pub fn auth_addr_div(&self) -> bool {
        (self.0 >> 48) & 1 != 0
    }

    /// For auth rebases: the signing key.
    #[inline]
    pub fn auth_key(&self) -> u8 {
        ((self.0 >> 49) & 0x3) as u8
    }

    /// Replaces the plain-rebase target, preserving every other field.
    ///
    /// Returns false if `target` does not fit in 43 bits (the slot is left
    /// unchanged; the caller must go through the out-of-band side table).
    #[inline]
    #[must_use]
    pub fn set_rebase_target(&mut self, target: u64) -> bool {
        if target > 0x07FF_FFFF_FFFF {
            return false;
        }
        self.0 = (self.0 & !0x07FF_FFFF_FFFF) | target;
        true
    }

    /// Replaces the auth-rebase target, preserving every other field.
    ///
    /// Returns false if `target` does not fit in 32 bits.
    #[inline]
    #[must_use]
    pub fn set_auth_target(&mut self, target: u64) -> bool {
        if target > 0xFFFF_FFFF {
            return false;
        }
        self.0 = (self.0 & !0xFFFF_FFFF) | target;
        true
    }

    /// For binds: the 16-bit import ordinal (24-bit in USERLAND24).
    #[inline]
    pub fn bind_ordinal(&self, pointer_format: u16) -> u32 {
        if pointer_format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
            (self.0 & 0xFF_FFFF) as u32
        } else {
            (self.0 & 0xFFFF) as u32
        }
    }

    /// For plain binds: the 19-bit addend (zero for auth binds, which have
    /// no addend field).
    #[inline]
    pub fn bind_addend(&self) -> i64 {
        if self.is_auth() {
            return 0;
        }
        let raw = (self.0 >> 32) & 0x7_FFFF;
        // Sign extend from 19 bits
        ((raw as i64) << 45) >> 45
    }
}

/// A generic 64-bit chained fixup pointer as stored in segment data.
///
/// Layout (rebase): target:36, high8:8, reserved:7, next:12, bind:1.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Generic64Pointer(pub u64);

impl Generic64Pointer {
    /// Returns true for a bind (rather than a rebase).
    #[inline]
    pub fn is_bind(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Returns the offset to the next fixup, in 4-byte units.
    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 51) & 0xFFF
    }

    /// The 36-bit rebase target.
    #[inline]
    pub fn rebase_target(&self) -> u64 {
        self.0 & 0x0F_FFFF_FFFF
    }

    /// The high8 tag byte.
    #[inline]
    pub fn rebase_high8(&self) -> u8 {
        ((self.0 >> 36) & 0xFF) as u8
    }

    /// Replaces the rebase target, preserving every other field.
    ///
    /// Returns false if `target` does not fit in 36 bits.
    #[inline]
    #[must_use]
    pub fn set_rebase_target(&mut self, target: u64) -> bool {
        if target > 0x0F_FFFF_FFFF {
            return false;
        }
        self.0 = (self.0 & !0x0F_FFFF_FFFF) | target;
        true
    }

    /// For binds: the 24-bit import ordinal.
    #[inline]
    pub fn bind_ordinal(&self) -> u32 {
        (self.0 & 0xFF_FFFF) as u32
    }

    /// For binds: the 8-bit addend.
    #[inline]
    pub fn bind_addend(&self) -> i64 {
        ((self.0 >> 24) & 0xFF) as i64
    }
}

// =============================================================================
// Import Table
// =============================================================================

/// One entry of the chained-fixups import table, normalized across the
/// three entry formats.
#[derive(Debug, Clone)]
pub struct ChainedImport {
    /// 1-based load-command ordinal of the source dylib; special values are
    /// negative
    pub lib_ordinal: i32,
    /// True for weak imports
    pub weak_import: bool,
    /// Symbol name
    pub symbol_name: String,
    /// Addend from the import entry (formats 2 and 3; otherwise zero)
    pub addend: i64,
}

/// Parses the import table of an LC_DYLD_CHAINED_FIXUPS blob.
pub fn parse_chained_imports(blob: &[u8]) -> Option<Vec<ChainedImport>> {
    let header = ChainedFixupsHeader::read_from_prefix(blob).ok()?.0;
    let symbols = blob.get(header.symbols_offset as usize..)?;
    let imports_base = header.imports_offset as usize;

    let read_name = |name_offset: usize| -> Option<String> {
        let bytes = symbols.get(name_offset..)?;
        let len = crate::util::memchr_null(bytes);
        Some(String::from_utf8_lossy(&bytes[..len]).into_owned())
    };

    let mut imports = Vec::with_capacity(header.imports_count as usize);
    for index in 0..header.imports_count as usize {
        let import = match header.imports_format {
            DYLD_CHAINED_IMPORT => {
                // lib_ordinal:8, weak_import:1, name_offset:23
                let raw = crate::util::read_u32_le(blob.get(imports_base + index * 4..)?);
                ChainedImport {
                    lib_ordinal: (raw & 0xFF) as i8 as i32,
                    weak_import: (raw >> 8) & 1 != 0,
                    symbol_name: read_name((raw >> 9) as usize)?,
                    addend: 0,
                }
            }
            DYLD_CHAINED_IMPORT_ADDEND => {
                // lib_ordinal:8, weak_import:1, name_offset:23, addend:32
                let entry = blob.get(imports_base + index * 8..)?;
                let raw = crate::util::read_u32_le(entry);
                let addend = crate::util::read_u32_le(&entry[4..]) as i32 as i64;
                ChainedImport {
                    lib_ordinal: (raw & 0xFF) as i8 as i32,
                    weak_import: (raw >> 8) & 1 != 0,
                    symbol_name: read_name((raw >> 9) as usize)?,
                    addend,
                }
            }
            DYLD_CHAINED_IMPORT_ADDEND64 => {
                // lib_ordinal:16, weak_import:1, reserved:15, name_offset:32,
                // then a 64-bit addend
                let entry = blob.get(imports_base + index * 16..)?;
                let raw = crate::util::read_u64_le(entry);
                let addend = crate::util::read_u64_le(&entry[8..]) as i64;
                ChainedImport {
                    lib_ordinal: (raw & 0xFFFF) as i16 as i32,
                    weak_import: (raw >> 16) & 1 != 0,
                    symbol_name: read_name((raw >> 32) as usize)?,
                    addend,
                }
            }
            _ => return None,
        };
        imports.push(import);
    }
    Some(imports)
}

/// A generic 32-bit chained fixup pointer.
///
/// Layout (rebase): target:26, next:5, bind:1.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Generic32Pointer(pub u32);

impl Generic32Pointer {
    /// Returns true for a bind (rather than a rebase).
    #[inline]
    pub fn is_bind(&self) -> bool {
        (self.0 >> 31) & 1 != 0
    }

    /// The 26-bit rebase target.
    #[inline]
    pub fn rebase_target(&self) -> u32 {
        self.0 & 0x03FF_FFFF
    }

    /// Clears the rebase target, preserving chain bits.
    #[inline]
    pub fn clear_rebase_target(&mut self) {
        self.0 &= !0x03FF_FFFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm64e_rebase_fields() {
        // auth=0 bind=0 next=3 high8=0x12 target=0x4000
        let raw = (3u64 << 51) | (0x12u64 << 43) | 0x4000;
        let ptr = Arm64ePointer(raw);
        assert!(!ptr.is_auth());
        assert!(!ptr.is_bind());
        assert_eq!(ptr.next(), 3);
        assert_eq!(ptr.rebase_high8(), 0x12);
        assert_eq!(ptr.rebase_target(), 0x4000);
    }

    #[test]
    fn test_arm64e_auth_fields() {
        // auth=1 bind=0 next=1 key=2 addrDiv=1 diversity=0xBEEF target=0x1000
        let raw = (1u64 << 63) | (1u64 << 51) | (2u64 << 49) | (1u64 << 48) | (0xBEEFu64 << 32) | 0x1000;
        let ptr = Arm64ePointer(raw);
        assert!(ptr.is_auth());
        assert_eq!(ptr.auth_key(), 2);
        assert!(ptr.auth_addr_div());
        assert_eq!(ptr.auth_diversity(), 0xBEEF);
        assert_eq!(ptr.auth_target(), 0x1000);
    }

    #[test]
    fn test_set_rebase_target_preserves_chain() {
        let raw = (5u64 << 51) | 0x100;
        let mut ptr = Arm64ePointer(raw);
        assert!(ptr.set_rebase_target(0x1_8000_4000));
        assert_eq!(ptr.next(), 5);
        assert_eq!(ptr.rebase_target(), 0x1_8000_4000);

        // 44-bit value does not fit in the 43-bit field
        assert!(!ptr.set_rebase_target(1u64 << 43));
        assert_eq!(ptr.rebase_target(), 0x1_8000_4000);
    }

    #[test]
    fn test_generic64_fields() {
        let raw = (1u64 << 63) | (7u64 << 51) | (0xABu64 << 36) | 0x2345;
        let ptr = Generic64Pointer(raw);
        assert!(ptr.is_bind());
        assert_eq!(ptr.next(), 7);
        assert_eq!(ptr.rebase_high8(), 0xAB);
        assert_eq!(ptr.rebase_target(), 0x2345);
    }

    #[test]
    fn test_generic64_target_overflow() {
        let mut ptr = Generic64Pointer(0);
        assert!(ptr.set_rebase_target(0x0F_FFFF_FFFF));
        assert!(!ptr.set_rebase_target(0x10_0000_0000));
    }

    #[test]
    fn test_chain_stride() {
        assert_eq!(chain_stride(DYLD_CHAINED_PTR_ARM64E), 8);
        assert_eq!(chain_stride(DYLD_CHAINED_PTR_64), 4);
        assert_eq!(chain_stride(DYLD_CHAINED_PTR_64_OFFSET), 4);
    }
}
