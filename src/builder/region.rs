//! Output image regions and chunks.
//!
//! The output cache is a sequence of regions, each a contiguous slab with
//! homogeneous protection. A region owns its backing buffer, an ordered list
//! of chunks carved out of that buffer, and the fixup tracker for pointers
//! written into it.

use crate::builder::tracker::FixupTracker;
use crate::types::{CacheFileOffset, CacheFileSize, CacheVMAddress, CacheVMSize, VMOffset};
use crate::util::align_up;

/// Protection class of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Executable text.
    Text,
    /// Read-only data that is dirtied once at launch (e.g. __DATA_CONST).
    DataConst,
    /// Writable data.
    Data,
    /// Authenticated pointers, read-only after fixup (e.g. __AUTH_CONST).
    AuthConst,
    /// Authenticated writable data.
    Auth,
    /// Linkedit.
    LinkEdit,
    /// Read-only metadata produced by the builder itself.
    ReadOnly,
}

impl RegionKind {
    /// Returns true if pointers in this region must be tracked for ASLR.
    pub fn holds_fixups(self) -> bool {
        matches!(
            self,
            RegionKind::DataConst | RegionKind::Data | RegionKind::AuthConst | RegionKind::Auth
        )
    }
}

/// What one chunk of a region contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkKind {
    /// A copied dylib segment.
    DylibSegment {
        /// Index of the owning dylib in the build's dylib arena
        dylib_index: usize,
        /// Index of the segment within that dylib
        segment_index: usize,
    },
    /// One dylib's relocated linkedit pieces, packed back to back.
    DylibLinkedit {
        /// Index of the owning dylib in the build's dylib arena
        dylib_index: usize,
    },
    /// Symbol table nlist entries.
    SymbolNlist,
    /// Symbol string pool.
    SymbolStrings,
    /// Indirect symbol table.
    IndirectSymbols,
    /// Export trie for one dylib.
    ExportTrie,
    /// Function starts for one dylib.
    FunctionStarts,
    /// Data-in-code for one dylib.
    DataInCode,
    /// Deduplicated GOT slots shared by every dylib in this image.
    UniquedGots,
    /// Deduplicated authenticated GOT slots.
    UniquedAuthGots,
    /// Function-variant GOT slots, resolved at load time.
    FunctionVariantGots,
    /// Interned ObjC class name strings.
    ObjcClassNames,
    /// Interned ObjC method name strings.
    ObjcMethodNames,
    /// Interned ObjC method type strings.
    ObjcMethodTypes,
    /// The cache-wide patch table.
    PatchTable,
    /// Space reserved for later population.
    DynamicReserve,
}

/// The smallest addressable unit in a region.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// What the chunk holds
    pub kind: ChunkKind,
    /// Required alignment in bytes
    pub alignment: u64,
    /// Destination VM address
    pub vm_address: CacheVMAddress,
    /// Destination VM size
    pub vm_size: CacheVMSize,
    /// Destination file offset
    pub file_offset: CacheFileOffset,
    /// Destination file size
    pub file_size: CacheFileSize,
    /// Byte offset of the chunk's content within its region's buffer
    pub region_offset: usize,
}

/// One contiguous slab of the output image.
#[derive(Debug)]
pub struct Region {
    /// Protection class
    pub kind: RegionKind,
    /// Base VM address of the region
    pub vm_address: CacheVMAddress,
    /// Base file offset of the region
    pub file_offset: CacheFileOffset,
    /// Backing buffer; grows as chunks are allocated
    pub buffer: Vec<u8>,
    /// Ordered chunks carved out of the buffer
    pub chunks: Vec<Chunk>,
    /// ASLR tracker bound to this region once layout is final
    pub tracker: FixupTracker,
}

impl Region {
    /// Creates an empty region at the given placement.
    pub fn new(kind: RegionKind, vm_address: CacheVMAddress, file_offset: CacheFileOffset) -> Self {
        Self {
            kind,
            vm_address,
            file_offset,
            buffer: Vec::new(),
            chunks: Vec::new(),
            tracker: FixupTracker::new(),
        }
    }

    /// Appends a chunk of `size` bytes, padding the buffer to `alignment`
    /// first. Returns the chunk's index.
    pub fn allocate_chunk(&mut self, kind: ChunkKind, size: u64, alignment: u64) -> usize {
        let aligned = align_up(self.buffer.len() as u64, alignment) as usize;
        self.buffer.resize(aligned + size as usize, 0);

        let chunk = Chunk {
            kind,
            alignment,
            vm_address: self.vm_address + VMOffset::new(aligned as u64),
            vm_size: CacheVMSize::new(size),
            file_offset: self.file_offset + CacheFileSize::new(aligned as u64),
            file_size: CacheFileSize::new(size),
            region_offset: aligned,
        };
        self.chunks.push(chunk);
        self.chunks.len() - 1
    }

    /// Finishes layout: binds the tracker to the final extent.
    ///
    /// Regions that never hold pointers get a disabled tracker so stray
    /// queries still succeed.
    pub fn seal(&mut self) {
        self.tracker.set_region(self.vm_address, self.buffer.len() as u64);
        if !self.kind.holds_fixups() {
            self.tracker.disable();
        }
    }

    /// Returns the region's VM size.
    pub fn vm_size(&self) -> CacheVMSize {
        CacheVMSize::new(self.buffer.len() as u64)
    }

    /// Returns true if the VM address falls inside this region.
    pub fn contains(&self, addr: CacheVMAddress) -> bool {
        addr.is_within(self.vm_address, self.vm_size())
    }

    /// Returns the bytes of a chunk.
    pub fn chunk_bytes(&self, chunk_index: usize) -> &[u8] {
        let chunk = &self.chunks[chunk_index];
        &self.buffer[chunk.region_offset..chunk.region_offset + chunk.file_size.raw() as usize]
    }

    /// Returns the mutable bytes of a chunk.
    pub fn chunk_bytes_mut(&mut self, chunk_index: usize) -> &mut [u8] {
        let chunk = &self.chunks[chunk_index];
        let range = chunk.region_offset..chunk.region_offset + chunk.file_size.raw() as usize;
        &mut self.buffer[range]
    }

    /// Returns the buffer and the tracker together, for callers that write
    /// pointers and record them in one pass.
    pub fn buffer_and_tracker(&mut self) -> (&mut [u8], &mut FixupTracker) {
        (&mut self.buffer, &mut self.tracker)
    }
}

/// Finds the region containing a VM address.
pub fn region_index_for_addr(regions: &[Region], addr: CacheVMAddress) -> Option<usize> {
    regions.iter().position(|r| r.contains(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_allocation_respects_alignment() {
        let mut region = Region::new(
            RegionKind::Data,
            CacheVMAddress::new(0x1_8000_0000),
            CacheFileOffset::new(0x4000),
        );

        let a = region.allocate_chunk(ChunkKind::SymbolNlist, 10, 8);
        let b = region.allocate_chunk(ChunkKind::UniquedGots, 32, 16);

        assert_eq!(region.chunks[a].region_offset, 0);
        assert_eq!(region.chunks[b].region_offset, 16);
        assert_eq!(region.chunks[b].vm_address.raw(), 0x1_8000_0010);
        assert_eq!(region.chunks[b].file_offset.raw(), 0x4010);
        assert_eq!(region.buffer.len(), 48);
    }

    #[test]
    fn test_seal_binds_tracker() {
        let mut region = Region::new(
            RegionKind::Data,
            CacheVMAddress::new(0x1_8000_0000),
            CacheFileOffset::new(0),
        );
        region.allocate_chunk(ChunkKind::UniquedGots, 0x100, 8);
        region.seal();

        region.tracker.add(CacheVMAddress::new(0x1_8000_0040));
        assert!(region.tracker.has(CacheVMAddress::new(0x1_8000_0040)));
    }

    #[test]
    fn test_text_region_tracker_disabled() {
        let mut region = Region::new(
            RegionKind::Text,
            CacheVMAddress::new(0x1_8000_0000),
            CacheFileOffset::new(0),
        );
        region.allocate_chunk(
            ChunkKind::DylibSegment {
                dylib_index: 0,
                segment_index: 0,
            },
            0x100,
            0x1000,
        );
        region.seal();

        // Disabled trackers report everything as tracked
        assert!(region.tracker.has(CacheVMAddress::new(0x1_8000_0000)));
    }

    #[test]
    fn test_region_lookup() {
        let mut a = Region::new(
            RegionKind::Text,
            CacheVMAddress::new(0x1_8000_0000),
            CacheFileOffset::new(0),
        );
        a.allocate_chunk(
            ChunkKind::DylibSegment {
                dylib_index: 0,
                segment_index: 0,
            },
            0x1000,
            0x1000,
        );
        let mut b = Region::new(
            RegionKind::Data,
            CacheVMAddress::new(0x1_9000_0000),
            CacheFileOffset::new(0x1000),
        );
        b.allocate_chunk(ChunkKind::UniquedGots, 0x1000, 8);

        let regions = vec![a, b];
        assert_eq!(
            region_index_for_addr(&regions, CacheVMAddress::new(0x1_8000_0800)),
            Some(0)
        );
        assert_eq!(
            region_index_for_addr(&regions, CacheVMAddress::new(0x1_9000_0800)),
            Some(1)
        );
        assert_eq!(
            region_index_for_addr(&regions, CacheVMAddress::new(0x2_0000_0000)),
            None
        );
    }
}
