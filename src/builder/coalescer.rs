//! Section coalescing.
//!
//! Many dylibs carry byte-identical content: GOT slots binding the same
//! symbol of the same dylib with the same pointer metadata, and interned
//! ObjC strings. The coalescer merges those across every dylib destined for
//! one output image, so each distinct value is stored exactly once, and
//! hands each contributing dylib a map from its original section offsets to
//! offsets in the shared buffer.

use std::collections::{HashMap, HashSet};

use crate::macho::PointerMetaData;
use crate::types::{CacheVMAddress, CacheVMSize, VMOffset};

// =============================================================================
// Per-Dylib View
// =============================================================================

/// Which cache-wide coalesced section a per-dylib section feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescedSectionKind {
    /// __TEXT,__objc_classname
    ObjcClassNames,
    /// __TEXT,__objc_methname
    ObjcMethodNames,
    /// __TEXT,__objc_methtype
    ObjcMethodTypes,
    /// __DATA_CONST,__got
    Gots,
    /// __AUTH_CONST,__auth_got
    AuthGots,
}

/// One dylib section that was (fully or partially) coalesced.
///
/// A section may be completely coalesced and removed (strings), or coalesced
/// with the original copy kept in place (GOTs).
#[derive(Debug)]
pub struct OptimizedSection {
    /// Map from offset in the dylib's copy of the section to the assigned
    /// offset in the shared buffer.
    pub offset_map: HashMap<u32, u32>,
    /// Offsets that were seen but intentionally left unoptimized (e.g. GOT
    /// rebases, as opposed to binds). Tracked only so completeness can be
    /// asserted.
    pub unoptimized_offsets: HashSet<u32>,
    /// Whether the original section disappears from the dylib.
    pub section_will_be_removed: bool,
    /// Display name.
    pub name: &'static str,
    /// Which shared section the offsets point into.
    pub kind: CoalescedSectionKind,
    /// Index of the segment holding this section in the dylib.
    pub segment_index: Option<u32>,
    /// Offset of the section within that segment.
    pub section_vm_offset_in_segment: VMOffset,
}

impl OptimizedSection {
    fn new(kind: CoalescedSectionKind, section_will_be_removed: bool, name: &'static str) -> Self {
        Self {
            offset_map: HashMap::new(),
            unoptimized_offsets: HashSet::new(),
            section_will_be_removed,
            name,
            kind,
            segment_index: None,
            section_vm_offset_in_segment: VMOffset::new(0),
        }
    }

    /// Records that `dylib_offset` in this section now lives at
    /// `cache_offset` in the shared buffer.
    pub fn add_optimized_offset(&mut self, dylib_offset: u32, cache_offset: u32) {
        self.offset_map.insert(dylib_offset, cache_offset);
    }

    /// Records an offset that was seen but deliberately left in place.
    pub fn add_unoptimized_offset(&mut self, dylib_offset: u32) {
        self.unoptimized_offsets.insert(dylib_offset);
    }

    /// True if any offset in this section was redirected.
    pub fn was_optimized(&self) -> bool {
        !self.offset_map.is_empty()
    }
}

/// The per-dylib coalescing state: one slot per section the builder knows
/// how to merge.
#[derive(Debug)]
pub struct DylibSectionCoalescer {
    /// __TEXT,__objc_classname
    pub objc_class_names: OptimizedSection,
    /// __TEXT,__objc_methname
    pub objc_meth_names: OptimizedSection,
    /// __TEXT,__objc_methtype
    pub objc_meth_types: OptimizedSection,
    /// __DATA_CONST,__got
    pub gots: OptimizedSection,
    /// __AUTH_CONST,__auth_got
    pub auth_gots: OptimizedSection,
}

impl Default for DylibSectionCoalescer {
    fn default() -> Self {
        Self {
            objc_class_names: OptimizedSection::new(
                CoalescedSectionKind::ObjcClassNames,
                true,
                "objc class names",
            ),
            objc_meth_names: OptimizedSection::new(
                CoalescedSectionKind::ObjcMethodNames,
                true,
                "objc method names",
            ),
            objc_meth_types: OptimizedSection::new(
                CoalescedSectionKind::ObjcMethodTypes,
                true,
                "objc method types",
            ),
            gots: OptimizedSection::new(CoalescedSectionKind::Gots, false, "gots"),
            auth_gots: OptimizedSection::new(CoalescedSectionKind::AuthGots, false, "auth gots"),
        }
    }
}

impl DylibSectionCoalescer {
    /// Creates an empty coalescer for one dylib.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot handling `(segment_name, section_name)`, if the
    /// builder coalesces that section at all.
    pub fn section(&self, segment_name: &str, section_name: &str) -> Option<&OptimizedSection> {
        // Section names are at most 16 bytes in the file
        let segment_name = &segment_name[..segment_name.len().min(16)];
        let section_name = &section_name[..section_name.len().min(16)];

        match (segment_name, section_name) {
            ("__TEXT", "__objc_classname") => Some(&self.objc_class_names),
            ("__TEXT", "__objc_methname") => Some(&self.objc_meth_names),
            ("__TEXT", "__objc_methtype") => Some(&self.objc_meth_types),
            ("__DATA_CONST", "__got") => Some(&self.gots),
            ("__AUTH_CONST", "__auth_got") => Some(&self.auth_gots),
            _ => None,
        }
    }

    /// Mutable variant of [`DylibSectionCoalescer::section`].
    pub fn section_mut(
        &mut self,
        segment_name: &str,
        section_name: &str,
    ) -> Option<&mut OptimizedSection> {
        let segment_name = &segment_name[..segment_name.len().min(16)];
        let section_name = &section_name[..section_name.len().min(16)];

        match (segment_name, section_name) {
            ("__TEXT", "__objc_classname") => Some(&mut self.objc_class_names),
            ("__TEXT", "__objc_methname") => Some(&mut self.objc_meth_names),
            ("__TEXT", "__objc_methtype") => Some(&mut self.objc_meth_types),
            ("__DATA_CONST", "__got") => Some(&mut self.gots),
            ("__AUTH_CONST", "__auth_got") => Some(&mut self.auth_gots),
            _ => None,
        }
    }

    /// True if the section was optimized and its original copy removed.
    pub fn section_was_removed(&self, segment_name: &str, section_name: &str) -> bool {
        match self.section(segment_name, section_name) {
            Some(section) => section.section_will_be_removed && section.was_optimized(),
            None => false,
        }
    }

    /// True if any offset of the section was redirected to a shared buffer.
    /// The original copy may or may not remain, see
    /// [`DylibSectionCoalescer::section_was_removed`].
    pub fn section_was_optimized(&self, segment_name: &str, section_name: &str) -> bool {
        match self.section(segment_name, section_name) {
            Some(section) => section.was_optimized(),
            None => false,
        }
    }
}

// =============================================================================
// Cache-Wide Strings
// =============================================================================

/// A cache-wide interned string buffer.
#[derive(Debug)]
pub struct CoalescedStringsSection {
    /// Section name, for logging
    pub section_name: &'static str,
    /// Map from string to its offset in the shared buffer
    pub strings_to_offsets: HashMap<String, u32>,
    /// The shared buffer content
    pub buffer: Vec<u8>,
    /// Bytes saved across all contributing dylibs, for logging
    pub saved_space: u64,
    /// VM address of the buffer's chunk, set at placement
    pub chunk_vm_address: Option<CacheVMAddress>,
}

impl CoalescedStringsSection {
    /// Creates an empty string section.
    pub fn new(section_name: &'static str) -> Self {
        Self {
            section_name,
            strings_to_offsets: HashMap::new(),
            buffer: Vec::new(),
            saved_space: 0,
            chunk_vm_address: None,
        }
    }

    /// Interns `value`, returning its offset in the shared buffer.
    pub fn add_string(&mut self, value: &str) -> u32 {
        if let Some(&offset) = self.strings_to_offsets.get(value) {
            self.saved_space += value.len() as u64 + 1;
            return offset;
        }
        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
        self.strings_to_offsets.insert(value.to_string(), offset);
        offset
    }
}

// =============================================================================
// Cache-Wide GOTs
// =============================================================================

/// Identity of one uniqued GOT slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GotKey {
    /// Name of the bound symbol
    pub target_symbol_name: String,
    /// Install name of the dylib exporting the symbol
    pub target_dylib_name: String,
    /// Pointer metadata; two binds with different auth metadata cannot
    /// share a slot
    pub pmd: PointerMetaData,
    /// True when the slot's value is selected at load time; such slots live
    /// in their own chunk and never appear in the fixup stream
    pub is_function_variant: bool,
}

/// Classification of an address inside the uniqued GOT area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotLocation {
    /// The build-time-resolved chunk.
    Regular,
    /// The load-time-resolved function-variant chunk.
    FunctionVariant,
}

/// A cache-wide deduplicated GOT section.
///
/// Slots are handed out in insertion order during the per-dylib phase, then
/// [`CoalescedGOTSection::sort`] assigns the final layout once every dylib
/// has contributed.
#[derive(Debug, Default)]
pub struct CoalescedGOTSection {
    /// Map from slot identity to its current byte offset
    pub got_targets_to_offsets: HashMap<GotKey, u32>,
    /// Pointer size in bytes (4 or 8)
    pointer_size: u32,
    /// True once sort() ran
    sorted: bool,
    /// Number of regular slots, valid after sort()
    regular_count: u32,
    /// Number of function-variant slots, valid after sort()
    function_variant_count: u32,
    /// VM address of the regular chunk, set at placement
    pub regular_chunk_address: Option<CacheVMAddress>,
    /// VM address of the function-variant chunk, set at placement
    pub function_variant_chunk_address: Option<CacheVMAddress>,
}

impl CoalescedGOTSection {
    /// Creates an empty GOT section for the given pointer size.
    pub fn new(pointer_size: u32) -> Self {
        Self {
            pointer_size,
            ..Self::default()
        }
    }

    /// Returns the slot offset for `key`, allocating a new provisional slot
    /// on first sight. The returned offset is only final after
    /// [`CoalescedGOTSection::sort`].
    pub fn add_target(&mut self, key: GotKey) -> u32 {
        debug_assert!(!self.sorted, "GOT targets added after sort");
        let next = self.got_targets_to_offsets.len() as u32 * self.pointer_size;
        *self.got_targets_to_offsets.entry(key).or_insert(next)
    }

    /// Number of distinct slots.
    pub fn len(&self) -> usize {
        self.got_targets_to_offsets.len()
    }

    /// True if no slot was ever added.
    pub fn is_empty(&self) -> bool {
        self.got_targets_to_offsets.is_empty()
    }

    /// Assigns final slot offsets and returns the old-offset to new-offset
    /// remap for distribution back to every contributing dylib.
    ///
    /// Function-variant entries sort after regular entries (they live in a
    /// separate chunk, with offsets restarting at zero), and within each
    /// group slots are ordered by (target dylib name, target symbol name) so
    /// same-target slots land on the same pages. The order is a pure
    /// function of the keys: repeated runs over the same inputs produce the
    /// same layout regardless of hash-map iteration order.
    pub fn sort(&mut self) -> HashMap<u32, u32> {
        let mut keys: Vec<(GotKey, u32)> = self
            .got_targets_to_offsets
            .drain()
            .collect();
        keys.sort_by(|(a, _), (b, _)| {
            (a.is_function_variant, &a.target_dylib_name, &a.target_symbol_name, &a.pmd.diversity, &a.pmd.key)
                .cmp(&(b.is_function_variant, &b.target_dylib_name, &b.target_symbol_name, &b.pmd.diversity, &b.pmd.key))
        });

        let mut remap = HashMap::with_capacity(keys.len());
        let mut regular_index = 0u32;
        let mut fv_index = 0u32;
        for (key, old_offset) in keys {
            let new_offset = if key.is_function_variant {
                let offset = fv_index * self.pointer_size;
                fv_index += 1;
                offset
            } else {
                let offset = regular_index * self.pointer_size;
                regular_index += 1;
                offset
            };
            remap.insert(old_offset, new_offset);
            self.got_targets_to_offsets.insert(key, new_offset);
        }

        self.regular_count = regular_index;
        self.function_variant_count = fv_index;
        self.sorted = true;
        remap
    }

    /// Byte size of the regular chunk. Valid after sort().
    pub fn regular_size(&self) -> CacheVMSize {
        CacheVMSize::new((self.regular_count * self.pointer_size) as u64)
    }

    /// Byte size of the function-variant chunk. Valid after sort().
    pub fn function_variant_size(&self) -> CacheVMSize {
        CacheVMSize::new((self.function_variant_count * self.pointer_size) as u64)
    }

    /// Returns the final cache address of a slot. Valid after sort() and
    /// chunk placement.
    pub fn entry_cache_address(&self, key: &GotKey) -> Option<CacheVMAddress> {
        let offset = *self.got_targets_to_offsets.get(key)?;
        let base = if key.is_function_variant {
            self.function_variant_chunk_address?
        } else {
            self.regular_chunk_address?
        };
        Some(base + VMOffset::new(offset as u64))
    }

    /// Classifies an address as belonging to the regular or the
    /// function-variant chunk.
    ///
    /// # Panics
    ///
    /// An address outside both chunks means the earlier categorization pass
    /// lied about completeness; that is an internal invariant violation, not
    /// an input error.
    pub fn got_location(&self, addr: CacheVMAddress) -> GotLocation {
        if let Some(base) = self.regular_chunk_address {
            if addr.is_within(base, self.regular_size()) {
                return GotLocation::Regular;
            }
        }
        if let Some(base) = self.function_variant_chunk_address {
            if addr.is_within(base, self.function_variant_size()) {
                return GotLocation::FunctionVariant;
            }
        }
        panic!(
            "address {:#x} is not in any uniqued GOT chunk",
            addr.raw()
        );
    }

    /// True if the slot at `addr` belongs in the pointer-fixup stream.
    /// Function-variant slots are computed at load time, so they are never
    /// emitted.
    pub fn should_emit_got(&self, addr: CacheVMAddress) -> bool {
        self.got_location(addr) == GotLocation::Regular
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dylib: &str, symbol: &str) -> GotKey {
        GotKey {
            target_symbol_name: symbol.to_string(),
            target_dylib_name: dylib.to_string(),
            pmd: PointerMetaData::PLAIN,
            is_function_variant: false,
        }
    }

    #[test]
    fn test_string_interning() {
        let mut strings = CoalescedStringsSection::new("objc method names");
        let a = strings.add_string("alloc");
        let b = strings.add_string("init");
        let a2 = strings.add_string("alloc");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(&strings.buffer[a as usize..a as usize + 6], b"alloc\0");
        assert_eq!(strings.saved_space, 6);
    }

    #[test]
    fn test_got_dedup() {
        let mut gots = CoalescedGOTSection::new(8);
        let a = gots.add_target(key("/usr/lib/liba.dylib", "_malloc"));
        let b = gots.add_target(key("/usr/lib/libb.dylib", "_free"));
        let a2 = gots.add_target(key("/usr/lib/liba.dylib", "_malloc"));
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(gots.len(), 2);
    }

    #[test]
    fn test_got_metadata_splits_slots() {
        let mut gots = CoalescedGOTSection::new(8);
        let plain = gots.add_target(key("/usr/lib/liba.dylib", "_malloc"));
        let mut auth_key = key("/usr/lib/liba.dylib", "_malloc");
        auth_key.pmd = PointerMetaData::auth(7, true, 0);
        let auth = gots.add_target(auth_key);
        assert_ne!(plain, auth);
    }

    #[test]
    fn test_sort_deterministic_and_ordered() {
        let build = |insert_order: &[(&str, &str)]| {
            let mut gots = CoalescedGOTSection::new(8);
            for (dylib, symbol) in insert_order {
                gots.add_target(key(dylib, symbol));
            }
            gots.sort();
            let mut final_offsets: Vec<(String, u32)> = gots
                .got_targets_to_offsets
                .iter()
                .map(|(k, v)| (format!("{}/{}", k.target_dylib_name, k.target_symbol_name), *v))
                .collect();
            final_offsets.sort();
            final_offsets
        };

        let order1 = build(&[("libb", "_x"), ("liba", "_z"), ("liba", "_a")]);
        let order2 = build(&[("liba", "_a"), ("libb", "_x"), ("liba", "_z")]);
        assert_eq!(order1, order2);

        // (dylib, symbol) ordering: liba/_a < liba/_z < libb/_x
        assert_eq!(order1, vec![
            ("liba/_a".to_string(), 0),
            ("liba/_z".to_string(), 8),
            ("libb/_x".to_string(), 16),
        ]);
    }

    #[test]
    fn test_sort_function_variants_last() {
        let mut gots = CoalescedGOTSection::new(8);
        let mut fv = key("liba", "_variant");
        fv.is_function_variant = true;
        gots.add_target(fv.clone());
        gots.add_target(key("libz", "_plain"));
        let remap = gots.sort();
        assert_eq!(remap.len(), 2);

        // The single regular entry lands at offset 0 of the regular chunk,
        // the variant at offset 0 of its own chunk
        assert_eq!(gots.regular_size().raw(), 8);
        assert_eq!(gots.function_variant_size().raw(), 8);
        assert_eq!(gots.got_targets_to_offsets[&fv], 0);
    }

    #[test]
    fn test_got_location_classification() {
        let mut gots = CoalescedGOTSection::new(8);
        gots.add_target(key("liba", "_a"));
        let mut fv = key("liba", "_v");
        fv.is_function_variant = true;
        gots.add_target(fv);
        gots.sort();

        gots.regular_chunk_address = Some(CacheVMAddress::new(0x1_9000_0000));
        gots.function_variant_chunk_address = Some(CacheVMAddress::new(0x1_9000_1000));

        assert_eq!(
            gots.got_location(CacheVMAddress::new(0x1_9000_0000)),
            GotLocation::Regular
        );
        assert!(gots.should_emit_got(CacheVMAddress::new(0x1_9000_0000)));
        assert_eq!(
            gots.got_location(CacheVMAddress::new(0x1_9000_1000)),
            GotLocation::FunctionVariant
        );
        assert!(!gots.should_emit_got(CacheVMAddress::new(0x1_9000_1000)));
    }

    #[test]
    #[should_panic(expected = "not in any uniqued GOT chunk")]
    fn test_got_location_outside_panics() {
        let mut gots = CoalescedGOTSection::new(8);
        gots.add_target(key("liba", "_a"));
        gots.sort();
        gots.regular_chunk_address = Some(CacheVMAddress::new(0x1_9000_0000));
        gots.got_location(CacheVMAddress::new(0x2_0000_0000));
    }

    #[test]
    fn test_dylib_section_lookup() {
        let mut coalescer = DylibSectionCoalescer::new();
        assert!(coalescer.section("__TEXT", "__objc_methname").is_some());
        assert!(coalescer.section("__DATA_CONST", "__got").is_some());
        assert!(coalescer.section("__DATA", "__data").is_none());

        assert!(!coalescer.section_was_optimized("__DATA_CONST", "__got"));
        coalescer
            .section_mut("__DATA_CONST", "__got")
            .unwrap()
            .add_optimized_offset(0x10, 0x0);
        assert!(coalescer.section_was_optimized("__DATA_CONST", "__got"));
        // GOTs are optimized but the original section stays
        assert!(!coalescer.section_was_removed("__DATA_CONST", "__got"));

        coalescer
            .section_mut("__TEXT", "__objc_methname")
            .unwrap()
            .add_optimized_offset(0, 0);
        assert!(coalescer.section_was_removed("__TEXT", "__objc_methname"));
    }
}
