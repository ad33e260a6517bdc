//! Per-dylib build records.
//!
//! Every input dylib becomes a [`CacheDylib`] in the build's arena. Records
//! refer to each other by stable arena index, never by reference: dylib
//! storage is reallocated as the arena grows, so an index is the only handle
//! that stays valid across the whole build.

use std::collections::HashMap;

use crate::types::{
    CacheFileOffset, CacheFileSize, CacheVMAddress, CacheVMSize, InputVMAddress, InputVMSize,
    VMOffset,
};

/// How a dylib depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentKind {
    /// Regular LC_LOAD_DYLIB.
    Normal,
    /// LC_LOAD_WEAK_DYLIB.
    WeakLink,
    /// LC_REEXPORT_DYLIB.
    Reexport,
    /// LC_LOAD_UPWARD_DYLIB.
    Upward,
}

/// One linked-dylib edge, resolved to the arena.
#[derive(Debug, Clone)]
pub struct DependentDylib {
    /// Dependency kind
    pub kind: DependentKind,
    /// Arena index of the dependency; `None` when the dependency is not part
    /// of this cache
    pub dylib_index: Option<usize>,
    /// Install name as written in the load command
    pub install_name: String,
}

/// What a bind target resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTargetKind {
    /// An absolute value, not subject to sliding.
    Absolute {
        /// The literal value
        value: u64,
    },
    /// A symbol in an input dylib that has not been placed yet.
    InputImage {
        /// Offset of the symbol from the target dylib's base
        target_runtime_offset: VMOffset,
        /// Arena index of the target dylib
        dylib_index: usize,
        /// True for weak definitions
        is_weak_def: bool,
    },
    /// A symbol in a dylib that has been placed in the cache.
    CacheImage {
        /// Offset of the symbol from the target dylib's cache base
        target_runtime_offset: VMOffset,
        /// Arena index of the target dylib
        dylib_index: usize,
        /// True for weak definitions
        is_weak_def: bool,
        /// True when the slot's final value is chosen at load time
        is_function_variant: bool,
    },
}

/// One resolved bind target of a dylib.
#[derive(Debug, Clone)]
pub struct BindTarget {
    /// What the bind resolves to
    pub kind: BindTargetKind,
    /// Signed addend applied at the use site
    pub addend: i64,
    /// True for weak imports (missing target is not an error)
    pub is_weak_import: bool,
    /// Symbol name, kept for the patch table's export-name pool
    pub name: String,
}

impl BindTarget {
    /// Returns the target's cache VM address, when it points into a placed
    /// dylib.
    pub fn cache_vm_address(&self, dylibs: &[CacheDylib]) -> Option<CacheVMAddress> {
        match &self.kind {
            BindTargetKind::CacheImage {
                target_runtime_offset,
                dylib_index,
                ..
            } => Some(dylibs[*dylib_index].cache_load_address + *target_runtime_offset),
            _ => None,
        }
    }
}

/// Where one segment of a dylib was placed in the cache.
#[derive(Debug, Clone)]
pub struct MovedSegment {
    /// Segment name
    pub name: String,
    /// Original address in the input dylib
    pub input_vm_address: InputVMAddress,
    /// Original VM size
    pub input_vm_size: InputVMSize,
    /// New address in the cache
    pub cache_vm_address: CacheVMAddress,
    /// New VM size (may include cache padding)
    pub cache_vm_size: CacheVMSize,
    /// New file offset in the cache
    pub cache_file_offset: CacheFileOffset,
    /// New file size
    pub cache_file_size: CacheFileSize,
    /// Region holding the copied bytes
    pub region_index: usize,
    /// Offset of the copied bytes within that region's buffer
    pub region_offset: usize,
}

impl MovedSegment {
    /// Slide applied to this segment: new address minus old address.
    pub fn slide(&self) -> i64 {
        self.cache_vm_address.raw() as i64 - self.input_vm_address.raw() as i64
    }
}

/// The linkedit pieces the builder relocates for each dylib.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovedLinkeditKind {
    /// nlist entries
    SymbolNlist,
    /// Symbol string pool
    SymbolStrings,
    /// Indirect symbol table
    IndirectSymbols,
    /// Export trie
    ExportTrie,
    /// Function starts
    FunctionStarts,
    /// Data-in-code records
    DataInCode,
}

/// Where one linkedit piece landed in the cache.
#[derive(Debug, Clone)]
pub struct MovedLinkedit {
    /// New file offset, written into the owning load command
    pub cache_file_offset: CacheFileOffset,
    /// Size in bytes
    pub size: u32,
    /// Region holding the bytes
    pub region_index: usize,
    /// Offset within that region's buffer
    pub region_offset: usize,
}

/// Map from linkedit piece to its new placement.
pub type MovedLinkeditMap = HashMap<MovedLinkeditKind, MovedLinkedit>;

/// New symbol-table partition after the nlist was optimized.
#[derive(Debug, Clone, Copy, Default)]
pub struct NListInfo {
    /// First local symbol index
    pub locals_start_index: u32,
    /// Number of local symbols
    pub locals_count: u32,
    /// First global symbol index
    pub globals_start_index: u32,
    /// Number of global symbols
    pub globals_count: u32,
    /// First undefined symbol index
    pub undefs_start_index: u32,
    /// Number of undefined symbols
    pub undefs_count: u32,
}

/// One dylib being merged into the cache.
#[derive(Debug)]
pub struct CacheDylib {
    /// Stable index of this dylib in the build's arena
    pub cache_index: usize,
    /// Install name
    pub install_name: String,
    /// Address of the dylib's mach header in the cache
    pub cache_load_address: CacheVMAddress,
    /// Placement of each segment, in load-command order
    pub segments: Vec<MovedSegment>,
    /// Placement of each relocated linkedit piece
    pub linkedit: MovedLinkeditMap,
    /// Symbol table partition
    pub nlist_info: NListInfo,
    /// Dependencies, in load-command order (bind ordinals index this)
    pub dependents: Vec<DependentDylib>,
    /// Resolved bind targets, in bind-ordinal order
    pub bind_targets: Vec<BindTarget>,
}

impl CacheDylib {
    /// Returns the leaf name of the install name.
    pub fn leaf_name(&self) -> &str {
        self.install_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.install_name)
    }

    /// Translates an input VM address to its cache address via the placed
    /// segments.
    pub fn adjust_vm_addr(&self, input_addr: InputVMAddress) -> Option<CacheVMAddress> {
        for segment in &self.segments {
            if input_addr.is_within(segment.input_vm_address, segment.input_vm_size) {
                let offset = input_addr - segment.input_vm_address;
                return Some(segment.cache_vm_address + offset);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dylib_with_segment() -> CacheDylib {
        CacheDylib {
            cache_index: 0,
            install_name: "/usr/lib/libfoo.dylib".to_string(),
            cache_load_address: CacheVMAddress::new(0x1_8000_0000),
            segments: vec![MovedSegment {
                name: "__TEXT".to_string(),
                input_vm_address: InputVMAddress::new(0x1000),
                input_vm_size: InputVMSize::new(0x4000),
                cache_vm_address: CacheVMAddress::new(0x1_8000_0000),
                cache_vm_size: CacheVMSize::new(0x4000),
                cache_file_offset: CacheFileOffset::new(0),
                cache_file_size: CacheFileSize::new(0x4000),
                region_index: 0,
                region_offset: 0,
            }],
            linkedit: MovedLinkeditMap::new(),
            nlist_info: NListInfo::default(),
            dependents: Vec::new(),
            bind_targets: Vec::new(),
        }
    }

    #[test]
    fn test_leaf_name() {
        let dylib = dylib_with_segment();
        assert_eq!(dylib.leaf_name(), "libfoo.dylib");
    }

    #[test]
    fn test_segment_slide() {
        let dylib = dylib_with_segment();
        assert_eq!(dylib.segments[0].slide(), 0x1_8000_0000 - 0x1000);
    }

    #[test]
    fn test_adjust_vm_addr() {
        let dylib = dylib_with_segment();
        let adjusted = dylib.adjust_vm_addr(InputVMAddress::new(0x1100)).unwrap();
        assert_eq!(adjusted.raw(), 0x1_8000_0100);
        assert!(dylib.adjust_vm_addr(InputVMAddress::new(0x9000)).is_none());
    }

    #[test]
    fn test_bind_target_cache_address() {
        let dylibs = vec![dylib_with_segment()];
        let bind = BindTarget {
            kind: BindTargetKind::CacheImage {
                target_runtime_offset: VMOffset::new(0x100),
                dylib_index: 0,
                is_weak_def: false,
                is_function_variant: false,
            },
            addend: 0,
            is_weak_import: false,
            name: "_foo".to_string(),
        };
        assert_eq!(
            bind.cache_vm_address(&dylibs).unwrap().raw(),
            0x1_8000_0100
        );

        let absolute = BindTarget {
            kind: BindTargetKind::Absolute { value: 42 },
            addend: 0,
            is_weak_import: false,
            name: "_abs".to_string(),
        };
        assert!(absolute.cache_vm_address(&dylibs).is_none());
    }
}
