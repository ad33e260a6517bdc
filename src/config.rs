//! Builder configuration.
//!
//! Policy that varies per build target is carried in an explicit struct
//! passed to the components that need it, never in module-level globals.

use crate::types::CacheVMAddress;

/// Target pointer layout for the output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerFormat {
    /// 32-bit cache-relative offsets.
    Cache32,
    /// 64-bit packed pointers (regular and authenticated variants).
    Cache64,
}

/// Configuration for one cache build.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Base VM address the merged cache is linked at.
    pub cache_base_address: CacheVMAddress,
    /// Pointer layout written into the output image.
    pub pointer_format: PointerFormat,
    /// Whether the target architecture carries tag bits in the pointer high
    /// nibble (arm64/arm64_32). Controls the masked retry when resolving
    /// slides for tagged addresses.
    pub mask_pointer_high_bits: bool,
    /// Disables ASLR tracking entirely. Used for non-relocatable outputs;
    /// trackers report every location as tracked.
    pub track_aslr: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            cache_base_address: CacheVMAddress::new(0x1_8000_0000),
            pointer_format: PointerFormat::Cache64,
            mask_pointer_high_bits: true,
            track_aslr: true,
        }
    }
}

impl BuilderConfig {
    /// Returns a config for an arm64e-style build at the default base.
    pub fn arm64e() -> Self {
        Self::default()
    }

    /// Returns a config for a 32-bit cache layout.
    pub fn cache32(base: CacheVMAddress) -> Self {
        Self {
            cache_base_address: base,
            pointer_format: PointerFormat::Cache32,
            mask_pointer_high_bits: false,
            track_aslr: true,
        }
    }
}
