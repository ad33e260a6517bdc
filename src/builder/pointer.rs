//! Packed pointer codecs for the output image.
//!
//! Pointers written into the cache are packed so the side tables on the
//! fixup tracker stay small: the in-place slot carries the target's
//! cache-relative offset plus authentication metadata, and only targets
//! that do not fit the offset field spill to the tracker's out-of-band
//! maps. Chain "next" bits are not packed here; there is no room for them.
//!
//! Two layouts exist, selected by the target pointer width:
//!
//! - [`Cache32`]: the whole 32-bit slot is a VM offset from the cache base.
//! - [`Cache64`]: bit 63 selects between a regular pointer
//!   (44-bit offset + 8-bit high tag) and an authenticated pointer
//!   (44-bit offset + 16-bit diversity + 2-bit key + address-diversity bit).

use crate::macho::PointerMetaData;
use crate::types::{CacheVMAddress, VMOffset};
use crate::util::{read_u32_le, read_u64_le, write_u32_le, write_u64_le};

/// Maximum value representable in the 44-bit cache offset field.
const CACHE64_OFFSET_MAX: u64 = (1 << 44) - 1;

// =============================================================================
// 32-bit Layout
// =============================================================================

/// The 32-bit packed pointer layout: a plain cache-relative VM offset.
pub struct Cache32;

impl Cache32 {
    /// Reads the target cache address encoded at `slot`.
    pub fn cache_vm_address(cache_base: CacheVMAddress, slot: &[u8]) -> CacheVMAddress {
        cache_base + VMOffset::new(read_u32_le(slot) as u64)
    }

    /// Zeroes the slot and writes the target offset.
    ///
    /// Returns false if the offset does not fit in 32 bits; the slot is left
    /// zero and the caller must record the target out of band.
    #[must_use]
    pub fn set_location(
        cache_base: CacheVMAddress,
        slot: &mut [u8],
        target: CacheVMAddress,
    ) -> bool {
        write_u32_le(slot, 0);

        let offset = (target - cache_base).raw();
        if offset > u32::MAX as u64 {
            return false;
        }
        write_u32_le(slot, offset as u32);
        true
    }

    /// Rewrites the target of an already-encoded slot.
    #[must_use]
    pub fn update_location(
        cache_base: CacheVMAddress,
        slot: &mut [u8],
        target: CacheVMAddress,
    ) -> bool {
        let offset = (target - cache_base).raw();
        if offset > u32::MAX as u64 {
            return false;
        }
        write_u32_le(slot, offset as u32);
        true
    }

    /// Returns true if the slot looks unset.
    ///
    /// A zero offset is technically a pointer to the cache header, so this
    /// heuristic cannot distinguish "absent" from that case. Nothing
    /// legitimate points at the cache header, so the ambiguity is accepted
    /// rather than widened into extra state.
    pub fn is_null(slot: &[u8]) -> bool {
        read_u32_le(slot) == 0
    }
}

// =============================================================================
// 64-bit Layout
// =============================================================================

/// A decoded 64-bit packed pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cache64Value {
    /// A plain pointer: 44-bit offset, 8-bit high tag, 11 unused bits.
    Regular {
        /// VM offset from the cache base
        offset: u64,
        /// Top byte of a tagged pointer
        high8: u8,
    },
    /// An authenticated pointer: 44-bit offset plus PAC metadata.
    Authenticated {
        /// VM offset from the cache base
        offset: u64,
        /// PAC discriminator
        diversity: u16,
        /// Signing key
        key: u8,
        /// Whether the address participates in signing
        addr_div: bool,
    },
}

/// The 64-bit packed pointer layout.
pub struct Cache64;

impl Cache64 {
    /// Decodes the packed value at `slot`.
    pub fn read(slot: &[u8]) -> Cache64Value {
        let raw = read_u64_le(slot);
        let offset = raw & CACHE64_OFFSET_MAX;
        if (raw >> 63) & 1 != 0 {
            Cache64Value::Authenticated {
                offset,
                diversity: ((raw >> 44) & 0xFFFF) as u16,
                key: ((raw >> 60) & 0x3) as u8,
                addr_div: (raw >> 62) & 1 != 0,
            }
        } else {
            Cache64Value::Regular {
                offset,
                high8: ((raw >> 44) & 0xFF) as u8,
            }
        }
    }

    fn pack(value: Cache64Value) -> u64 {
        match value {
            Cache64Value::Regular { offset, high8 } => {
                debug_assert!(offset <= CACHE64_OFFSET_MAX);
                offset | ((high8 as u64) << 44)
            }
            Cache64Value::Authenticated {
                offset,
                diversity,
                key,
                addr_div,
            } => {
                debug_assert!(offset <= CACHE64_OFFSET_MAX);
                offset
                    | ((diversity as u64) << 44)
                    | (((key & 0x3) as u64) << 60)
                    | ((addr_div as u64) << 62)
                    | (1u64 << 63)
            }
        }
    }

    /// Reads the target cache address encoded at `slot`, dispatching on the
    /// discriminant bit.
    pub fn cache_vm_address(cache_base: CacheVMAddress, slot: &[u8]) -> CacheVMAddress {
        let offset = match Self::read(slot) {
            Cache64Value::Regular { offset, .. } => offset,
            Cache64Value::Authenticated { offset, .. } => offset,
        };
        cache_base + VMOffset::new(offset)
    }

    /// Zeroes the slot, then packs the target with the given metadata.
    ///
    /// Returns false if the target's offset from the cache base does not fit
    /// the 44-bit field; the slot is left zero and the caller must record
    /// the full target on the fixup tracker instead. The write is verified
    /// by re-reading the slot, so a value can never be silently truncated.
    #[must_use]
    pub fn set_location(
        cache_base: CacheVMAddress,
        slot: &mut [u8],
        target: CacheVMAddress,
        pmd: PointerMetaData,
    ) -> bool {
        // The slot aliases both variants, so clear all 8 bytes first
        write_u64_le(slot, 0);

        let offset = (target - cache_base).raw();
        if offset > CACHE64_OFFSET_MAX {
            return false;
        }

        let value = if pmd.authenticated {
            Cache64Value::Authenticated {
                offset,
                diversity: pmd.diversity,
                key: pmd.key,
                addr_div: pmd.uses_addr_diversity,
            }
        } else {
            Cache64Value::Regular {
                offset,
                high8: pmd.high8,
            }
        };
        write_u64_le(slot, Self::pack(value));

        // Store-then-reload equality proves the encoding round-trips
        debug_assert_eq!(Self::read(slot), value);
        Self::cache_vm_address(cache_base, slot) == target
    }

    /// Rewrites the offset field of an already-encoded slot, preserving the
    /// variant and its metadata.
    #[must_use]
    pub fn update_location(
        cache_base: CacheVMAddress,
        slot: &mut [u8],
        target: CacheVMAddress,
    ) -> bool {
        let offset = (target - cache_base).raw();
        if offset > CACHE64_OFFSET_MAX {
            return false;
        }

        let raw = read_u64_le(slot);
        write_u64_le(slot, (raw & !CACHE64_OFFSET_MAX) | offset);
        true
    }

    /// Returns the high8 tag of a regular pointer; authenticated pointers
    /// have no tag and report 0.
    pub fn high8(slot: &[u8]) -> u8 {
        match Self::read(slot) {
            Cache64Value::Regular { high8, .. } => high8,
            Cache64Value::Authenticated { .. } => 0,
        }
    }

    /// Returns the authentication metadata of an authenticated pointer.
    pub fn auth_data(slot: &[u8]) -> Option<(u16, bool, u8)> {
        match Self::read(slot) {
            Cache64Value::Regular { .. } => None,
            Cache64Value::Authenticated {
                diversity,
                key,
                addr_div,
                ..
            } => Some((diversity, addr_div, key)),
        }
    }

    /// Returns true if the slot looks unset. Same heuristic and same caveat
    /// as [`Cache32::is_null`]: a genuine zero offset is indistinguishable.
    pub fn is_null(slot: &[u8]) -> bool {
        read_u64_le(slot) & CACHE64_OFFSET_MAX == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: CacheVMAddress = CacheVMAddress::new(0x1_8000_0000);

    #[test]
    fn test_cache32_roundtrip() {
        let mut slot = [0u8; 4];
        let target = CacheVMAddress::new(0x1_8004_2000);
        assert!(Cache32::set_location(BASE, &mut slot, target));
        assert_eq!(Cache32::cache_vm_address(BASE, &slot), target);
        assert!(!Cache32::is_null(&slot));
    }

    #[test]
    fn test_cache32_overflow_rejected() {
        let mut slot = [0u8; 4];
        let target = CacheVMAddress::new(BASE.raw() + (1 << 33));
        assert!(!Cache32::set_location(BASE, &mut slot, target));
        // Rejected writes leave the slot zero, never truncated
        assert!(Cache32::is_null(&slot));
    }

    #[test]
    fn test_cache32_null_ambiguity() {
        // Known limitation: a pointer to the cache header reads as null
        let mut slot = [0u8; 4];
        assert!(Cache32::set_location(BASE, &mut slot, BASE));
        assert!(Cache32::is_null(&slot));
    }

    #[test]
    fn test_cache64_regular_roundtrip() {
        let mut slot = [0u8; 8];
        let target = CacheVMAddress::new(0x1_8765_4320);
        let pmd = PointerMetaData {
            high8: 0x2A,
            ..PointerMetaData::PLAIN
        };
        assert!(Cache64::set_location(BASE, &mut slot, target, pmd));
        assert_eq!(Cache64::cache_vm_address(BASE, &slot), target);
        assert_eq!(Cache64::high8(&slot), 0x2A);
        assert_eq!(Cache64::auth_data(&slot), None);
    }

    #[test]
    fn test_cache64_auth_roundtrip() {
        let mut slot = [0u8; 8];
        let target = CacheVMAddress::new(0x1_8000_1100);
        let pmd = PointerMetaData::auth(0xBEEF, true, 2);
        assert!(Cache64::set_location(BASE, &mut slot, target, pmd));
        assert_eq!(Cache64::cache_vm_address(BASE, &slot), target);
        assert_eq!(Cache64::auth_data(&slot), Some((0xBEEF, true, 2)));
        // The tag byte is not stored for authenticated pointers
        assert_eq!(Cache64::high8(&slot), 0);
    }

    #[test]
    fn test_cache64_discriminant_dispatch() {
        let mut regular = [0u8; 8];
        let mut auth = [0u8; 8];
        let target = CacheVMAddress::new(0x1_8000_2000);
        assert!(Cache64::set_location(BASE, &mut regular, target, PointerMetaData::PLAIN));
        assert!(Cache64::set_location(BASE, &mut auth, target, PointerMetaData::auth(7, false, 0)));

        assert!(matches!(Cache64::read(&regular), Cache64Value::Regular { .. }));
        assert!(matches!(Cache64::read(&auth), Cache64Value::Authenticated { .. }));
    }

    #[test]
    fn test_cache64_offset_overflow_rejected() {
        let mut slot = [0u8; 8];
        // One past the 44-bit field
        let target = CacheVMAddress::new(BASE.raw() + (1u64 << 44));
        assert!(!Cache64::set_location(BASE, &mut slot, target, PointerMetaData::PLAIN));
        assert_eq!(read_u64_le(&slot), 0);
    }

    #[test]
    fn test_cache64_44bit_boundary() {
        let mut slot = [0u8; 8];
        let target = CacheVMAddress::new(BASE.raw() + CACHE64_OFFSET_MAX);
        assert!(Cache64::set_location(BASE, &mut slot, target, PointerMetaData::PLAIN));
        assert_eq!(Cache64::cache_vm_address(BASE, &slot), target);
    }

    #[test]
    fn test_cache64_update_preserves_metadata() {
        let mut slot = [0u8; 8];
        let pmd = PointerMetaData::auth(0x1234, false, 1);
        assert!(Cache64::set_location(BASE, &mut slot, CacheVMAddress::new(0x1_8000_1000), pmd));

        let new_target = CacheVMAddress::new(0x1_8000_9000);
        assert!(Cache64::update_location(BASE, &mut slot, new_target));
        assert_eq!(Cache64::cache_vm_address(BASE, &slot), new_target);
        assert_eq!(Cache64::auth_data(&slot), Some((0x1234, false, 1)));
    }
}
