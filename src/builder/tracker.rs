//! ASLR fixup tracking.
//!
//! Every pointer-sized value written into the output image must be slid by
//! the loader when the cache is mapped at a randomized base. The tracker
//! records which slots of one writable region hold such pointers, using one
//! bit per minimum-alignment slot plus small side maps for the rare targets
//! that cannot be packed into the in-place pointer encoding.

use std::collections::HashMap;

use crate::types::{CacheVMAddress, VMOffset};

/// Shared cache fixups must be at least 4-byte aligned.
const MINIMUM_FIXUP_ALIGNMENT: u64 = 4;

/// Tracks relocatable pointer locations within one writable region.
///
/// A tracker is bound to exactly one region via [`FixupTracker::set_region`].
/// Locations are cache VM addresses inside that region; passing an address
/// outside the region is a programmer error and panics.
///
/// Not internally synchronized. Callers that share a region must serialize.
#[derive(Debug, Default)]
pub struct FixupTracker {
    region_start: CacheVMAddress,
    region_end: CacheVMAddress,
    bitmap: Vec<bool>,
    enabled: bool,
    rebase_target32: HashMap<CacheVMAddress, u32>,
    rebase_target64: HashMap<CacheVMAddress, u64>,
}

impl FixupTracker {
    /// Creates an unbound tracker. [`FixupTracker::set_region`] must be
    /// called before any location is added.
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Binds the tracker to a region of the output image.
    ///
    /// A size that is not a multiple of the minimum fixup alignment is
    /// rounded down: a pointer cannot start in the trailing remainder
    /// anyway.
    pub fn set_region(&mut self, start: CacheVMAddress, mut size: u64) {
        let remainder = size % MINIMUM_FIXUP_ALIGNMENT;
        if remainder != 0 {
            size -= remainder;
        }

        self.region_start = start;
        self.region_end = start + VMOffset::new(size);
        self.bitmap = vec![false; (size / MINIMUM_FIXUP_ALIGNMENT) as usize];
    }

    /// Disables tracking. All mutators become no-ops and [`FixupTracker::has`]
    /// reports every location as tracked. Used when the output does not need
    /// slide info.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    #[inline]
    fn slot(&self, loc: CacheVMAddress) -> usize {
        assert!(
            loc >= self.region_start && loc < self.region_end,
            "fixup location {:#x} outside tracked region [{:#x}, {:#x})",
            loc.raw(),
            self.region_start.raw(),
            self.region_end.raw()
        );
        ((loc - self.region_start).raw() / MINIMUM_FIXUP_ALIGNMENT) as usize
    }

    /// Marks a location as holding a relocatable pointer. Idempotent.
    pub fn add(&mut self, loc: CacheVMAddress) {
        if !self.enabled {
            return;
        }
        let slot = self.slot(loc);
        self.bitmap[slot] = true;
    }

    /// Clears a location. Idempotent. Stale out-of-band entries for a
    /// removed location are left behind; they are simply unused.
    pub fn remove(&mut self, loc: CacheVMAddress) {
        if !self.enabled {
            return;
        }
        let slot = self.slot(loc);
        self.bitmap[slot] = false;
    }

    /// Returns true if the location is tracked. A disabled tracker reports
    /// every location as tracked.
    pub fn has(&self, loc: CacheVMAddress) -> bool {
        if !self.enabled {
            return true;
        }
        self.bitmap[self.slot(loc)]
    }

    /// Records the full 32-bit target for a location whose in-place
    /// encoding cannot hold it.
    pub fn set_rebase_target32(&mut self, loc: CacheVMAddress, target_vmaddr: u32) {
        self.rebase_target32.insert(loc, target_vmaddr);
    }

    /// Records the full 64-bit target for a location whose in-place
    /// encoding cannot hold it.
    pub fn set_rebase_target64(&mut self, loc: CacheVMAddress, target_vmaddr: u64) {
        self.rebase_target64.insert(loc, target_vmaddr);
    }

    /// Returns the out-of-band 32-bit target for a location, if one was set.
    pub fn rebase_target32(&self, loc: CacheVMAddress) -> Option<u32> {
        self.rebase_target32.get(&loc).copied()
    }

    /// Returns the out-of-band 64-bit target for a location, if one was set.
    pub fn rebase_target64(&self, loc: CacheVMAddress) -> Option<u64> {
        self.rebase_target64.get(&loc).copied()
    }

    /// Drops the out-of-band maps, once every chain has been flattened to
    /// its final form.
    pub fn clear_rebase_targets(&mut self) {
        self.rebase_target32.clear();
        self.rebase_target64.clear();
    }

    /// Calls `callback` for each tracked location in ascending address
    /// order. The callback returns `false` to stop early.
    pub fn for_each_fixup(&self, mut callback: impl FnMut(CacheVMAddress) -> bool) {
        for (slot, tracked) in self.bitmap.iter().enumerate() {
            if !tracked {
                continue;
            }
            let loc = self.region_start + VMOffset::new(slot as u64 * MINIMUM_FIXUP_ALIGNMENT);
            if !callback(loc) {
                break;
            }
        }
    }

    /// Returns the number of tracked locations.
    pub fn fixup_count(&self) -> usize {
        self.bitmap.iter().filter(|b| **b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FixupTracker {
        let mut t = FixupTracker::new();
        t.set_region(CacheVMAddress::new(0x1000), 0x100);
        t
    }

    #[test]
    fn test_add_remove_has() {
        let mut t = tracker();
        let loc = CacheVMAddress::new(0x1010);

        assert!(!t.has(loc));
        t.add(loc);
        assert!(t.has(loc));
        t.add(loc); // idempotent
        assert!(t.has(loc));
        t.remove(loc);
        assert!(!t.has(loc));
        t.remove(loc); // idempotent
        assert!(!t.has(loc));
    }

    #[test]
    fn test_unaligned_size_rounds_down() {
        let mut t = FixupTracker::new();
        // 12-byte region with 3 trailing bytes: the tail cannot hold a pointer
        t.set_region(CacheVMAddress::new(0x1000), 15);
        t.add(CacheVMAddress::new(0x1008));
        assert!(t.has(CacheVMAddress::new(0x1008)));
    }

    #[test]
    #[should_panic(expected = "outside tracked region")]
    fn test_out_of_range_add_panics() {
        let mut t = tracker();
        t.add(CacheVMAddress::new(0x2000));
    }

    #[test]
    #[should_panic(expected = "outside tracked region")]
    fn test_out_of_range_has_panics() {
        let t = tracker();
        t.has(CacheVMAddress::new(0xFFF));
    }

    #[test]
    fn test_disabled_reports_tracked() {
        let mut t = tracker();
        t.disable();
        t.add(CacheVMAddress::new(0x1010)); // no-op
        assert!(t.has(CacheVMAddress::new(0x1010)));
        assert!(t.has(CacheVMAddress::new(0x1014)));
        assert_eq!(t.fixup_count(), 0);
    }

    #[test]
    fn test_rebase_targets() {
        let mut t = tracker();
        let loc = CacheVMAddress::new(0x1020);
        assert_eq!(t.rebase_target64(loc), None);
        t.set_rebase_target64(loc, 0x1_8000_4000);
        assert_eq!(t.rebase_target64(loc), Some(0x1_8000_4000));

        t.set_rebase_target32(loc, 0x4000);
        assert_eq!(t.rebase_target32(loc), Some(0x4000));

        t.clear_rebase_targets();
        assert_eq!(t.rebase_target64(loc), None);
    }

    #[test]
    fn test_for_each_fixup_ordered() {
        let mut t = tracker();
        for off in [0x40u64, 0x10, 0x80, 0x2C] {
            t.add(CacheVMAddress::new(0x1000 + off));
        }

        let mut seen = Vec::new();
        t.for_each_fixup(|loc| {
            seen.push(loc.raw());
            true
        });
        assert_eq!(seen, vec![0x1010, 0x102C, 0x1040, 0x1080]);
    }

    #[test]
    fn test_for_each_fixup_early_stop() {
        let mut t = tracker();
        t.add(CacheVMAddress::new(0x1010));
        t.add(CacheVMAddress::new(0x1020));

        let mut seen = 0;
        t.for_each_fixup(|_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }
}
