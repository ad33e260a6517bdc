//! Typed address domains used throughout the builder.
//!
//! Addresses in this crate live in two distinct coordinate systems: the one
//! an input dylib was linked at, and the one the merged cache image occupies.
//! Mixing the two is the classic source of silent relocation bugs, so each
//! domain is a distinct newtype and arithmetic is only defined between
//! compatible domains:
//!
//! - address + offset = address
//! - address - address = offset (within one domain)
//! - address + size = address
//!
//! File offsets/sizes are kept separate from VM addresses/sizes because the
//! file layout and the memory layout of a segment can diverge (zero-fill).

use std::fmt;

macro_rules! typed_u64 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw value.
            #[inline]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

typed_u64!(
    /// A VM address inside the output cache image.
    CacheVMAddress
);
typed_u64!(
    /// A VM address inside an input dylib, as originally linked.
    InputVMAddress
);
typed_u64!(
    /// A difference between two VM addresses in the same domain.
    VMOffset
);
typed_u64!(
    /// A VM size within the cache (e.g. the mapped size of a segment).
    CacheVMSize
);
typed_u64!(
    /// A file offset within the output cache file.
    CacheFileOffset
);
typed_u64!(
    /// A file size within the output cache file.
    CacheFileSize
);
typed_u64!(
    /// A VM size within an input dylib.
    InputVMSize
);
typed_u64!(
    /// A file offset within an input dylib.
    InputFileOffset
);
typed_u64!(
    /// A file size within an input dylib.
    InputFileSize
);

// =============================================================================
// CacheVMAddress arithmetic
// =============================================================================

impl std::ops::Add<VMOffset> for CacheVMAddress {
    type Output = CacheVMAddress;
    #[inline]
    fn add(self, rhs: VMOffset) -> CacheVMAddress {
        CacheVMAddress(self.0 + rhs.0)
    }
}

impl std::ops::Add<CacheVMSize> for CacheVMAddress {
    type Output = CacheVMAddress;
    #[inline]
    fn add(self, rhs: CacheVMSize) -> CacheVMAddress {
        CacheVMAddress(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign<CacheVMSize> for CacheVMAddress {
    #[inline]
    fn add_assign(&mut self, rhs: CacheVMSize) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub<CacheVMAddress> for CacheVMAddress {
    type Output = VMOffset;
    #[inline]
    fn sub(self, rhs: CacheVMAddress) -> VMOffset {
        VMOffset(self.0 - rhs.0)
    }
}

// =============================================================================
// InputVMAddress arithmetic
// =============================================================================

impl std::ops::Add<VMOffset> for InputVMAddress {
    type Output = InputVMAddress;
    #[inline]
    fn add(self, rhs: VMOffset) -> InputVMAddress {
        InputVMAddress(self.0 + rhs.0)
    }
}

impl std::ops::Add<InputVMSize> for InputVMAddress {
    type Output = InputVMAddress;
    #[inline]
    fn add(self, rhs: InputVMSize) -> InputVMAddress {
        InputVMAddress(self.0 + rhs.0)
    }
}

impl std::ops::Sub<InputVMAddress> for InputVMAddress {
    type Output = VMOffset;
    #[inline]
    fn sub(self, rhs: InputVMAddress) -> VMOffset {
        VMOffset(self.0 - rhs.0)
    }
}

// =============================================================================
// Offset and size arithmetic
// =============================================================================

impl std::ops::Add<VMOffset> for VMOffset {
    type Output = VMOffset;
    #[inline]
    fn add(self, rhs: VMOffset) -> VMOffset {
        VMOffset(self.0 + rhs.0)
    }
}

impl std::ops::Add<CacheVMSize> for CacheVMSize {
    type Output = CacheVMSize;
    #[inline]
    fn add(self, rhs: CacheVMSize) -> CacheVMSize {
        CacheVMSize(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign<CacheVMSize> for CacheVMSize {
    #[inline]
    fn add_assign(&mut self, rhs: CacheVMSize) {
        self.0 += rhs.0;
    }
}

impl std::ops::Add<CacheFileSize> for CacheFileOffset {
    type Output = CacheFileOffset;
    #[inline]
    fn add(self, rhs: CacheFileSize) -> CacheFileOffset {
        CacheFileOffset(self.0 + rhs.0)
    }
}

impl std::ops::Sub<CacheFileOffset> for CacheFileOffset {
    type Output = CacheFileSize;
    #[inline]
    fn sub(self, rhs: CacheFileOffset) -> CacheFileSize {
        CacheFileSize(self.0 - rhs.0)
    }
}

impl std::ops::Add<InputFileSize> for InputFileOffset {
    type Output = InputFileOffset;
    #[inline]
    fn add(self, rhs: InputFileSize) -> InputFileOffset {
        InputFileOffset(self.0 + rhs.0)
    }
}

// =============================================================================
// Conversions that cross domains on purpose
// =============================================================================

impl CacheVMAddress {
    /// Returns true if `self` lies within `[start, start + size)`.
    #[inline]
    pub fn is_within(self, start: CacheVMAddress, size: CacheVMSize) -> bool {
        self.0 >= start.0 && self.0 < start.0 + size.0
    }
}

impl InputVMAddress {
    /// Returns true if `self` lies within `[start, start + size)`.
    #[inline]
    pub fn is_within(self, start: InputVMAddress, size: InputVMSize) -> bool {
        self.0 >= start.0 && self.0 < start.0 + size.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_plus_offset() {
        let base = CacheVMAddress::new(0x1_8000_0000);
        let addr = base + VMOffset::new(0x4000);
        assert_eq!(addr.raw(), 0x1_8000_4000);
        assert_eq!((addr - base).raw(), 0x4000);
    }

    #[test]
    fn test_input_domain() {
        let a = InputVMAddress::new(0x10000);
        let b = a + InputVMSize::new(0x4000);
        assert_eq!((b - a).raw(), 0x4000);
        assert!(a.is_within(InputVMAddress::new(0x10000), InputVMSize::new(1)));
        assert!(!b.is_within(InputVMAddress::new(0x10000), InputVMSize::new(0x4000)));
    }

    #[test]
    fn test_file_offset_arithmetic() {
        let off = CacheFileOffset::new(0x1000) + CacheFileSize::new(0x200);
        assert_eq!(off.raw(), 0x1200);
        assert_eq!((off - CacheFileOffset::new(0x1000)).raw(), 0x200);
    }
}
