//! Memory abstraction.
//!
//! The hypervisor maps its virtual memory one-to-one onto physical memory:
//! the host virtual address of a frame equals its host physical address.
//! Converting between [`Pa`] and [`Va`] is therefore free, but the two types
//! are kept apart so that guest-visible and hypervisor-visible addresses do
//! not get mixed up.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// One megabyte.
pub const MEM_1M: usize = 0x10_0000;
/// Two megabytes, the size of a large page.
pub const MEM_2M: usize = 0x20_0000;
/// One gigabyte, the size of a huge page.
pub const MEM_1G: usize = 0x4000_0000;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    ///
    /// x86-64 physical addresses are at most 52 bits wide.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < (1 << 52) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into virtual address.
    #[inline]
    pub const fn into_va(self) -> Va {
        Va(self.0)
    }

    /// Round down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Offset inside the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Va(usize);

impl Va {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Virtual address of an object owned by the hypervisor.
    #[inline]
    pub fn of<T: ?Sized>(t: &T) -> Self {
        Self(t as *const T as *const u8 as usize)
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into physical address.
    #[inline]
    pub const fn into_pa(self) -> Pa {
        Pa(self.0)
    }

    /// Get reference of T underlying the Va.
    ///
    /// # Safety
    ///
    /// The pointer must be null or properly aligned, dereferenceable and point
    /// to an initialized instance of `T`.
    #[inline]
    pub unsafe fn as_ref<'a, T>(&self) -> Option<&'a T> {
        (self.into_usize() as *const T).as_ref()
    }

    /// Get mutable reference of T underlying the Va.
    ///
    /// # Safety
    ///
    /// The pointer must be null or properly aligned, dereferenceable and point
    /// to an initialized instance of `T` that nobody else references.
    #[inline]
    pub unsafe fn as_mut<'a, T>(&self) -> Option<&'a mut T> {
        (self.into_usize() as *mut T).as_mut()
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = usize;

            fn sub(self, other: $t) -> usize {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_map() {
        let pa = Pa::new(0x1234_5000).unwrap();
        assert_eq!(pa.into_va().into_pa(), pa);
        assert_eq!(pa.into_va().into_usize(), 0x1234_5000);
        assert!(Pa::new(1 << 52).is_none());
        assert_eq!((pa + 0x10).page_offset(), 0x10);
        assert_eq!((pa + 0x10).page_down(), pa);
    }
}
