//! Error numbers returned to guests.

/// Standard error numbers reported through hypercalls and device emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum Errno {
    /// Permission denied.
    EACCES = 13,
    /// Bad address.
    EFAULT = 14,
    /// Device or resource busy.
    EBUSY = 16,
    /// No such device.
    ENODEV = 19,
    /// Invalid argument.
    EINVAL = 22,
    /// Timed out.
    ETIMEDOUT = 110,
}

impl Errno {
    /// Negative value placed in the guest's return register.
    #[inline]
    pub const fn as_neg(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Recover from a negative return value.
    pub fn from_neg(v: i64) -> Option<Self> {
        i32::try_from(-v).ok().and_then(|v| Self::try_from(v).ok())
    }
}
