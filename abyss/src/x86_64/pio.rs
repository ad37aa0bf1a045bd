//! Port mapped io.
//!
//! Used by [`super::Native`] to reach the physical devices a VM is given
//! passthrough access to, and by the PIT fallback calibration.

use crate::platform::IoWidth;
use core::arch::asm;

/// `in` of `width` bytes from `port`, zero extended.
///
/// # Safety
/// Reading a device register may have side effects on the device.
#[inline(always)]
pub unsafe fn read(port: u16, width: IoWidth) -> u32 {
    let v: u32;
    match width {
        IoWidth::Byte => {
            let b: u8;
            asm!("in al, dx", lateout("al") b, in("dx") port, options(nomem, nostack));
            v = b as u32;
        }
        IoWidth::Word => {
            let w: u16;
            asm!("in ax, dx", lateout("ax") w, in("dx") port, options(nomem, nostack));
            v = w as u32;
        }
        IoWidth::Dword => {
            asm!("in eax, dx", lateout("eax") v, in("dx") port, options(nomem, nostack));
        }
    }
    v
}

/// `out` of the low `width` bytes of `value` to `port`.
///
/// # Safety
/// The port must belong to a device the caller owns.
#[inline(always)]
pub unsafe fn write(port: u16, width: IoWidth, value: u32) {
    match width {
        IoWidth::Byte => asm!("out dx, al", in("al") value as u8, in("dx") port, options(nomem, nostack)),
        IoWidth::Word => asm!("out dx, ax", in("ax") value as u16, in("dx") port, options(nomem, nostack)),
        IoWidth::Dword => asm!("out dx, eax", in("eax") value, in("dx") port, options(nomem, nostack)),
    }
}
