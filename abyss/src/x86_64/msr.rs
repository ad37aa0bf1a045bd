//! Model-specific register (MSR).

use core::arch::asm;

/// Model specific register.
pub struct Msr<const ADDR: u32>;

impl<const ADDR: u32> Msr<ADDR> {
    /// Read the current value.
    #[inline(always)]
    pub fn read() -> u64 {
        unsafe { rdmsr(ADDR) }
    }

    /// Write to the msr.
    ///
    /// # Safety
    /// Writing an MSR can change the processor's behavior arbitrarily.
    #[inline(always)]
    pub unsafe fn write(v: u64) {
        wrmsr(ADDR, v)
    }
}

/// Read the msr `index`.
///
/// # Safety
/// `index` must name an MSR the processor implements.
#[inline(always)]
pub unsafe fn rdmsr(index: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") index, options(nomem, nostack));
    ((hi as u64) << 32) | (lo as u64)
}

/// Write `v` to the msr `index`.
///
/// # Safety
/// `index` must name an MSR the processor implements.
#[inline(always)]
pub unsafe fn wrmsr(index: u32, v: u64) {
    asm!(
        "wrmsr",
        in("edx") (v >> 32) as u32,
        in("eax") v as u32,
        in("ecx") index,
        options(nomem, nostack)
    );
}
