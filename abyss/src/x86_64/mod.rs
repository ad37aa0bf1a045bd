//! x86_64 specific

pub mod intrinsics;
pub mod msr;
pub mod pio;

use crate::{
    addressing::Pa,
    platform::{CpuidResult, IoWidth, Platform},
};

bitflags::bitflags! {
    /// rflags.
    #[repr(transparent)]
    pub struct Rflags: u64 {
        /// Carry Flag
        const CF = 1 << 0;
        /// Must be 1.
        const _1 = 1 << 1;
        /// Parity Flag
        const PF = 1 << 2;
        /// Adjust Flag
        const AF = 1 << 4;
        /// Zero Flag
        const ZF = 1 << 6;
        /// Sign Flag
        const SF = 1 << 7;
        /// Trap Flag
        const TF = 1 << 8;
        /// Interrupt enable.
        ///
        /// The flag is set to respond to maskable hardware interrupts; cleared
        /// to inhibit maskable hardware interrupts.
        const IF = 1 << 9;
        /// Direction Flag
        const DF = 1 << 10;
        /// Overflow Flag
        const OF = 1 << 11;
        /// I/O privilege level field - bit 0
        const IOPL0 = 1 << 12;
        /// I/O privilege level field - bit 1
        const IOPL1 = 1 << 13;
        /// Nested task
        const NT = 1 << 14;
        /// Resume
        const RF = 1 << 16;
        /// Virtual-8086 mode
        const VM = 1 << 17;
        /// Alignment check or access control
        const AC = 1 << 18;
        /// Virtual Interrupt
        const VIF = 1 << 19;
        /// Virtual interrupt pending
        const VIP = 1 << 20;
        /// Identification.
        const ID = 1 << 21;
    }
}

bitflags::bitflags! {
    /// Control register 0.
    #[repr(transparent)]
    pub struct Cr0: u64 {
        /// Protection Enable
        const PE = 1 << 0;
        /// Monitor Coprocessor
        const MP = 1 << 1;
        /// Emulation
        const EM = 1 << 2;
        /// Task Switched
        const TS = 1 << 3;
        /// Extension Type
        const ET = 1 << 4;
        /// Numeric Error
        const NE = 1 << 5;
        /// Write Protect
        const WP = 1 << 16;
        /// Alignment Mask
        const AM = 1 << 18;
        /// Not Write-through
        const NW = 1 << 29;
        /// Cache Disable
        const CD = 1 << 30;
        /// Paging
        const PG = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Control register 4.
    #[repr(transparent)]
    pub struct Cr4: u64 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const PCE = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const UMIP = 1 << 11;
        const LA57 = 1 << 12;
        const VMXE = 1 << 13;
        const SMXE = 1 << 14;
        const FSGSBASE = 1 << 16;
        const PCIDE = 1 << 17;
        const OSXSAVE = 1 << 18;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
        const PKE = 1 << 22;
        const CET = 1 << 23;
        const PKS = 1 << 24;
    }
}

bitflags::bitflags! {
    /// Extended feature enable register (IA32_EFER).
    #[repr(transparent)]
    pub struct Efer: u64 {
        /// System call extensions.
        const SCE = 1 << 0;
        /// Long mode enable.
        const LME = 1 << 8;
        /// Long mode active.
        const LMA = 1 << 10;
        /// No-execute enable.
        const NXE = 1 << 11;
    }
}

/// The hardware platform of a bare-metal x86-64 machine.
///
/// Accesses the instructions directly; only meaningful in VMX root operation
/// on the physical machine.
pub struct Native {
    _p: (),
}

impl Native {
    /// Create the native platform.
    ///
    /// # Safety
    /// Must only be constructed by the boot code running on bare metal with the
    /// identity host mapping in place.
    pub const unsafe fn new() -> Self {
        Self { _p: () }
    }
}

impl Platform for Native {
    #[inline]
    fn rdtsc(&self) -> u64 {
        intrinsics::rdtsc()
    }

    #[inline]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        intrinsics::cpuid(leaf, subleaf)
    }

    fn pio_read(&self, port: u16, width: IoWidth) -> u32 {
        unsafe { pio::read(port, width) }
    }

    fn pio_write(&self, port: u16, width: IoWidth, value: u32) {
        unsafe { pio::write(port, width, value) }
    }

    #[inline]
    fn rdmsr(&self, index: u32) -> u64 {
        unsafe { msr::rdmsr(index) }
    }

    #[inline]
    fn wrmsr(&self, index: u32, value: u64) {
        unsafe { msr::wrmsr(index, value) }
    }

    fn send_icr(&self, dest: u32, icr_low: u32) {
        unsafe {
            msr::wrmsr(
                crate::dev::x86_64::apic::MSR_X2APIC_ICR,
                ((dest as u64) << 32) | icr_low as u64,
            )
        }
    }

    fn xsetbv(&self, xcr: u32, value: u64) {
        unsafe {
            core::arch::asm!(
                "xsetbv",
                in("ecx") xcr,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nostack),
            )
        }
    }

    #[inline]
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    unsafe fn phys_read(&self, hpa: Pa, buf: &mut [u8]) {
        core::ptr::copy_nonoverlapping(
            hpa.into_va().into_usize() as *const u8,
            buf.as_mut_ptr(),
            buf.len(),
        );
    }

    unsafe fn phys_write(&self, hpa: Pa, data: &[u8]) {
        core::ptr::copy_nonoverlapping(
            data.as_ptr(),
            hpa.into_va().into_usize() as *mut u8,
            data.len(),
        );
    }
}
