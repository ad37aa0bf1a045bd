//! The narrow set of machine operations the hypervisor is built upon.
//!
//! Everything above this trait is plain Rust. The native implementation
//! lives in [`crate::x86_64::Native`]; tests use [`crate::mock::MockPlatform`].

use crate::addressing::Pa;

/// Result of the `cpuid` instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Width of a port-I/O access in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWidth {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl IoWidth {
    /// Convert from a byte count.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            _ => None,
        }
    }

    /// Width in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// All-ones value of this width.
    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xff,
            Self::Word => 0xffff,
            Self::Dword => 0xffff_ffff,
        }
    }
}

/// Hardware leaf operations.
///
/// One value implementing this trait exists for the lifetime of the system and
/// is shared by every pCPU.
pub trait Platform: Send + Sync {
    /// Read the time-stamp counter.
    fn rdtsc(&self) -> u64;

    /// Execute `cpuid` with `leaf`/`subleaf`.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Read from an I/O port.
    fn pio_read(&self, port: u16, width: IoWidth) -> u32;

    /// Write to an I/O port.
    fn pio_write(&self, port: u16, width: IoWidth, value: u32);

    /// Read a model-specific register.
    fn rdmsr(&self, msr: u32) -> u64;

    /// Write to a model-specific register.
    fn wrmsr(&self, msr: u32, value: u64);

    /// Write the x2APIC interrupt command register of this pCPU.
    ///
    /// `dest` is the destination x2APIC id, `icr_low` the low doubleword
    /// (vector, delivery mode, level and shorthand).
    fn send_icr(&self, dest: u32, icr_low: u32);

    /// Write extended control register `xcr`.
    fn xsetbv(&self, xcr: u32, value: u64);

    /// Spin-loop hint.
    fn cpu_relax(&self);

    /// Copy bytes out of host physical memory.
    ///
    /// # Safety
    /// `hpa..hpa+buf.len()` must be memory the hypervisor owns.
    unsafe fn phys_read(&self, hpa: Pa, buf: &mut [u8]);

    /// Copy bytes into host physical memory.
    ///
    /// # Safety
    /// `hpa..hpa+data.len()` must be memory the hypervisor owns and nobody
    /// else is accessing.
    unsafe fn phys_write(&self, hpa: Pa, data: &[u8]);
}
