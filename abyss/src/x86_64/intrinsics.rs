//! intrinsics of x86_64 not included in [`core::arch::x86_64`].
//!
//! [`core::arch::x86_64`]: https://doc.rust-lang.org/beta/core/arch/x86_64/index.html
use crate::platform::CpuidResult;
use core::arch::asm;

/// Execute cpuid with the leaf and subleaf.
#[inline]
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    CpuidResult {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// Get the initial APIC id of this core.
pub fn apic_id() -> usize {
    (cpuid(1, 0).ebx >> 24) as usize
}

/// Read the time-stamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// read current cr0.
pub fn read_cr0() -> u64 {
    unsafe {
        let r: u64;
        asm!("mov {}, cr0", out(reg) r, options(nomem, nostack));
        r
    }
}

/// read current cr3.
pub fn read_cr3() -> u64 {
    unsafe {
        let r: u64;
        asm!("mov {}, cr3", out(reg) r, options(nomem, nostack));
        r
    }
}

/// read current cr4.
pub fn read_cr4() -> u64 {
    unsafe {
        let r: u64;
        asm!("mov {}, cr4", out(reg) r, options(nomem, nostack));
        r
    }
}

/// Write cr4.
///
/// # Safety
/// The new value must keep the processor in a consistent state.
pub unsafe fn write_cr4(v: u64) {
    asm!("mov cr4, {}", in(reg) v, options(nomem, nostack));
}

/// Descriptor table register image as stored by `sgdt`/`sidt`.
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u64,
}

/// Read the GDTR.
pub fn sgdt() -> DescriptorTablePointer {
    let mut p = DescriptorTablePointer::default();
    unsafe {
        asm!("sgdt [{}]", in(reg) &mut p as *mut _, options(nostack));
    }
    p
}

/// Read the IDTR.
pub fn sidt() -> DescriptorTablePointer {
    let mut p = DescriptorTablePointer::default();
    unsafe {
        asm!("sidt [{}]", in(reg) &mut p as *mut _, options(nostack));
    }
    p
}

/// Read the selectors of cs, ss, ds, es, fs, gs and tr, in that order.
pub fn selectors() -> [u16; 7] {
    let (cs, ss, ds, es, fs, gs, tr): (u16, u16, u16, u16, u16, u16, u16);
    unsafe {
        asm!("mov {:x}, cs", out(reg) cs, options(nomem, nostack));
        asm!("mov {:x}, ss", out(reg) ss, options(nomem, nostack));
        asm!("mov {:x}, ds", out(reg) ds, options(nomem, nostack));
        asm!("mov {:x}, es", out(reg) es, options(nomem, nostack));
        asm!("mov {:x}, fs", out(reg) fs, options(nomem, nostack));
        asm!("mov {:x}, gs", out(reg) gs, options(nomem, nostack));
        asm!("str {:x}", out(reg) tr, options(nomem, nostack));
    }
    [cs, ss, ds, es, fs, gs, tr]
}

/// Base of the segment descriptor referenced by `selector` in the current GDT.
///
/// Handles 16-byte system descriptors (TSS) in long mode.
pub fn descriptor_base(selector: u16) -> u64 {
    let gdt = sgdt();
    let idx = (selector >> 3) as u64;
    if idx == 0 {
        return 0;
    }
    unsafe {
        let desc = ((gdt.base + idx * 8) as *const u64).read_unaligned();
        let mut base = ((desc >> 16) & 0xff_ffff) | (((desc >> 56) & 0xff) << 24);
        // System descriptors carry bits 63:32 of the base in the next slot.
        if desc & (1 << 44) == 0 {
            let hi = ((gdt.base + (idx + 1) * 8) as *const u64).read_unaligned();
            base |= (hi & 0xffff_ffff) << 32;
        }
        base
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn hlt() {
    unsafe { asm!("hlt", options(nomem, nostack)) }
}
