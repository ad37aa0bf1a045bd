//! Advanced Programmable Interrupt Controller (APIC) driver.
//!
//! This implements X2Apic mode.
use crate::dev::DeviceError;
use crate::platform::Platform;

/// IA32_APIC_BASE.
pub const MSR_APIC_BASE: u32 = 0x1b;
/// x2APIC id register.
pub const MSR_X2APIC_ID: u32 = 0x802;
/// x2APIC version register.
pub const MSR_X2APIC_VERSION: u32 = 0x803;
/// x2APIC task priority register.
pub const MSR_X2APIC_TPR: u32 = 0x808;
/// x2APIC end of interrupt register.
pub const MSR_X2APIC_EOI: u32 = 0x80b;
/// x2APIC logical destination register.
pub const MSR_X2APIC_LDR: u32 = 0x80d;
/// x2APIC spurious interrupt vector register.
pub const MSR_X2APIC_SIVR: u32 = 0x80f;
/// x2APIC interrupt command register.
pub const MSR_X2APIC_ICR: u32 = 0x830;
/// x2APIC LVT timer register.
pub const MSR_X2APIC_LVT_TIMER: u32 = 0x832;
/// x2APIC LVT LINT0 register.
pub const MSR_X2APIC_LVT_LINT0: u32 = 0x835;
/// x2APIC LVT LINT1 register.
pub const MSR_X2APIC_LVT_LINT1: u32 = 0x836;
/// x2APIC self IPI register.
pub const MSR_X2APIC_SELF_IPI: u32 = 0x83f;
/// IA32_TSC_DEADLINE.
pub const MSR_TSC_DEADLINE: u32 = 0x6e0;

/// Fixed delivery mode.
pub const ICR_DELIVERY_FIXED: u32 = 0x000;
/// NMI delivery mode.
pub const ICR_DELIVERY_NMI: u32 = 0x400;
/// INIT delivery mode.
pub const ICR_DELIVERY_INIT: u32 = 0x500;
/// Start-up delivery mode.
pub const ICR_DELIVERY_STARTUP: u32 = 0x600;
/// Delivery mode field.
pub const ICR_DELIVERY_MASK: u32 = 0x700;
/// Logical destination mode.
pub const ICR_DEST_LOGICAL: u32 = 1 << 11;
/// Level assert.
pub const ICR_LEVEL_ASSERT: u32 = 0x4000;
/// Level triggered.
pub const ICR_TRIGGER_LEVEL: u32 = 1 << 15;
/// Destination shorthand field.
pub const ICR_SHORTHAND_MASK: u32 = 0b11 << 18;
/// Shorthand: self.
pub const ICR_SHORTHAND_SELF: u32 = 0b01 << 18;
/// Shorthand: all including self.
pub const ICR_SHORTHAND_ALL: u32 = 0b10 << 18;
/// Shorthand: all excluding self.
pub const ICR_SHORTHAND_ALL_BUT_SELF: u32 = 0b11 << 18;

/// Spurious vector.
pub const IRQ_SPURIOUS: u32 = 0xff;

/// Put the local APIC of this pCPU into x2APIC mode.
pub fn init(p: &dyn Platform) -> Result<(), DeviceError> {
    if p.cpuid(1, 0).ecx & (1 << 21) == 0 {
        return Err(DeviceError("X2Apic is not supported."));
    }
    // EN | EXTD
    let apic_base = p.rdmsr(MSR_APIC_BASE);
    p.wrmsr(MSR_APIC_BASE, apic_base | (1 << 11) | (1 << 10));
    // Enable local apic and set spurious irq vector.
    p.wrmsr(MSR_X2APIC_SIVR, 0x100 | IRQ_SPURIOUS as u64);
    p.wrmsr(MSR_X2APIC_TPR, 0);
    // lint0, lint1 = MASK
    p.wrmsr(MSR_X2APIC_LVT_LINT0, 0x10000);
    p.wrmsr(MSR_X2APIC_LVT_LINT1, 0x10000 | ICR_DELIVERY_NMI as u64);
    Ok(())
}

/// Signal the end of interrupt.
pub fn eoi(p: &dyn Platform) {
    p.wrmsr(MSR_X2APIC_EOI, 0);
}

/// Send a fixed IPI with `vector` to `dest`.
pub fn send_ipi(p: &dyn Platform, dest: u32, vector: u8) {
    p.send_icr(dest, ICR_LEVEL_ASSERT | ICR_DELIVERY_FIXED | vector as u32);
}

/// Send an INIT IPI to `dest`.
pub fn send_init(p: &dyn Platform, dest: u32) {
    p.send_icr(dest, ICR_LEVEL_ASSERT | ICR_DELIVERY_INIT);
}

/// Send a STARTUP IPI to `dest`; the AP starts in real mode at `entry`.
///
/// `entry` must be a page aligned address below 1 MiB.
pub fn send_startup(p: &dyn Platform, dest: u32, entry: usize) {
    p.send_icr(
        dest,
        ICR_LEVEL_ASSERT | ICR_DELIVERY_STARTUP | ((entry >> 12) as u32 & 0xff),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;

    #[test]
    fn startup_vector_encoding() {
        let p = MockPlatform::new();
        send_init(&p, 2);
        send_startup(&p, 2, 0x9_d000);
        assert_eq!(p.icr_log(), [(2, 0x4500), (2, 0x469d)]);
    }
}
