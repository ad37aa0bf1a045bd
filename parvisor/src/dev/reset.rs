//! Reset registers.
//!
//! A guest resets the platform through the fast reset bit of the system
//! control port or through the reset control register at 0xCF9. Either way
//! only the calling VM is restarted.

use crate::{
    config::board::{RESET_REG_PORT, RESET_REG_VALUE},
    hv::Hypervisor,
    io::{PioHandler, PioRange},
    vcpu::VCpu,
    vm::{request_reset, Vm},
};
use abyss::platform::IoWidth;
use core::sync::atomic::{AtomicU8, Ordering};

pub const RESET_REG: PioRange = PioRange::new(RESET_REG_PORT, 1);
pub const CF9_PORT: u16 = 0xcf9;
pub const CF9: PioRange = PioRange::new(CF9_PORT, 1);

/// CF9 bit that makes the write perform the reset.
const CF9_RST_CPU: u8 = 1 << 2;
/// CF9 bits that survive a write.
const CF9_WRITABLE: u8 = 0x0a;

/// The board reset register.
pub struct ResetReg {
    value: AtomicU8,
}

impl ResetReg {
    pub const fn new() -> Self {
        Self {
            value: AtomicU8::new(0),
        }
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for ResetReg {
    fn default() -> Self {
        Self::new()
    }
}

impl PioHandler for ResetReg {
    fn read(&self, _hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, _port: u16, _width: IoWidth) -> u32 {
        self.value.load(Ordering::Relaxed) as u32
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, vcpu: &VCpu, _port: u16, _width: IoWidth, value: u32) {
        let v = value as u8;
        self.value.store(v & !RESET_REG_VALUE, Ordering::Relaxed);
        if v & RESET_REG_VALUE != 0 {
            log::info!("vm{} vcpu{}: reset through port {:#x}", vm.vm_id, vcpu.vcpu_id, RESET_REG_PORT);
            request_reset(hv, vm);
        }
    }
}

/// Reset control register at 0xCF9.
pub struct Cf9 {
    value: AtomicU8,
}

impl Cf9 {
    pub const fn new() -> Self {
        Self {
            value: AtomicU8::new(0),
        }
    }
}

impl Default for Cf9 {
    fn default() -> Self {
        Self::new()
    }
}

impl PioHandler for Cf9 {
    fn read(&self, _hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, _port: u16, _width: IoWidth) -> u32 {
        self.value.load(Ordering::Relaxed) as u32
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, vcpu: &VCpu, _port: u16, _width: IoWidth, value: u32) {
        let v = value as u8;
        self.value.store(v & CF9_WRITABLE, Ordering::Relaxed);
        if v & CF9_RST_CPU != 0 {
            log::info!("vm{} vcpu{}: reset through port {:#x}", vm.vm_id, vcpu.vcpu_id, CF9_PORT);
            request_reset(hv, vm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::Harness, vm::start_vm};

    #[test]
    fn fast_reset_restarts_the_vm() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let vcpu = vm.bsp().unwrap();
        let reg = ResetReg::new();
        // A20 gate only.
        reg.write(&h.hv, &vm, vcpu, RESET_REG_PORT, IoWidth::Byte, 0x2);
        assert!(vm.is_started());
        assert_eq!(reg.read(&h.hv, &vm, vcpu, RESET_REG_PORT, IoWidth::Byte), 0x2);

        reg.write(&h.hv, &vm, vcpu, RESET_REG_PORT, IoWidth::Byte, 0x3);
        assert!(vm.is_paused());
        crate::vm::reset_from_idle(&h.hv, &vm);
        assert!(vm.is_started());
    }

    #[test]
    fn cf9_needs_rst_cpu() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let vcpu = vm.bsp().unwrap();
        let cf9 = Cf9::new();
        cf9.write(&h.hv, &vm, vcpu, CF9_PORT, IoWidth::Byte, 0x02);
        assert!(vm.is_started());
        assert_eq!(cf9.read(&h.hv, &vm, vcpu, CF9_PORT, IoWidth::Byte), 0x02);
        cf9.write(&h.hv, &vm, vcpu, CF9_PORT, IoWidth::Byte, 0x06);
        assert!(vm.is_paused());
    }
}
