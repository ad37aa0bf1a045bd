//! ACPI PM1 registers.
//!
//! Every pre-launched VM sees a virtual PM1A control block at
//! [`VIRTUAL_PM1A_CNT_PORT`]; entering S5 through it shuts the VM down. The
//! physical PM1 blocks are passed through to the VM with the highest
//! severity only.

use crate::{
    config::board::{
        PM1A_CNT_PORT, PM1A_EVT_PORT, PM1B_CNT_PORT, PM1B_EVT_PORT, S5_SLP_TYP,
        VIRTUAL_PM1A_CNT_PORT,
    },
    hv::Hypervisor,
    io::{PioHandler, PioIndex, PioRange},
    vcpu::VCpu,
    vm::{request_shutdown, Vm},
};
use abyss::platform::IoWidth;
use core::sync::atomic::{AtomicU16, Ordering};

const SLP_EN: u16 = 1 << 13;
const SLP_TYP_SHIFT: u16 = 10;
const SLP_TYP_MASK: u16 = 0x7 << SLP_TYP_SHIFT;

/// The physical PM1 blocks and their widths.
pub const PHYSICAL_PM1: [(PioIndex, PioRange); 4] = [
    (PioIndex::Pm1aEvt, PioRange::new(PM1A_EVT_PORT, 4)),
    (PioIndex::Pm1aCnt, PioRange::new(PM1A_CNT_PORT, 2)),
    (PioIndex::Pm1bEvt, PioRange::new(PM1B_EVT_PORT, 4)),
    (PioIndex::Pm1bCnt, PioRange::new(PM1B_CNT_PORT, 2)),
];

/// Range of the virtual PM1A control block.
pub const VIRTUAL_PM1A_CNT: PioRange = PioRange::new(VIRTUAL_PM1A_CNT_PORT, 2);

/// Virtual PM1A control block.
pub struct VirtualPm1aCnt {
    value: AtomicU16,
}

impl VirtualPm1aCnt {
    pub const fn new() -> Self {
        Self {
            value: AtomicU16::new(0),
        }
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for VirtualPm1aCnt {
    fn default() -> Self {
        Self::new()
    }
}

impl PioHandler for VirtualPm1aCnt {
    fn read(&self, _hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth) -> u32 {
        let v = self.value.load(Ordering::Relaxed) as u32;
        v >> ((port - VIRTUAL_PM1A_CNT_PORT) * 8)
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, vcpu: &VCpu, port: u16, width: IoWidth, value: u32) {
        // Only whole-register writes can carry SLP_EN together with SLP_TYP.
        if port != VIRTUAL_PM1A_CNT_PORT || width == IoWidth::Byte {
            return;
        }
        let v = value as u16;
        self.value.store(v & !SLP_EN, Ordering::Relaxed);
        if v & SLP_EN != 0 {
            let slp_typ = ((v & SLP_TYP_MASK) >> SLP_TYP_SHIFT) as u8;
            if slp_typ == S5_SLP_TYP {
                log::info!("vm{} vcpu{}: enters S5", vm.vm_id, vcpu.vcpu_id);
                request_shutdown(hv, vm);
            } else {
                log::warn!("vm{}: sleep state {} is not supported", vm.vm_id, slp_typ);
            }
        }
    }
}

/// A physical PM1 block, accessed on behalf of a VM.
pub struct PhysicalPm1;

impl PioHandler for PhysicalPm1 {
    fn read(&self, hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, width: IoWidth) -> u32 {
        if vm.is_highest_severity() {
            hv.platform.pio_read(port, width)
        } else {
            0
        }
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, width: IoWidth, value: u32) {
        if vm.is_highest_severity() {
            hv.platform.pio_write(port, width, value);
        } else {
            log::debug!("vm{}: pm1 write {:#x} <- {:#x} dropped", vm.vm_id, port, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{percpu::PcpuFlags, tests::Harness, vm::start_vm};

    #[test]
    fn s5_requests_shutdown() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let vcpu = vm.bsp().unwrap();
        let pm = &vm.devices.pm1a_cnt;
        // S3 is refused.
        pm.write(&h.hv, &vm, vcpu, 0x404, IoWidth::Word, (3 << 10) | SLP_EN as u32);
        assert!(vm.is_started());
        assert_eq!(pm.read(&h.hv, &vm, vcpu, 0x404, IoWidth::Word), 3 << 10);

        pm.write(&h.hv, &vm, vcpu, 0x404, IoWidth::Word, (5 << 10) | SLP_EN as u32);
        assert!(vm.is_paused());
        let percpu = h.hv.percpu(2).unwrap();
        assert!(percpu.pending().contains(PcpuFlags::NEED_SHUTDOWN_VM));
        assert_eq!(percpu.shutdown_vm_id(), 1);
    }

    #[test]
    fn physical_blocks_follow_severity() {
        let h = Harness::new();
        h.p.set_port(PM1A_EVT_PORT, 0x0100);
        let (vm0, vm1) = (h.vm(0), h.vm(1));
        let pm = PhysicalPm1;
        assert_eq!(pm.read(&h.hv, &vm0, vm0.bsp().unwrap(), PM1A_EVT_PORT, IoWidth::Word), 0x100);
        assert_eq!(pm.read(&h.hv, &vm1, vm1.bsp().unwrap(), PM1A_EVT_PORT, IoWidth::Word), 0);
        let before = h.p.pio_writes().len();
        pm.write(&h.hv, &vm1, vm1.bsp().unwrap(), PM1A_CNT_PORT, IoWidth::Word, 0x3400);
        assert_eq!(h.p.pio_writes().len(), before);
        pm.write(&h.hv, &vm0, vm0.bsp().unwrap(), PM1A_CNT_PORT, IoWidth::Word, 0x1);
        assert_eq!(h.p.pio_writes()[before..], [(PM1A_CNT_PORT, IoWidth::Word, 0x1)]);
    }
}
