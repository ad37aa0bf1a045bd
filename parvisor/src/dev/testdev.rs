//! Test device on port 0xCF9.
//!
//! Any write pauses every vCPU of the writing VM and leaves it paused, so a
//! test can inspect the state the guest reached. It replaces the reset
//! control register in debug builds and with the `testdev` feature.

use crate::{
    hv::Hypervisor,
    io::PioHandler,
    vcpu::VCpu,
    vm::{pause_vm, Vm},
};
use abyss::platform::IoWidth;

pub struct TestDev;

impl PioHandler for TestDev {
    fn write(&self, hv: &Hypervisor, vm: &Vm, vcpu: &VCpu, port: u16, _width: IoWidth, value: u32) {
        log::info!(
            "vm{} vcpu{}: test device {:#x} <- {:#x}, pausing",
            vm.vm_id,
            vcpu.vcpu_id,
            port,
            value
        );
        pause_vm(hv, vm);
    }
}
