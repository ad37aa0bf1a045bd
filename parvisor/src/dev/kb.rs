//! Keyboard controller stub.
//!
//! No keyboard is attached: the data and status ports read zero, which a
//! guest driver takes as "nothing to read, ready for input". The other ports
//! of the window behave as unclaimed.

use crate::{hv::Hypervisor, io::PioHandler, io::PioRange, vcpu::VCpu, vm::Vm};
use abyss::platform::IoWidth;

const KB_DATA_PORT: u16 = 0x60;
const KB_STATUS_PORT: u16 = 0x64;

pub const KB_PORTS: PioRange = PioRange::new(KB_DATA_PORT, 5);

pub struct Keyboard;

impl PioHandler for Keyboard {
    fn read(&self, _hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, port: u16, width: IoWidth) -> u32 {
        match port {
            KB_DATA_PORT | KB_STATUS_PORT => 0,
            _ => width.mask(),
        }
    }
}
