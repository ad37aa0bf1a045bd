//! CMOS RTC shim at 0x70/0x71.
//!
//! Time and status registers are read from the physical RTC; the guest can
//! not set the clock. The rest of the CMOS is a private NVRAM per VM.

use crate::{hv::Hypervisor, io::PioHandler, vcpu::VCpu, vm::Vm};
use abyss::platform::IoWidth;
use spin_lock::SpinLock;

pub const RTC_PORT: u16 = 0x70;
const RTC_DATA: u16 = 0x71;

const CMOS_INDEX_MASK: u8 = 0x7f;
const RTC_STATUS_C: u8 = 0x0c;
/// Registers backed by the physical RTC.
const PHYSICAL_REGS: [u8; 11] = [0x00, 0x02, 0x04, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0d, 0x32];

struct Cmos {
    index: u8,
    nvram: [u8; 128],
}

/// The RTC of a VM.
pub struct VRtc {
    cmos: SpinLock<Cmos>,
}

impl VRtc {
    pub fn new() -> Self {
        Self {
            cmos: SpinLock::new(Cmos {
                index: 0,
                nvram: [0; 128],
            }),
        }
    }

    pub fn reset(&self) {
        let mut cmos = self.cmos.lock();
        cmos.index = 0;
        cmos.nvram = [0; 128];
    }
}

impl Default for VRtc {
    fn default() -> Self {
        Self::new()
    }
}

fn read_physical(hv: &Hypervisor, index: u8) -> u8 {
    let _guard = hv.cmos_lock.lock();
    hv.platform.pio_write(RTC_PORT, IoWidth::Byte, index as u32);
    hv.platform.pio_read(RTC_DATA, IoWidth::Byte) as u8
}

impl PioHandler for VRtc {
    fn read(&self, hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth) -> u32 {
        let cmos = self.cmos.lock();
        if port == RTC_PORT {
            return cmos.index as u32;
        }
        let v = match cmos.index {
            i if PHYSICAL_REGS.contains(&i) => read_physical(hv, i),
            // No periodic, alarm or update interrupts are generated.
            RTC_STATUS_C => 0,
            i => cmos.nvram[i as usize],
        };
        v as u32
    }

    fn write(&self, _hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth, value: u32) {
        let mut cmos = self.cmos.lock();
        if port == RTC_PORT {
            // Bit 7 is the NMI mask of the platform; it is left alone.
            cmos.index = value as u8 & CMOS_INDEX_MASK;
            return;
        }
        match cmos.index {
            i if PHYSICAL_REGS.contains(&i) || i == RTC_STATUS_C => {
                log::debug!("vm{}: rtc write to {:#x} dropped", vm.vm_id, i)
            }
            i => cmos.nvram[i as usize] = value as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Harness;

    #[test]
    fn time_from_hardware_nvram_private() {
        let h = Harness::new();
        let vm = h.vm(1);
        let vcpu = vm.bsp().unwrap();
        let rtc = &vm.devices.rtc;
        h.p.set_port(RTC_DATA, 0x42);

        rtc.write(&h.hv, &vm, vcpu, RTC_PORT, IoWidth::Byte, 0x80);
        assert_eq!(rtc.read(&h.hv, &vm, vcpu, RTC_PORT, IoWidth::Byte), 0);
        assert_eq!(rtc.read(&h.hv, &vm, vcpu, RTC_DATA, IoWidth::Byte), 0x42);
        assert!(h.p.pio_writes().contains(&(RTC_PORT, IoWidth::Byte, 0)));
        // Setting the clock is ignored.
        rtc.write(&h.hv, &vm, vcpu, RTC_DATA, IoWidth::Byte, 0x11);
        assert!(!h.p.pio_writes().contains(&(RTC_DATA, IoWidth::Byte, 0x11)));

        rtc.write(&h.hv, &vm, vcpu, RTC_PORT, IoWidth::Byte, 0x40);
        rtc.write(&h.hv, &vm, vcpu, RTC_DATA, IoWidth::Byte, 0x99);
        assert_eq!(rtc.read(&h.hv, &vm, vcpu, RTC_DATA, IoWidth::Byte), 0x99);
        rtc.write(&h.hv, &vm, vcpu, RTC_PORT, IoWidth::Byte, RTC_STATUS_C as u32);
        assert_eq!(rtc.read(&h.hv, &vm, vcpu, RTC_DATA, IoWidth::Byte), 0);

        // The other VM has its own NVRAM.
        let vm0 = h.vm(0);
        let rtc0 = &vm0.devices.rtc;
        rtc0.write(&h.hv, &vm0, vm0.bsp().unwrap(), RTC_PORT, IoWidth::Byte, 0x40);
        assert_eq!(rtc0.read(&h.hv, &vm0, vm0.bsp().unwrap(), RTC_DATA, IoWidth::Byte), 0);
    }
}
