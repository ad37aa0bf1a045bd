//! The fixed device set of a pre-launched VM.
//!
//! Every VM gets the same legacy platform: a cascaded PIC, a PCI
//! configuration mechanism, up to two 16550 UARTs, ACPI PM1 blocks, the
//! CMOS RTC, a keyboard controller stub and the reset registers.

pub mod kb;
pub mod pic;
pub mod pm;
pub mod reset;
pub mod rtc;
#[cfg(any(debug_assertions, feature = "testdev"))]
pub mod testdev;
pub mod vpci;
pub mod vuart;

use crate::{
    config::{VmConfig, VuartConfig},
    hv::Hypervisor,
    io::{register_pio_emulation_handler, PioHandler, PioIndex, PioRange},
    vm::Vm,
    VmError,
};
use alloc::sync::Arc;
use pic::{PicElc, PicPorts, VPic, PIC_ELC_PORT, PIC_MASTER_PORT, PIC_SLAVE_PORT};
use pm::{PhysicalPm1, VirtualPm1aCnt, PHYSICAL_PM1, VIRTUAL_PM1A_CNT};
use reset::{ResetReg, CF9, RESET_REG};
use rtc::{VRtc, RTC_PORT};
use vpci::{VPci, PCI_CFG_ADDR_RANGE, PCI_CFG_DATA_RANGE};
use vuart::VUart;

/// Device models of one VM.
pub struct Devices {
    pub vpic: Arc<VPic>,
    pub vpci: Arc<VPci>,
    pub vuart: [Option<Arc<VUart>>; 2],
    pub rtc: Arc<VRtc>,
    pub pm1a_cnt: Arc<VirtualPm1aCnt>,
    pub reset_reg: Arc<ResetReg>,
}

impl Devices {
    pub fn new(config: &'static VmConfig) -> Self {
        let vuart = config.vuart.map(|c| match c {
            VuartConfig::Legacy { port, irq } => Some(Arc::new(VUart::new(port, irq))),
            VuartConfig::None => None,
        });
        Self {
            vpic: Arc::new(VPic::new()),
            vpci: Arc::new(VPci::new(config)),
            vuart,
            rtc: Arc::new(VRtc::new()),
            pm1a_cnt: Arc::new(VirtualPm1aCnt::new()),
            reset_reg: Arc::new(ResetReg::new()),
        }
    }

    /// Bring every model back to its power-on state.
    pub fn reset(&self) {
        self.vpic.reset();
        self.vpci.reset();
        self.vuart.iter().flatten().for_each(|u| u.reset());
        self.rtc.reset();
        self.pm1a_cnt.reset();
        self.reset_reg.reset();
    }
}

#[cfg(any(debug_assertions, feature = "testdev"))]
fn cf9_handler() -> Arc<dyn PioHandler> {
    Arc::new(testdev::TestDev)
}

#[cfg(not(any(debug_assertions, feature = "testdev")))]
fn cf9_handler() -> Arc<dyn PioHandler> {
    Arc::new(reset::Cf9::new())
}

/// Register the port handlers of `vm` and attach its passthrough functions.
pub fn init_vm_devices(hv: &Hypervisor, vm: &Arc<Vm>) -> Result<(), VmError> {
    let d = &vm.devices;
    let reg = |idx, range, h: Arc<dyn PioHandler>| register_pio_emulation_handler(vm, idx, range, h);

    reg(
        PioIndex::PicMaster,
        PioRange::new(PIC_MASTER_PORT, 2),
        Arc::new(PicPorts { slave: false }),
    );
    reg(
        PioIndex::PicSlave,
        PioRange::new(PIC_SLAVE_PORT, 2),
        Arc::new(PicPorts { slave: true }),
    );
    reg(PioIndex::PicElc, PioRange::new(PIC_ELC_PORT, 2), Arc::new(PicElc));

    reg(PioIndex::PciCfgAddr, PCI_CFG_ADDR_RANGE, d.vpci.clone());
    reg(PioIndex::PciCfgData, PCI_CFG_DATA_RANGE, d.vpci.clone());

    for (idx, uart) in [PioIndex::Uart0, PioIndex::Uart1].into_iter().zip(&d.vuart) {
        if let Some(uart) = uart {
            reg(idx, PioRange::new(uart.port, 8), uart.clone());
        }
    }

    for (idx, range) in PHYSICAL_PM1 {
        reg(idx, range, Arc::new(PhysicalPm1));
    }
    reg(PioIndex::VirtualPm1aCnt, VIRTUAL_PM1A_CNT, d.pm1a_cnt.clone());

    reg(PioIndex::Rtc, PioRange::new(RTC_PORT, 2), d.rtc.clone());
    reg(PioIndex::Kb, kb::KB_PORTS, Arc::new(kb::Keyboard));
    reg(PioIndex::Cf9, CF9, cf9_handler());
    reg(PioIndex::ResetReg, RESET_REG, d.reset_reg.clone());

    d.vpci.init(hv, vm);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{io::emulate_io, tests::Harness, vm::start_vm, vmx::vmcs::IoDirection};
    use abyss::platform::IoWidth;

    fn pio(h: &Harness, vm: &Vm, port: u16, width: IoWidth, dir: IoDirection, value: u32) -> u32 {
        let mut req = crate::io::PioRequest {
            port,
            width,
            direction: dir,
            value,
        };
        emulate_io(&h.hv, vm, vm.bsp().unwrap(), &mut req);
        req.value
    }

    #[test]
    fn every_slot_is_registered() {
        let h = Harness::new();
        let vm = h.vm(1);
        let table = vm.pio.read();
        for idx in [
            PioIndex::PicMaster,
            PioIndex::PicSlave,
            PioIndex::PicElc,
            PioIndex::PciCfgAddr,
            PioIndex::PciCfgData,
            PioIndex::Uart0,
            PioIndex::Pm1aEvt,
            PioIndex::Pm1aCnt,
            PioIndex::Pm1bEvt,
            PioIndex::Pm1bCnt,
            PioIndex::Rtc,
            PioIndex::VirtualPm1aCnt,
            PioIndex::Kb,
            PioIndex::Cf9,
            PioIndex::ResetReg,
        ] {
            assert!(table.get(idx).is_some(), "{:?}", idx);
        }
        // No second UART is configured.
        assert!(table.get(PioIndex::Uart1).is_none());
        assert_eq!(table.find(0xcf9).map(|d| d.range), Some(CF9));
    }

    #[test]
    fn pure_registers_read_back() {
        let h = Harness::new();
        let vm = h.vm(1);
        use IoDirection::{In, Out};
        // Scratch register of the vUART.
        pio(&h, &vm, 0x3ff, IoWidth::Byte, Out, 0x5a);
        assert_eq!(pio(&h, &vm, 0x3ff, IoWidth::Byte, In, 0), 0x5a);
        // CMOS NVRAM.
        pio(&h, &vm, 0x70, IoWidth::Byte, Out, 0x50);
        pio(&h, &vm, 0x71, IoWidth::Byte, Out, 0xa5);
        assert_eq!(pio(&h, &vm, 0x71, IoWidth::Byte, In, 0), 0xa5);
        // The keyboard is not a register.
        pio(&h, &vm, 0x60, IoWidth::Byte, Out, 0x11);
        assert_eq!(pio(&h, &vm, 0x60, IoWidth::Byte, In, 0), 0);
        // Unclaimed ports read all-ones.
        assert_eq!(pio(&h, &vm, 0x2f8, IoWidth::Word, In, 0), 0xffff);
    }

    #[test]
    fn cf9_pauses_only_the_writer() {
        let h = Harness::new();
        let (vm0, vm1) = (h.vm(0), h.vm(1));
        start_vm(&h.hv, &vm0).unwrap();
        start_vm(&h.hv, &vm1).unwrap();
        pio(&h, &vm1, 0xcf9, IoWidth::Byte, IoDirection::Out, 0x06);
        assert!(vm1.is_paused());
        assert!(vm1.vcpus().all(|v| v.state() == crate::vcpu::VCpuState::Paused));
        assert!(vm0.is_started());
        assert!(vm0.vcpus().all(|v| v.state() != crate::vcpu::VCpuState::Paused));
    }
}
