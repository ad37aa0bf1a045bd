//! Cascaded 8259A pair.
//!
//! The master sits at 0x20/0x21, the slave at 0xA0/0xA1 and the edge/level
//! control registers at 0x4D0/0x4D1. Only fully nested mode with fixed
//! priority is modeled; rotation and special mask commands are accepted and
//! ignored.

use crate::{
    hv::Hypervisor,
    io::PioHandler,
    vcpu::{VCpu, VCpuRequest},
    vm::Vm,
};
use abyss::platform::IoWidth;
use spin_lock::SpinLock;

pub const PIC_MASTER_PORT: u16 = 0x20;
pub const PIC_SLAVE_PORT: u16 = 0xa0;
pub const PIC_ELC_PORT: u16 = 0x4d0;

/// Pin of the master the slave is wired to.
const CASCADE_PIN: u8 = 2;
/// ELCR bits that must read as edge: IRQ 0, 1, 2, 8 and 13.
const ELC_MASK: [u8; 2] = [0xf8, 0xde];

const ICW1_INIT: u8 = 1 << 4;
const ICW1_NEED_ICW4: u8 = 1 << 0;
const ICW1_SINGLE: u8 = 1 << 1;
const OCW3_SELECT: u8 = 1 << 3;
const OCW3_READ_REGISTER: u8 = 1 << 1;
const ICW4_AUTO_EOI: u8 = 1 << 1;

/// Initialization word the chip expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    Ready,
    Icw2,
    Icw3,
    Icw4,
}

#[derive(Debug, Clone, Copy)]
struct I8259 {
    irr: u8,
    isr: u8,
    imr: u8,
    elc: u8,
    /// Input lines currently asserted, for edge detection.
    pin_level: u8,
    vector_base: u8,
    step: InitStep,
    need_icw4: bool,
    single: bool,
    read_isr: bool,
    auto_eoi: bool,
}

impl I8259 {
    const fn new() -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0,
            elc: 0,
            pin_level: 0,
            vector_base: 0,
            step: InitStep::Ready,
            need_icw4: false,
            single: false,
            read_isr: false,
            auto_eoi: false,
        }
    }

    /// Highest priority request that is not blocked by an in-service one.
    fn pending_pin(&self, extra_irr: u8) -> Option<u8> {
        let req = (self.irr | extra_irr) & !self.imr;
        if req == 0 {
            return None;
        }
        let pin = req.trailing_zeros() as u8;
        match self.isr {
            0 => Some(pin),
            isr if (isr.trailing_zeros() as u8) > pin => Some(pin),
            _ => None,
        }
    }

    fn set_pin(&mut self, pin: u8, level: bool) {
        let bit = 1 << pin;
        if level {
            if self.elc & bit != 0 || self.pin_level & bit == 0 {
                self.irr |= bit;
            }
            self.pin_level |= bit;
        } else {
            self.pin_level &= !bit;
            if self.elc & bit != 0 {
                self.irr &= !bit;
            }
        }
    }

    fn accept(&mut self, pin: u8) {
        let bit = 1 << pin;
        // A level request stays while its line is asserted.
        if self.elc & bit == 0 || self.pin_level & bit == 0 {
            self.irr &= !bit;
        }
        if !self.auto_eoi {
            self.isr |= bit;
        }
    }

    fn write_command(&mut self, v: u8) {
        if v & ICW1_INIT != 0 {
            self.imr = 0;
            self.isr = 0;
            self.irr &= self.elc & self.pin_level;
            self.read_isr = false;
            self.auto_eoi = false;
            self.need_icw4 = v & ICW1_NEED_ICW4 != 0;
            self.single = v & ICW1_SINGLE != 0;
            self.step = InitStep::Icw2;
        } else if v & OCW3_SELECT != 0 {
            if v & OCW3_READ_REGISTER != 0 {
                self.read_isr = v & 1 != 0;
            }
        } else {
            // OCW2
            match v >> 5 {
                // Non-specific EOI.
                0b001 | 0b101 => {
                    if self.isr != 0 {
                        self.isr &= self.isr - 1;
                    }
                }
                // Specific EOI.
                0b011 | 0b111 => self.isr &= !(1 << (v & 7)),
                _ => (),
            }
        }
    }

    fn write_data(&mut self, v: u8) {
        self.step = match self.step {
            InitStep::Icw2 => {
                self.vector_base = v & 0xf8;
                if !self.single {
                    InitStep::Icw3
                } else if self.need_icw4 {
                    InitStep::Icw4
                } else {
                    InitStep::Ready
                }
            }
            InitStep::Icw3 if self.need_icw4 => InitStep::Icw4,
            InitStep::Icw3 => InitStep::Ready,
            InitStep::Icw4 => {
                self.auto_eoi = v & ICW4_AUTO_EOI != 0;
                InitStep::Ready
            }
            InitStep::Ready => {
                self.imr = v;
                InitStep::Ready
            }
        };
    }
}

/// The virtual PIC of a VM.
pub struct VPic {
    chips: SpinLock<[I8259; 2]>,
}

impl VPic {
    pub fn new() -> Self {
        Self {
            chips: SpinLock::new([I8259::new(); 2]),
        }
    }

    /// Power-on state.
    pub fn reset(&self) {
        *self.chips.lock() = [I8259::new(); 2];
    }

    fn set_irq(&self, irq: u8, level: bool) -> bool {
        if irq >= 16 {
            return false;
        }
        let mut chips = self.chips.lock();
        chips[(irq >> 3) as usize].set_pin(irq & 7, level);
        Self::pending(&chips).is_some()
    }

    /// Assert line `irq`. Returns whether the PIC now has an interrupt for
    /// the CPU.
    pub fn assert_irq(&self, irq: u8) -> bool {
        self.set_irq(irq, true)
    }

    /// Deassert line `irq`.
    pub fn deassert_irq(&self, irq: u8) {
        self.set_irq(irq, false);
    }

    /// Pins that deliver the next interrupt: `(master_pin, slave_pin)`.
    fn pending(chips: &[I8259; 2]) -> Option<(u8, Option<u8>)> {
        let slave = chips[1].pending_pin(0);
        let cascade = if slave.is_some() { 1 << CASCADE_PIN } else { 0 };
        match chips[0].pending_pin(cascade)? {
            CASCADE_PIN => slave.map(|s| (CASCADE_PIN, Some(s))),
            pin => Some((pin, None)),
        }
    }

    /// Vector of the interrupt the PIC presents, if any.
    pub fn pending_intr(&self) -> Option<u8> {
        let chips = self.chips.lock();
        Self::pending(&chips).map(|p| match p {
            (_, Some(s)) => chips[1].vector_base + s,
            (m, None) => chips[0].vector_base + m,
        })
    }

    /// Interrupt acknowledge for `vector`.
    pub fn intr_accepted(&self, vector: u8) {
        let mut chips = self.chips.lock();
        match Self::pending(&chips) {
            Some((m, Some(s))) if chips[1].vector_base + s == vector => {
                chips[1].accept(s);
                chips[0].accept(m);
            }
            Some((m, None)) if chips[0].vector_base + m == vector => chips[0].accept(m),
            _ => log::debug!("vpic: acknowledge of stale vector {:#x}", vector),
        }
    }

    /// Interrupt mask of both chips, slave in the high byte.
    pub fn imr(&self) -> u16 {
        let chips = self.chips.lock();
        (chips[0].imr as u16) | ((chips[1].imr as u16) << 8)
    }
}

impl Default for VPic {
    fn default() -> Self {
        Self::new()
    }
}

/// A new interrupt may have been unmasked or unblocked.
fn notify(hv: &Hypervisor, vm: &Vm) {
    if vm.devices.vpic.pending_intr().is_some() {
        if let Some(bsp) = vm.bsp() {
            bsp.make_request(VCpuRequest::EXTINT);
            hv.kick_vcpu(bsp);
        }
    }
}

/// Command and data ports of one chip.
pub struct PicPorts {
    pub slave: bool,
}

impl PioHandler for PicPorts {
    fn read(&self, _hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth) -> u32 {
        let chips = vm.devices.vpic.chips.lock();
        let chip = &chips[self.slave as usize];
        let v = match (port & 1, chip.read_isr) {
            (0, true) => chip.isr,
            (0, false) => chip.irr,
            _ => chip.imr,
        };
        v as u32
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth, value: u32) {
        {
            let mut chips = vm.devices.vpic.chips.lock();
            let chip = &mut chips[self.slave as usize];
            if port & 1 == 0 {
                chip.write_command(value as u8);
            } else {
                chip.write_data(value as u8);
            }
        }
        notify(hv, vm);
    }
}

/// Edge/level control registers.
pub struct PicElc;

impl PioHandler for PicElc {
    fn read(&self, _hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth) -> u32 {
        let i = (port - PIC_ELC_PORT) as usize & 1;
        vm.devices.vpic.chips.lock()[i].elc as u32
    }

    fn write(&self, _hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth, value: u32) {
        let i = (port - PIC_ELC_PORT) as usize & 1;
        vm.devices.vpic.chips.lock()[i].elc = value as u8 & ELC_MASK[i];
    }
}
