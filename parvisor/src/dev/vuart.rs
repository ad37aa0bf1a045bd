//! Virtual 16550 UART.
//!
//! Bytes the guest transmits are buffered until the console forwards them
//! to the physical UART; bytes the console receives for the VM are queued
//! on the receive FIFO. The interrupt line goes to the vPIC.

use crate::{
    hv::Hypervisor,
    io::PioHandler,
    vcpu::VCpu,
    virq::{vpic_lower, vpic_raise},
    vm::Vm,
};
use abyss::platform::IoWidth;
use alloc::{collections::VecDeque, vec::Vec};
use spin_lock::SpinLock;

/// Depth of both directions.
pub const FIFO_SIZE: usize = 256;

const UART_RBR: u16 = 0;
const UART_IER: u16 = 1;
const UART_IIR: u16 = 2;
const UART_LCR: u16 = 3;
const UART_MCR: u16 = 4;
const UART_LSR: u16 = 5;
const UART_MSR: u16 = 6;
const UART_SCR: u16 = 7;

const IER_ERBFI: u8 = 1 << 0;
const IER_ETBEI: u8 = 1 << 1;
const IER_MASK: u8 = 0x0f;

const IIR_NOPEND: u8 = 0x1;
const IIR_TXRDY: u8 = 0x2;
const IIR_RXRDY: u8 = 0x4;
const IIR_FIFO_ENABLED: u8 = 0xc0;

const FCR_ENABLE: u8 = 1 << 0;
const FCR_RCV_RST: u8 = 1 << 1;

const LCR_DLAB: u8 = 1 << 7;

const MCR_DTR: u8 = 1 << 0;
const MCR_RTS: u8 = 1 << 1;
const MCR_OUT1: u8 = 1 << 2;
const MCR_OUT2: u8 = 1 << 3;
const MCR_LOOPBACK: u8 = 1 << 4;

const LSR_DR: u8 = 1 << 0;
const LSR_OE: u8 = 1 << 1;
const LSR_THRE: u8 = 1 << 5;
const LSR_TEMT: u8 = 1 << 6;

const MSR_CTS: u8 = 1 << 4;
const MSR_DSR: u8 = 1 << 5;
const MSR_RI: u8 = 1 << 6;
const MSR_DCD: u8 = 1 << 7;

struct UartState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    dll: u8,
    dlh: u8,
    ier: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    /// Sticky overrun, cleared by reading LSR.
    overrun: bool,
    /// THR empty interrupt not yet acknowledged.
    thre_pending: bool,
    /// Level currently driven on the PIC line.
    asserted: bool,
}

impl UartState {
    fn new() -> Self {
        Self {
            rx: VecDeque::with_capacity(FIFO_SIZE),
            tx: Vec::with_capacity(FIFO_SIZE),
            dll: 0,
            dlh: 0,
            ier: 0,
            fcr: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            overrun: false,
            thre_pending: true,
            asserted: false,
        }
    }

    fn iir(&self) -> u8 {
        let fifo = if self.fcr & FCR_ENABLE != 0 { IIR_FIFO_ENABLED } else { 0 };
        let id = if self.ier & IER_ERBFI != 0 && !self.rx.is_empty() {
            IIR_RXRDY
        } else if self.ier & IER_ETBEI != 0 && self.thre_pending {
            IIR_TXRDY
        } else {
            IIR_NOPEND
        };
        fifo | id
    }

    fn push_rx(&mut self, b: u8) {
        if self.rx.len() >= FIFO_SIZE {
            self.overrun = true;
        } else {
            self.rx.push_back(b);
        }
    }

    fn msr(&self) -> u8 {
        if self.mcr & MCR_LOOPBACK != 0 {
            let mut v = 0;
            if self.mcr & MCR_RTS != 0 {
                v |= MSR_CTS;
            }
            if self.mcr & MCR_DTR != 0 {
                v |= MSR_DSR;
            }
            if self.mcr & MCR_OUT1 != 0 {
                v |= MSR_RI;
            }
            if self.mcr & MCR_OUT2 != 0 {
                v |= MSR_DCD;
            }
            v
        } else {
            MSR_DCD | MSR_DSR | MSR_CTS
        }
    }

    /// Whether the line should be asserted; OUT2 gates it to the PIC.
    fn line(&self) -> bool {
        self.iir() & IIR_NOPEND == 0 && self.mcr & MCR_OUT2 != 0
    }
}

/// A 16550 at `port` wired to legacy `irq`.
pub struct VUart {
    pub port: u16,
    pub irq: u8,
    state: SpinLock<UartState>,
}

impl VUart {
    pub fn new(port: u16, irq: u8) -> Self {
        Self {
            port,
            irq,
            state: SpinLock::new(UartState::new()),
        }
    }

    /// Power-on state.
    pub fn reset(&self) {
        *self.state.lock() = UartState::new();
    }

    fn update_irq(&self, hv: &Hypervisor, vm: &Vm, st: &mut UartState) {
        let line = st.line();
        if line == st.asserted {
            return;
        }
        st.asserted = line;
        if line {
            vpic_raise(hv, vm, self.irq);
        } else {
            vpic_lower(vm, self.irq);
        }
    }

    /// Queue bytes received from the console.
    pub fn receive(&self, hv: &Hypervisor, vm: &Vm, bytes: &[u8]) {
        let mut st = self.state.lock();
        bytes.iter().for_each(|&b| st.push_rx(b));
        self.update_irq(hv, vm, &mut st);
    }

    /// Drain what the guest transmitted.
    pub fn take_tx(&self) -> Vec<u8> {
        let mut st = self.state.lock();
        core::mem::replace(&mut st.tx, Vec::with_capacity(FIFO_SIZE))
    }
}

impl PioHandler for VUart {
    fn read(&self, hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth) -> u32 {
        let mut st = self.state.lock();
        let dlab = st.lcr & LCR_DLAB != 0;
        let v = match port.wrapping_sub(self.port) {
            UART_RBR if dlab => st.dll,
            UART_RBR => st.rx.pop_front().unwrap_or(0),
            UART_IER if dlab => st.dlh,
            UART_IER => st.ier,
            UART_IIR => {
                let iir = st.iir();
                // Reading IIR acknowledges a THR empty interrupt.
                if iir & 0xf == IIR_TXRDY {
                    st.thre_pending = false;
                }
                iir
            }
            UART_LCR => st.lcr,
            UART_MCR => st.mcr,
            UART_LSR => {
                let mut lsr = LSR_THRE | LSR_TEMT;
                if !st.rx.is_empty() {
                    lsr |= LSR_DR;
                }
                if core::mem::take(&mut st.overrun) {
                    lsr |= LSR_OE;
                }
                lsr
            }
            UART_MSR => st.msr(),
            UART_SCR => st.scr,
            _ => 0xff,
        };
        self.update_irq(hv, vm, &mut st);
        v as u32
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, _width: IoWidth, value: u32) {
        let v = value as u8;
        let mut st = self.state.lock();
        let dlab = st.lcr & LCR_DLAB != 0;
        match port.wrapping_sub(self.port) {
            UART_RBR if dlab => st.dll = v,
            UART_RBR => {
                if st.mcr & MCR_LOOPBACK != 0 {
                    st.push_rx(v);
                } else if st.tx.len() < FIFO_SIZE {
                    st.tx.push(v);
                }
                st.thre_pending = true;
            }
            UART_IER if dlab => st.dlh = v,
            UART_IER => {
                // Enabling THRE interrupts raises one right away.
                if v & IER_ETBEI != 0 && st.ier & IER_ETBEI == 0 {
                    st.thre_pending = true;
                }
                st.ier = v & IER_MASK;
            }
            UART_IIR => {
                if v & FCR_RCV_RST != 0 {
                    st.rx.clear();
                }
                st.fcr = v & FCR_ENABLE;
            }
            UART_LCR => st.lcr = v,
            UART_MCR => st.mcr = v & 0x1f,
            UART_SCR => st.scr = v,
            _ => (),
        }
        self.update_irq(hv, vm, &mut st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{io::emulate_io, io::PioRequest, tests::Harness, vmx::vmcs::IoDirection};

    fn out(h: &Harness, vm: &Vm, port: u16, v: u8) {
        let mut req = PioRequest {
            port,
            width: IoWidth::Byte,
            direction: IoDirection::Out,
            value: v as u32,
        };
        emulate_io(&h.hv, vm, vm.bsp().unwrap(), &mut req);
    }

    fn inb(h: &Harness, vm: &Vm, port: u16) -> u8 {
        let mut req = PioRequest {
            port,
            width: IoWidth::Byte,
            direction: IoDirection::In,
            value: 0,
        };
        emulate_io(&h.hv, vm, vm.bsp().unwrap(), &mut req);
        req.value as u8
    }

    #[test]
    fn transmit_and_divisor_latch() {
        let h = Harness::new();
        let vm = h.vm(1);
        out(&h, &vm, 0x3fb, LCR_DLAB);
        out(&h, &vm, 0x3f8, 0x01);
        out(&h, &vm, 0x3f9, 0x00);
        out(&h, &vm, 0x3fb, 0x03);
        assert_eq!(inb(&h, &vm, 0x3fb), 0x03);
        for b in b"ok" {
            out(&h, &vm, 0x3f8, *b);
        }
        let uart = vm.devices.vuart[0].as_ref().unwrap();
        assert_eq!(uart.take_tx(), b"ok");
        assert!(uart.take_tx().is_empty());
        assert_eq!(inb(&h, &vm, 0x3fd), LSR_THRE | LSR_TEMT);
        assert_eq!(inb(&h, &vm, 0x3fe), MSR_DCD | MSR_DSR | MSR_CTS);
    }

    #[test]
    fn receive_raises_the_line() {
        let h = Harness::new();
        let vm = h.vm(1);
        let uart = vm.devices.vuart[0].clone().unwrap();
        out(&h, &vm, 0x3f9, IER_ERBFI);
        out(&h, &vm, 0x3fc, MCR_OUT2);
        uart.receive(&h.hv, &vm, b"hi");
        assert!(uart.state.lock().asserted);
        assert_eq!(inb(&h, &vm, 0x3fa) & 0xf, IIR_RXRDY);
        assert_eq!(inb(&h, &vm, 0x3fd) & LSR_DR, LSR_DR);
        assert_eq!(inb(&h, &vm, 0x3f8), b'h');
        assert_eq!(inb(&h, &vm, 0x3f8), b'i');
        assert!(!uart.state.lock().asserted);
        assert_eq!(inb(&h, &vm, 0x3fa) & 0xf, IIR_NOPEND);
        // Empty FIFO reads zero.
        assert_eq!(inb(&h, &vm, 0x3f8), 0);
    }

    #[test]
    fn loopback_and_overrun() {
        let h = Harness::new();
        let vm = h.vm(1);
        let uart = vm.devices.vuart[0].clone().unwrap();
        out(&h, &vm, 0x3fc, MCR_LOOPBACK | MCR_RTS);
        assert_eq!(inb(&h, &vm, 0x3fe), MSR_CTS);
        out(&h, &vm, 0x3f8, 0x5a);
        assert_eq!(inb(&h, &vm, 0x3f8), 0x5a);
        assert!(uart.take_tx().is_empty());

        uart.receive(&h.hv, &vm, &[0u8; FIFO_SIZE + 1]);
        assert_eq!(inb(&h, &vm, 0x3fd) & LSR_OE, LSR_OE);
        assert_eq!(inb(&h, &vm, 0x3fd) & LSR_OE, 0);
    }

    #[test]
    fn thre_interrupt_is_acknowledged_by_iir() {
        let h = Harness::new();
        let vm = h.vm(1);
        out(&h, &vm, 0x3fc, MCR_OUT2);
        out(&h, &vm, 0x3f9, IER_ETBEI);
        assert_eq!(inb(&h, &vm, 0x3fa) & 0xf, IIR_TXRDY);
        assert_eq!(inb(&h, &vm, 0x3fa) & 0xf, IIR_NOPEND);
        out(&h, &vm, 0x3f8, b'x');
        assert_eq!(inb(&h, &vm, 0x3fa) & 0xf, IIR_TXRDY);
    }
}
