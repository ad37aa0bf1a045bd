//! The physical console.
//!
//! The UART belongs either to one VM, whose first vUART it backs, or to the
//! hypervisor shell. Ctrl+Space toggles between the two. The console pCPU
//! polls the UART from its preemption timer, see [`console_kick`].

use crate::{
    config::{VmId, INVALID_VMID},
    hv::Hypervisor,
};
use abyss::dev::ConsoleUart;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU16, Ordering};
use spin_lock::SpinLock;

/// Ctrl+Space.
pub const CONSOLE_SWITCH_KEY: u8 = 0x00;

/// Upper bound of bytes taken from the UART per kick.
const RX_BURST: usize = 64;

/// The debug shell. Line editing and commands live outside the core.
pub trait ShellSink
where
    Self: Send + Sync,
{
    /// One byte typed while the shell owns the console.
    fn input(&self, hv: &Hypervisor, byte: u8);
}

/// Console routing state.
pub struct Console {
    uart: Option<Arc<dyn ConsoleUart>>,
    shell: SpinLock<Option<Arc<dyn ShellSink>>>,
    vm_id: AtomicU16,
    /// Where the switch key goes back to from the shell.
    last_vm_id: AtomicU16,
}

impl Console {
    pub fn new(uart: Option<Arc<dyn ConsoleUart>>, vm_id: VmId) -> Self {
        Self {
            uart,
            shell: SpinLock::new(None),
            vm_id: AtomicU16::new(vm_id),
            last_vm_id: AtomicU16::new(if vm_id == INVALID_VMID { 0 } else { vm_id }),
        }
    }

    pub fn set_shell(&self, shell: Arc<dyn ShellSink>) {
        *self.shell.lock() = Some(shell);
    }

    /// VM owning the console, [`INVALID_VMID`] while the shell does.
    #[inline]
    pub fn console_vmid(&self) -> VmId {
        self.vm_id.load(Ordering::Acquire)
    }

    /// Hand the console to `vm_id`, or to the shell with [`INVALID_VMID`].
    pub fn set_console_vmid(&self, vm_id: VmId) {
        if vm_id != INVALID_VMID {
            self.last_vm_id.store(vm_id, Ordering::Release);
        }
        self.vm_id.store(vm_id, Ordering::Release);
    }

    /// Flip between the shell and the last guest.
    fn switch(&self) -> VmId {
        let next = match self.console_vmid() {
            INVALID_VMID => self.last_vm_id.load(Ordering::Acquire),
            cur => {
                self.last_vm_id.store(cur, Ordering::Release);
                INVALID_VMID
            }
        };
        self.vm_id.store(next, Ordering::Release);
        next
    }
}

/// Service the console once.
///
/// Pending input is routed to the console VM or the shell, and whatever the
/// guests transmitted since the last kick is drained. Only the output of the
/// console VM reaches the UART.
pub fn console_kick(hv: &Hypervisor) {
    let console = &hv.console;
    let Some(uart) = console.uart.as_ref() else {
        return;
    };

    let mut rx = Vec::new();
    for _ in 0..RX_BURST {
        let Some(byte) = uart.getc() else {
            break;
        };
        if byte == CONSOLE_SWITCH_KEY {
            deliver(hv, console.console_vmid(), &core::mem::take(&mut rx));
            match console.switch() {
                INVALID_VMID => log::info!("console: switched to the hypervisor shell"),
                vm_id => log::info!("console: switched to vm{}", vm_id),
            }
            continue;
        }
        rx.push(byte);
    }
    deliver(hv, console.console_vmid(), &rx);

    let owner = console.console_vmid();
    for vm in hv.vms() {
        let Some(vuart) = vm.devices.vuart[0].as_ref() else {
            continue;
        };
        let tx = vuart.take_tx();
        if vm.vm_id == owner && !tx.is_empty() {
            uart.write_bytes(&tx);
        }
    }
}

fn deliver(hv: &Hypervisor, vm_id: VmId, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    if vm_id == INVALID_VMID {
        let shell = hv.console.shell.lock().clone();
        match shell {
            Some(shell) => bytes.iter().for_each(|&b| shell.input(hv, b)),
            None => log::debug!("console: no shell, {} byte(s) dropped", bytes.len()),
        }
        return;
    }
    match hv.vm(vm_id) {
        Some(vm) if vm.is_started() => {
            if let Some(vuart) = vm.devices.vuart[0].as_ref() {
                vuart.receive(hv, &vm, bytes);
            }
        }
        _ => log::debug!("console: vm{} cannot take input", vm_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::Harness, vm::start_vm};

    struct Record(SpinLock<Vec<u8>>);

    impl ShellSink for Record {
        fn input(&self, _hv: &Hypervisor, byte: u8) {
            self.0.lock().push(byte);
        }
    }

    #[test]
    fn guest_output_reaches_the_uart() {
        let h = Harness::new();
        let (vm0, vm1) = (h.vm(0), h.vm(1));
        start_vm(&h.hv, &vm0).unwrap();
        start_vm(&h.hv, &vm1).unwrap();
        h.pio_out(&vm0, 0x3f8, b'a');
        h.pio_out(&vm1, 0x3f8, b'b');
        console_kick(&h.hv);
        assert_eq!(h.p.take_tx(), b"a");
        // The other VM's output was drained, not queued.
        h.hv.console.set_console_vmid(1);
        console_kick(&h.hv);
        assert!(h.p.take_tx().is_empty());
    }

    #[test]
    fn input_goes_to_the_console_vm() {
        let h = Harness::new();
        let vm0 = h.vm(0);
        start_vm(&h.hv, &vm0).unwrap();
        // Receive interrupt enabled.
        h.pio_out(&vm0, 0x3f9, 0x1);
        h.p.push_rx(b"ls");
        console_kick(&h.hv);
        assert_eq!(h.pio_in(&vm0, 0x3f8), b'l' as u32);
        assert_eq!(h.pio_in(&vm0, 0x3f8), b's' as u32);
    }

    #[test]
    fn switch_key_toggles_the_shell() {
        let h = Harness::new();
        let shell = Arc::new(Record(SpinLock::new(Vec::new())));
        h.hv.console.set_shell(shell.clone());
        start_vm(&h.hv, &h.vm(0)).unwrap();
        assert_eq!(h.hv.console.console_vmid(), 0);

        h.p.push_rx(&[CONSOLE_SWITCH_KEY, b'h']);
        console_kick(&h.hv);
        assert_eq!(h.hv.console.console_vmid(), INVALID_VMID);
        assert_eq!(*shell.0.lock(), b"h");

        h.p.push_rx(&[CONSOLE_SWITCH_KEY]);
        console_kick(&h.hv);
        assert_eq!(h.hv.console.console_vmid(), 0);
    }
}
