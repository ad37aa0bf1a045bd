//! Per-pCPU state.
//!
//! Every pCPU owns one [`PerCpu`]. Remote pCPUs only ever set request flags
//! or the shutdown target and then kick the owner with an IPI; the owner
//! consumes them at its next exit boundary.

use crate::{
    config::{VmId, INVALID_VMID},
    vm::Vm,
    vmx::vmcs::Vmcs,
};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use spin_lock::SpinLock;

bitflags::bitflags! {
    /// Pending actions posted to a pCPU.
    pub struct PcpuFlags: u64 {
        /// Leave the run loop and park.
        const NEED_OFFLINE = 1 << 0;
        /// Shut down the VM named by `shutdown_vm_id`.
        const NEED_SHUTDOWN_VM = 1 << 1;
        /// Re-evaluate what is bound to this pCPU.
        const NEED_RESCHEDULE = 1 << 2;
        /// Service the physical console.
        const CONSOLE_KICK = 1 << 3;
    }
}

/// The vCPU bound to a pCPU.
#[derive(Clone)]
pub struct Assignment {
    pub vm: Arc<Vm>,
    pub vcpu_id: usize,
}

impl core::fmt::Debug for Assignment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Assignment(vm{}, vcpu{})", self.vm.vm_id, self.vcpu_id)
    }
}

/// State of one physical CPU.
pub struct PerCpu {
    pub pcpu_id: usize,
    flags: AtomicU64,
    shutdown_vm_id: AtomicU16,
    online: AtomicBool,
    slot: SpinLock<Option<Assignment>>,
    tsc_deadline: AtomicU64,
    vmxon_region: SpinLock<Option<Box<Vmcs>>>,
}

impl PerCpu {
    /// An offline pCPU with nothing bound to it.
    pub fn new(pcpu_id: usize) -> Self {
        Self {
            pcpu_id,
            flags: AtomicU64::new(0),
            shutdown_vm_id: AtomicU16::new(INVALID_VMID),
            online: AtomicBool::new(false),
            slot: SpinLock::new(None),
            tsc_deadline: AtomicU64::new(0),
            vmxon_region: SpinLock::new(None),
        }
    }

    /// Post `flags`.
    #[inline]
    pub fn request(&self, flags: PcpuFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Consume `flag`, returning whether it was pending.
    #[inline]
    pub fn take(&self, flag: PcpuFlags) -> bool {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    /// Flags currently pending.
    #[inline]
    pub fn pending(&self) -> PcpuFlags {
        PcpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Record the VM this pCPU must shut down from its idle path.
    pub fn set_shutdown_vm_id(&self, vm_id: VmId) {
        self.shutdown_vm_id.store(vm_id, Ordering::Release);
    }

    /// The recorded shutdown target.
    pub fn shutdown_vm_id(&self) -> VmId {
        self.shutdown_vm_id.load(Ordering::Acquire)
    }

    /// Take the recorded shutdown target, leaving [`INVALID_VMID`] behind.
    pub fn take_shutdown_vm_id(&self) -> VmId {
        self.shutdown_vm_id.swap(INVALID_VMID, Ordering::AcqRel)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Bind a vCPU to this pCPU.
    ///
    /// A pCPU runs at most one vCPU; binding over an existing assignment
    /// fails and returns the rejected one.
    pub fn assign(&self, a: Assignment) -> Result<(), Assignment> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(a);
        }
        *slot = Some(a);
        Ok(())
    }

    /// Drop the assignment if it belongs to `vm_id`.
    pub fn unassign(&self, vm_id: VmId) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map_or(false, |a| a.vm.vm_id == vm_id) {
            *slot = None;
        }
    }

    /// The vCPU currently bound to this pCPU.
    pub fn current(&self) -> Option<Assignment> {
        self.slot.lock().clone()
    }

    /// TSC value of the next hypervisor timer event on this pCPU, zero if none.
    pub fn tsc_deadline(&self) -> u64 {
        self.tsc_deadline.load(Ordering::Acquire)
    }

    pub fn set_tsc_deadline(&self, deadline: u64) {
        self.tsc_deadline.store(deadline, Ordering::Release);
    }

    /// Install the VMXON region; kept for the lifetime of the pCPU.
    pub fn set_vmxon_region(&self, region: Box<Vmcs>) {
        *self.vmxon_region.lock() = Some(region);
    }

    pub fn has_vmxon_region(&self) -> bool {
        self.vmxon_region.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_consumed_once() {
        let p = PerCpu::new(1);
        p.request(PcpuFlags::NEED_SHUTDOWN_VM | PcpuFlags::CONSOLE_KICK);
        assert!(p.take(PcpuFlags::NEED_SHUTDOWN_VM));
        assert!(!p.take(PcpuFlags::NEED_SHUTDOWN_VM));
        assert_eq!(p.pending(), PcpuFlags::CONSOLE_KICK);
    }

    #[test]
    fn shutdown_target_is_quiescent_after_take() {
        let p = PerCpu::new(0);
        assert_eq!(p.take_shutdown_vm_id(), INVALID_VMID);
        p.set_shutdown_vm_id(1);
        assert_eq!(p.take_shutdown_vm_id(), 1);
        assert_eq!(p.shutdown_vm_id(), INVALID_VMID);
    }

    #[test]
    fn concurrent_requests() {
        let p = PerCpu::new(0);
        std::thread::scope(|s| {
            for f in [PcpuFlags::NEED_OFFLINE, PcpuFlags::NEED_RESCHEDULE, PcpuFlags::CONSOLE_KICK] {
                let p = &p;
                s.spawn(move || {
                    for _ in 0..1000 {
                        p.request(f);
                    }
                });
            }
        });
        assert_eq!(
            p.pending(),
            PcpuFlags::NEED_OFFLINE | PcpuFlags::NEED_RESCHEDULE | PcpuFlags::CONSOLE_KICK
        );
    }
}
