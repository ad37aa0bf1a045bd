//! The hypervisor singleton.
//!
//! Everything that is process wide lives in [`Hypervisor`]: the hardware
//! seams, the timebase, the host vector table, the passthrough interrupt
//! pool, the per-pCPU areas and the VM slots. One value is built by
//! [`crate::boot::init_primary_pcpu`] and every component receives it by
//! reference.

use crate::{
    config::{HvOptions, VmId, MAX_PCPU, MAX_VM},
    console::Console,
    irq::IrqRegistry,
    percpu::PerCpu,
    ptirq::PtirqTable,
    vcpu::VCpu,
    vm::Vm,
    vmx::{self, control::IA32_VMX_EPT_VPID_CAP, Vmx},
    Errno,
};
use abyss::{
    addressing::Pa,
    boot::e820::HostE820,
    dev::{x86_64::apic, ConsoleUart},
    platform::Platform,
    timebase::Timebase,
};
use alloc::{sync::Arc, vec::Vec};
use spin_lock::{RwSpinLock, SpinLock};

/// Vector kicking a pCPU out of its guest.
pub const NOTIFY_VECTOR: u8 = 0xf0;
/// Notification vector of posted interrupts.
pub const POSTED_INTR_VECTOR: u8 = 0xf2;

/// EPT capability: 1-GByte pages.
const EPT_CAP_1G_PAGE: u64 = 1 << 17;

/// The hypervisor.
pub struct Hypervisor {
    pub platform: Arc<dyn Platform>,
    pub vmx: Arc<dyn Vmx>,
    pub options: HvOptions,
    pub timebase: Timebase,
    /// Memory map of the host, with the hypervisor reservations carved out.
    pub host_e820: HostE820,
    /// Start of the AP startup trampoline below 1 MiB.
    pub trampoline: Option<Pa>,
    pub irq: IrqRegistry,
    pub ptirq: PtirqTable,
    pub console: Console,
    /// Serializes index/data accesses to the physical CMOS.
    pub cmos_lock: SpinLock<()>,
    /// Serializes CF8/CFC accesses to the physical PCI configuration space.
    pub pci_cfg_lock: SpinLock<()>,
    percpus: Vec<PerCpu>,
    vms: RwSpinLock<[Option<Arc<Vm>>; MAX_VM]>,
    vmcs_revision: u32,
    ept_1g: bool,
}

impl Hypervisor {
    /// Assemble the hypervisor over the given hardware.
    ///
    /// The timebase is left uncalibrated and no pCPU is online.
    pub fn new(
        platform: Arc<dyn Platform>,
        vmx: Arc<dyn Vmx>,
        uart: Option<Arc<dyn ConsoleUart>>,
        options: HvOptions,
        host_e820: HostE820,
    ) -> Self {
        let vmcs_revision = vmx::vmcs_revision(&*platform);
        let ept_1g = platform.rdmsr(IA32_VMX_EPT_VPID_CAP) & EPT_CAP_1G_PAGE != 0;
        Self {
            console: Console::new(uart, options.console_vm),
            platform,
            vmx,
            options,
            timebase: Timebase::new(),
            host_e820,
            trampoline: None,
            irq: IrqRegistry::new(),
            ptirq: PtirqTable::new(),
            cmos_lock: SpinLock::new(()),
            pci_cfg_lock: SpinLock::new(()),
            percpus: (0..MAX_PCPU).map(PerCpu::new).collect(),
            vms: RwSpinLock::new([(); MAX_VM].map(|_| None)),
            vmcs_revision,
            ept_1g,
        }
    }

    /// Area of `pcpu_id`.
    #[inline]
    pub fn percpu(&self, pcpu_id: usize) -> Option<&PerCpu> {
        self.percpus.get(pcpu_id)
    }

    pub fn percpus(&self) -> impl Iterator<Item = &PerCpu> + '_ {
        self.percpus.iter()
    }

    /// Id of the calling pCPU. The x2APIC id of a pCPU is its index.
    #[inline]
    pub fn current_pcpu(&self) -> usize {
        self.platform.rdmsr(apic::MSR_X2APIC_ID) as usize
    }

    /// Bitmap of online pCPUs.
    pub fn online_mask(&self) -> u64 {
        self.percpus
            .iter()
            .filter(|p| p.is_online())
            .fold(0, |m, p| m | 1 << p.pcpu_id)
    }

    /// The VM in slot `vm_id`.
    pub fn vm(&self, vm_id: VmId) -> Option<Arc<Vm>> {
        self.vms.read().get(vm_id as usize)?.clone()
    }

    /// Every VM currently installed.
    pub fn vms(&self) -> Vec<Arc<Vm>> {
        self.vms.read().iter().flatten().cloned().collect()
    }

    pub(crate) fn install_vm(&self, vm: Arc<Vm>) -> Result<(), Errno> {
        let mut vms = self.vms.write();
        let slot = vms.get_mut(vm.vm_id as usize).ok_or(Errno::EINVAL)?;
        if slot.is_some() {
            return Err(Errno::EBUSY);
        }
        *slot = Some(vm);
        Ok(())
    }

    pub(crate) fn remove_vm(&self, vm_id: VmId) -> Option<Arc<Vm>> {
        self.vms.write().get_mut(vm_id as usize)?.take()
    }

    /// Make a remote pCPU leave its guest and look at its requests.
    pub fn kick_pcpu(&self, pcpu_id: usize) {
        if pcpu_id != self.current_pcpu() && pcpu_id < self.percpus.len() {
            apic::send_ipi(&*self.platform, pcpu_id as u32, NOTIFY_VECTOR);
        }
    }

    /// Make `vcpu` exit if it is inside its guest on another pCPU.
    pub fn kick_vcpu(&self, vcpu: &VCpu) {
        if vcpu.is_running() {
            self.kick_pcpu(vcpu.pcpu_id);
        }
    }

    /// Signal a posted interrupt to `vcpu`.
    ///
    /// A vCPU in its guest takes the notification without exiting; one that
    /// is not picks the interrupt up at its next entry.
    pub fn notify_posted_intr(&self, vcpu: &VCpu) {
        if vcpu.is_running() && vcpu.pcpu_id != self.current_pcpu() {
            apic::send_ipi(&*self.platform, vcpu.pcpu_id as u32, POSTED_INTR_VECTOR);
        }
    }

    #[inline]
    pub fn posted_intr_vector(&self) -> u8 {
        POSTED_INTR_VECTOR
    }

    /// Revision identifier for VMCS and VMXON regions.
    #[inline]
    pub fn vmcs_revision(&self) -> u32 {
        self.vmcs_revision
    }

    /// Whether EPT supports 1 GiB leaves.
    #[inline]
    pub fn ept_1g(&self) -> bool {
        self.ept_1g
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Harness;
    use abyss::dev::x86_64::apic::{ICR_DELIVERY_FIXED, ICR_LEVEL_ASSERT};

    #[test]
    fn kicks_target_remote_pcpus_only() {
        let h = Harness::new();
        h.hv.kick_pcpu(0);
        h.hv.kick_pcpu(7);
        assert!(h.p.icr_log().is_empty());
        h.hv.kick_pcpu(2);
        assert_eq!(h.p.icr_log(), [(2, ICR_LEVEL_ASSERT | ICR_DELIVERY_FIXED | NOTIFY_VECTOR as u32)]);
    }

    #[test]
    fn idle_vcpus_are_not_kicked() {
        let h = Harness::new();
        let vm = h.vm(1);
        let vcpu = vm.bsp().unwrap();
        h.hv.kick_vcpu(vcpu);
        h.hv.notify_posted_intr(vcpu);
        assert!(h.p.icr_log().is_empty());
        vcpu.set_running(true);
        h.hv.notify_posted_intr(vcpu);
        assert_eq!(h.p.icr_log(), [(2, ICR_LEVEL_ASSERT | POSTED_INTR_VECTOR as u32)]);
    }

    #[test]
    fn slots_hold_one_vm() {
        let h = Harness::new();
        let vm = h.vm(0);
        assert_eq!(h.hv.install_vm(vm.clone()), Err(Errno::EBUSY));
        assert_eq!(h.hv.vms().len(), 2);
        assert!(h.hv.remove_vm(0).is_some());
        assert!(h.hv.vm(0).is_none());
        assert!(h.hv.vm(9).is_none());
        h.hv.install_vm(vm).unwrap();
    }
}
