//! Virtual machine interface.
//!
//! A [`Vm`] is built once from its static [`VmConfig`] and walks the state
//! machine
//!
//! ```text
//! Created --start--> Started --pause--> Paused --shutdown--> PoweredOff
//!                      ^                  |
//!                      \----- resume -----/
//! ```
//!
//! All transitions of one VM serialize under its lifecycle lock. vCPUs of
//! the VM observe them at their next VM exit.
use crate::{
    config::{ConfigError, GuestFlags, VmConfig, VmId, INVALID_VMID},
    dev,
    e820::{create_prelaunched_vm_e820, PRELAUNCHED_E820_ENTRIES},
    ept::{Ept, EPT_RAM},
    hv::Hypervisor,
    io::PioTable,
    percpu::{Assignment, PcpuFlags},
    ptirq::ptdev_release_all_entries,
    util::list::IndexList,
    vcpu::{StartupState, VCpu, VCpuArch, VCpuRequest, VCpuState},
    vcpuid::CpuidCache,
    vlapic::{ApicvOps, VLapic, HARDWARE_APICV, SOFTWARE_APICV},
    vmsr::{init_msr_bitmap, MsrBitmap},
    vmx::vmcs::Vmcs,
    Errno, VmError,
};
use abyss::boot::e820::E820Entry;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use spin_lock::{RwSpinLock, SpinLock};

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(usize);

impl Gpa {
    /// A guest physical address, if `addr` fits the 52-bit physical space.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < (1 << 52) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "gpa:{:#x}", self.0)
    }
}

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum VmState {
    Created,
    Started,
    Paused,
    PoweredOff,
}

/// Register state the BSP starts from, set by the guest loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRegs {
    pub entry: u64,
    /// Boot parameter pointer handed over in `rsi`.
    pub rsi: u64,
}

/// The virtual machine.
pub struct Vm {
    pub vm_id: VmId,
    pub config: &'static VmConfig,
    state: AtomicU8,
    pub e820: [E820Entry; PRELAUNCHED_E820_ENTRIES],
    pub ept: RwSpinLock<Ept>,
    vcpus: Vec<VCpu>,
    pub(crate) pio: RwSpinLock<PioTable>,
    pub devices: dev::Devices,
    /// Passthrough interrupt entries waiting for delivery.
    pub softirq: SpinLock<IndexList>,
    boot: SpinLock<BootRegs>,
    reset_pending: AtomicBool,
    /// Set once a shutdown owns the VM; cleared never.
    shutting_down: AtomicBool,
    /// Number of deliveries re-queued because the VM could not take them.
    pub requeued: AtomicU64,
    lock: SpinLock<()>,
}

impl Vm {
    #[inline]
    pub fn state(&self) -> VmState {
        VmState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(VmState::PoweredOff)
    }

    fn set_state(&self, s: VmState) {
        self.state.store(s.into(), Ordering::Release);
    }

    pub fn is_created(&self) -> bool {
        self.state() == VmState::Created
    }

    pub fn is_started(&self) -> bool {
        self.state() == VmState::Started
    }

    pub fn is_paused(&self) -> bool {
        self.state() == VmState::Paused
    }

    pub fn is_poweroff(&self) -> bool {
        self.state() == VmState::PoweredOff
    }

    /// Whether a shutdown is tearing the VM down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Whether this VM may act on other VMs.
    pub fn is_highest_severity(&self) -> bool {
        self.config.guest_flags.contains(GuestFlags::HIGHEST_SEVERITY)
    }

    /// vCPUs in id order.
    #[inline]
    pub fn vcpus(&self) -> impl Iterator<Item = &VCpu> + '_ {
        self.vcpus.iter()
    }

    #[inline]
    pub fn vcpu(&self, vcpu_id: usize) -> Option<&VCpu> {
        self.vcpus.get(vcpu_id)
    }

    /// The bootstrap processor.
    pub fn bsp(&self) -> Option<&VCpu> {
        self.vcpus.first()
    }

    pub fn vcpu_num(&self) -> usize {
        self.vcpus.len()
    }

    /// Bitmap of every vCPU id.
    pub fn vcpu_mask(&self) -> u64 {
        (1u64 << self.vcpus.len()) - 1
    }

    /// Set the state the BSP enters at its next VMCS initialization.
    pub fn set_boot_regs(&self, regs: BootRegs) {
        *self.boot.lock() = regs;
    }

    pub fn boot_regs(&self) -> BootRegs {
        *self.boot.lock()
    }

    /// Load `arch` with the state `vcpu` starts from.
    pub(crate) fn init_arch(&self, vcpu: &VCpu, arch: &mut VCpuArch) {
        if vcpu.is_bsp() {
            let regs = self.boot_regs();
            arch.reset(StartupState::Protected32 { entry: regs.entry });
            arch.context().gprs.rsi = regs.rsi as usize;
        } else {
            arch.reset(StartupState::WaitForSipi);
        }
    }

    pub(crate) fn take_reset_pending(&self) -> bool {
        self.reset_pending.swap(false, Ordering::AcqRel)
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("vm_id", &self.vm_id)
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

fn apicv_ops(config: &VmConfig) -> &'static dyn ApicvOps {
    if config.guest_flags.contains(GuestFlags::LAPIC_PASSTHROUGH) {
        &HARDWARE_APICV
    } else {
        &SOFTWARE_APICV
    }
}

/// Build the VM described by `config` and install it in its slot.
///
/// The E820 and EPT are built, every vCPU is created with its vLAPIC and
/// the devices are registered. The VM is left in [`VmState::Created`].
pub fn create_vm(hv: &Hypervisor, config: &'static VmConfig) -> Result<Arc<Vm>, VmError> {
    let vm_id = config.vm_id;
    if hv.vm(vm_id).is_some() {
        return Err(Errno::EBUSY.into());
    }

    let mem = &config.memory;
    let e820 = create_prelaunched_vm_e820(mem);
    let mut ept = Ept::new(hv.ept_1g());
    // GPA 0 is the first byte of the window. The reserved ACPI hole is
    // backed too; the guest BIOS area lives there.
    ept.add_mr(mem.start_hpa, 0, mem.size, EPT_RAM)?;

    let ops = apicv_ops(config);
    let cpuid = CpuidCache::new(&*hv.platform, config);
    let mut vcpus = Vec::with_capacity(config.vcpu_num());
    for vcpu_id in 0..config.vcpu_num() {
        let pcpu_id = config
            .pcpu_of(vcpu_id)
            .ok_or(ConfigError::EmptyAffinity(vm_id))?;
        let mut bitmap = Box::new(MsrBitmap::new());
        init_msr_bitmap(&mut bitmap);
        ops.setup_msr_bitmap(&mut bitmap);
        let startup = if vcpu_id == 0 {
            StartupState::Protected32 {
                entry: config.os.entry_addr,
            }
        } else {
            StartupState::WaitForSipi
        };
        let arch = VCpuArch::new(
            Box::new(Vmcs::new(hv.vmcs_revision())),
            cpuid.clone(),
            bitmap,
            startup,
        );
        let vlapic = VLapic::create(vm_id, vcpu_id as u16, ops);
        vcpus.push(VCpu::new(vm_id, vcpu_id as u16, pcpu_id, vlapic, arch));
    }

    let vm = Arc::new(Vm {
        vm_id,
        config,
        state: AtomicU8::new(VmState::Created.into()),
        e820,
        ept: RwSpinLock::new(ept),
        vcpus,
        pio: RwSpinLock::new(PioTable::new()),
        devices: dev::Devices::new(config),
        softirq: SpinLock::new(IndexList::new()),
        boot: SpinLock::new(BootRegs {
            entry: config.os.entry_addr,
            rsi: 0,
        }),
        reset_pending: AtomicBool::new(false),
        shutting_down: AtomicBool::new(false),
        requeued: AtomicU64::new(0),
        lock: SpinLock::new(()),
    });
    dev::init_vm_devices(hv, &vm)?;
    hv.install_vm(vm.clone())?;
    log::info!(
        "vm{} ({}) created: {} vCPU(s), {} MiB at {:#x}, {}",
        vm_id,
        config.name,
        vm.vcpu_num(),
        mem.size >> 20,
        mem.start_hpa,
        ops.name()
    );
    Ok(vm)
}

/// Create the VM of `vm_id` and load its guest image.
pub fn prepare_vm(
    hv: &Hypervisor,
    vm_id: VmId,
    boot: &abyss::boot::BootInfo,
) -> Result<Arc<Vm>, VmError> {
    let config = crate::config::get_vm_config(vm_id).ok_or(Errno::EINVAL)?;
    let vm = create_vm(hv, config)?;
    if let Err(e) = crate::vboot::load_guest(hv, &vm, boot) {
        log::error!("prepare_vm: vm{} guest load failed: {:?}", vm_id, e);
        if let Err(e) = shutdown_vm(hv, &vm) {
            log::warn!("prepare_vm: vm{} teardown: {:?}", vm_id, e);
        }
        return Err(e);
    }
    Ok(vm)
}

/// Bind every vCPU to its pCPU and let the BSP run.
pub fn start_vm(hv: &Hypervisor, vm: &Arc<Vm>) -> Result<(), Errno> {
    let _guard = vm.lock.lock();
    if !vm.is_created() {
        return Err(Errno::EINVAL);
    }
    for vcpu in vm.vcpus() {
        let percpu = hv.percpu(vcpu.pcpu_id).ok_or(Errno::EINVAL)?;
        match percpu.assign(Assignment {
            vm: vm.clone(),
            vcpu_id: vcpu.vcpu_id as usize,
        }) {
            Ok(()) => (),
            Err(a) if a.vm.vm_id == vm.vm_id => (),
            Err(_) => {
                log::error!("start_vm: pcpu{} already runs another vCPU", vcpu.pcpu_id);
                return Err(Errno::EBUSY);
            }
        }
    }
    if let Some(bsp) = vm.bsp() {
        bsp.set_state(VCpuState::Running);
    }
    vm.set_state(VmState::Started);
    for vcpu in vm.vcpus() {
        hv.kick_pcpu(vcpu.pcpu_id);
    }
    log::info!("vm{} started", vm.vm_id);
    Ok(())
}

/// Stop every vCPU of a started `vm` at its next exit.
///
/// Safe to call from the exit handler of a vCPU of `vm` itself: the
/// lifecycle lock is never held while waiting for vCPUs.
pub fn pause_vm(hv: &Hypervisor, vm: &Vm) {
    let _guard = vm.lock.lock();
    if vm.is_started() {
        pause_vcpus(hv, vm);
        vm.set_state(VmState::Paused);
    }
}

fn pause_vcpus(hv: &Hypervisor, vm: &Vm) {
    for vcpu in vm.vcpus() {
        vcpu.pause();
        hv.kick_vcpu(vcpu);
    }
}

/// Undo [`pause_vm`].
pub fn resume_vm(hv: &Hypervisor, vm: &Vm) -> Result<(), Errno> {
    let _guard = vm.lock.lock();
    if !vm.is_paused() || vm.is_shutting_down() {
        return Err(Errno::EINVAL);
    }
    for vcpu in vm.vcpus() {
        vcpu.resume();
        hv.kick_pcpu(vcpu.pcpu_id);
    }
    vm.set_state(VmState::Started);
    Ok(())
}

/// Spin until no vCPU of `vm` is inside the guest or its exit handling.
///
/// Must be called without the lifecycle lock: a remote exit handler may
/// need it to finish.
fn wait_vcpus_stopped(hv: &Hypervisor, vm: &Vm) {
    let me = hv.current_pcpu();
    for vcpu in vm.vcpus().filter(|v| v.pcpu_id != me) {
        while vcpu.is_running() {
            hv.kick_vcpu(vcpu);
            hv.platform.cpu_relax();
        }
    }
}

/// Bring a paused VM back to [`VmState::Created`] with every vCPU in its
/// power-on state.
pub fn reset_vm(hv: &Hypervisor, vm: &Vm) -> Result<(), Errno> {
    let resettable = || vm.is_paused() && !vm.is_shutting_down();
    if !resettable() {
        return Err(Errno::EINVAL);
    }
    wait_vcpus_stopped(hv, vm);

    let _guard = vm.lock.lock();
    if !resettable() {
        return Err(Errno::EINVAL);
    }
    let ops = apicv_ops(vm.config);
    for vcpu in vm.vcpus() {
        vcpu.clear_requests();
        let _ = vcpu.take_sipi();
        {
            let mut arch = vcpu.arch();
            vm.init_arch(vcpu, &mut arch);
        }
        vcpu.vlapic.reset(ops);
        vcpu.set_state(VCpuState::Init);
        vcpu.make_request(VCpuRequest::INIT_VMCS);
    }
    vm.devices.reset();
    vm.set_state(VmState::Created);
    log::info!("vm{} reset", vm.vm_id);
    Ok(())
}

/// Release everything `vm` owns.
///
/// A started VM is paused first. Every vCPU turns [`VCpuState::Zombie`]
/// until its pCPU has left it, then its pCPU is unbound, its passthrough
/// interrupts released and its EPT torn down; the slot is returned to the
/// hypervisor.
pub fn shutdown_vm(hv: &Hypervisor, vm: &Vm) -> Result<(), Errno> {
    {
        let _guard = vm.lock.lock();
        if vm.is_poweroff() || vm.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(Errno::EINVAL);
        }
        if vm.is_started() {
            vm.set_state(VmState::Paused);
        }
        pause_vcpus(hv, vm);
        for vcpu in vm.vcpus() {
            vcpu.set_state(VCpuState::Zombie);
        }
    }
    wait_vcpus_stopped(hv, vm);

    let _guard = vm.lock.lock();
    for vcpu in vm.vcpus() {
        vcpu.set_state(VCpuState::Offline);
        vcpu.clear_requests();
        if let Some(percpu) = hv.percpu(vcpu.pcpu_id) {
            percpu.unassign(vm.vm_id);
        }
    }
    ptdev_release_all_entries(hv, vm);
    vm.ept.write().destroy();
    vm.set_state(VmState::PoweredOff);
    hv.remove_vm(vm.vm_id);
    log::info!("vm{} powered off", vm.vm_id);
    Ok(())
}

/// Ask `pcpu_id` to shut down `vm` from its idle path.
fn request_shutdown_on(hv: &Hypervisor, vm: &Vm, pcpu_id: usize) {
    pause_vm(hv, vm);
    if let Some(percpu) = hv.percpu(pcpu_id) {
        percpu.set_shutdown_vm_id(vm.vm_id);
        percpu.request(PcpuFlags::NEED_SHUTDOWN_VM);
        hv.kick_pcpu(pcpu_id);
    }
}

/// Orderly shutdown requested by the guest or a privileged VM.
pub fn request_shutdown(hv: &Hypervisor, vm: &Vm) {
    if let Some(bsp) = vm.bsp() {
        request_shutdown_on(hv, vm, bsp.pcpu_id);
    }
}

/// Stop `vm` after an unrecoverable error on `vcpu`.
///
/// The VM is paused immediately; the pCPU of `vcpu` performs the shutdown
/// once it is back in its idle path.
pub fn fatal_error_shutdown_vm(hv: &Hypervisor, vm: &Vm, vcpu: &VCpu) {
    log::error!(
        "fatal_error_shutdown_vm: vm{} vcpu{} on pcpu{}",
        vm.vm_id,
        vcpu.vcpu_id,
        vcpu.pcpu_id
    );
    request_shutdown_on(hv, vm, vcpu.pcpu_id);
}

/// Shut down the VM recorded for `pcpu_id`, if any.
pub fn shutdown_vm_from_idle(hv: &Hypervisor, pcpu_id: usize) {
    let Some(percpu) = hv.percpu(pcpu_id) else {
        return;
    };
    let vm_id = percpu.take_shutdown_vm_id();
    if vm_id == INVALID_VMID {
        return;
    }
    match hv.vm(vm_id) {
        Some(vm) if !vm.is_poweroff() => {
            if let Err(e) = shutdown_vm(hv, &vm) {
                log::warn!("shutdown_vm_from_idle: vm{}: {:?}", vm_id, e);
            }
        }
        _ => log::debug!("shutdown_vm_from_idle: vm{} is gone", vm_id),
    }
}

/// Platform reset requested by the guest: pause now, restart from the idle
/// path of the BSP pCPU.
pub fn request_reset(hv: &Hypervisor, vm: &Vm) {
    pause_vm(hv, vm);
    vm.reset_pending.store(true, Ordering::Release);
    if let Some(bsp) = vm.bsp() {
        if let Some(percpu) = hv.percpu(bsp.pcpu_id) {
            percpu.request(PcpuFlags::NEED_RESCHEDULE);
            hv.kick_pcpu(bsp.pcpu_id);
        }
    }
}

/// Complete a pending [`request_reset`] of `vm`.
pub fn reset_from_idle(hv: &Hypervisor, vm: &Arc<Vm>) {
    if !vm.take_reset_pending() {
        return;
    }
    let restarted = reset_vm(hv, vm).and_then(|_| start_vm(hv, vm));
    if let Err(e) = restarted {
        log::error!("reset_from_idle: vm{} failed to restart: {:?}", vm.vm_id, e);
        request_shutdown(hv, vm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Harness;

    #[test]
    fn gpa_is_52_bits() {
        assert!(Gpa::new((1 << 52) - 1).is_some());
        assert!(Gpa::new(1 << 52).is_none());
        assert_eq!(format!("{:?}", Gpa::new(0x1234).unwrap()), "gpa:0x1234");
    }

    #[test]
    fn created_vm_layout() {
        let h = Harness::new();
        let vm = h.vm(0);
        assert!(vm.is_created());
        assert_eq!(vm.vcpu_num(), 2);
        assert_eq!(vm.vcpu_mask(), 0b11);
        assert_eq!(vm.vcpu(1).unwrap().pcpu_id, 1);
        assert!(vm.vcpu(2).is_none());
        assert_eq!(vm.e820[2].length, 511 << 20);
        assert_eq!(crate::ept::gpa2hpa(&vm, 0x1000), 0x1_0000_1000);
        assert_eq!(
            create_vm(&h.hv, vm.config).map(|_| ()),
            Err(VmError::Errno(Errno::EBUSY))
        );
    }

    #[test]
    fn lifecycle_transitions() {
        let h = Harness::new();
        let vm = h.vm(1);
        assert_eq!(resume_vm(&h.hv, &vm), Err(Errno::EINVAL));
        start_vm(&h.hv, &vm).unwrap();
        assert!(vm.is_started());
        assert_eq!(vm.bsp().unwrap().state(), VCpuState::Running);
        assert_eq!(vm.vcpu(1).unwrap().state(), VCpuState::Init);
        assert_eq!(start_vm(&h.hv, &vm), Err(Errno::EINVAL));
        let pcpu = h.hv.percpu(2).unwrap().current().unwrap();
        assert_eq!((pcpu.vm.vm_id, pcpu.vcpu_id), (1, 0));

        pause_vm(&h.hv, &vm);
        assert!(vm.is_paused());
        assert!(vm.vcpus().all(|v| v.state() == VCpuState::Paused));
        resume_vm(&h.hv, &vm).unwrap();
        assert_eq!(vm.bsp().unwrap().state(), VCpuState::Running);
        assert_eq!(vm.vcpu(1).unwrap().state(), VCpuState::Init);

        assert_eq!(reset_vm(&h.hv, &vm), Err(Errno::EINVAL));
        pause_vm(&h.hv, &vm);
        reset_vm(&h.hv, &vm).unwrap();
        assert!(vm.is_created());
        assert!(vm.vcpus().all(|v| v.has_request(VCpuRequest::INIT_VMCS)));
        start_vm(&h.hv, &vm).unwrap();
        assert!(vm.is_started());
    }

    #[test]
    fn shutdown_returns_the_slot() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        shutdown_vm(&h.hv, &vm).unwrap();
        assert!(vm.is_poweroff());
        assert!(h.hv.vm(1).is_none());
        assert!(h.hv.percpu(2).unwrap().current().is_none());
        assert!(vm.vcpus().all(|v| v.state() == VCpuState::Offline));
        assert_eq!(vm.ept.read().table_count(), 1);
        assert_eq!(shutdown_vm(&h.hv, &vm), Err(Errno::EINVAL));
        // The slot can be filled again.
        assert!(create_vm(&h.hv, vm.config).is_ok());
    }

    #[test]
    fn shutdown_lets_a_pausing_handler_finish() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let ap = vm.vcpu(1).unwrap();
        // The AP is inside an exit handler on pcpu3.
        ap.set_running(true);

        std::thread::scope(|s| {
            let shutdown = s.spawn(|| shutdown_vm(&h.hv, &vm));
            while ap.state() != VCpuState::Zombie {
                std::hint::spin_loop();
            }
            assert!(vm.is_shutting_down());
            // The handler pauses its own VM, then leaves.
            pause_vm(&h.hv, &vm);
            request_shutdown(&h.hv, &vm);
            ap.set_running(false);
            assert_eq!(shutdown.join().unwrap(), Ok(()));
        });
        assert!(vm.is_poweroff());
        assert!(vm.vcpus().all(|v| v.state() == VCpuState::Offline));
        // The deferred request finds nothing left to do.
        shutdown_vm_from_idle(&h.hv, 2);
        assert!(h.hv.vm(1).is_none());
    }

    #[test]
    fn created_vm_is_shut_down_without_pausing() {
        let h = Harness::new();
        let vm = h.vm(1);
        pause_vm(&h.hv, &vm);
        assert!(vm.is_created());
        assert!(vm.vcpus().all(|v| v.state() == VCpuState::Init));
        shutdown_vm(&h.hv, &vm).unwrap();
        assert!(vm.is_poweroff());
        assert_eq!(resume_vm(&h.hv, &vm), Err(Errno::EINVAL));
    }

    #[test]
    fn idle_shutdown_ignores_invalid_target() {
        let h = Harness::new();
        shutdown_vm_from_idle(&h.hv, 2);
        assert!(h.hv.vm(1).is_some());
        shutdown_vm_from_idle(&h.hv, 17);
    }

    #[test]
    fn fatal_error_defers_to_idle() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let vcpu = vm.bsp().unwrap();
        fatal_error_shutdown_vm(&h.hv, &vm, vcpu);
        assert!(vm.is_paused());
        let percpu = h.hv.percpu(2).unwrap();
        assert!(percpu.pending().contains(PcpuFlags::NEED_SHUTDOWN_VM));
        assert_eq!(percpu.shutdown_vm_id(), 1);
        shutdown_vm_from_idle(&h.hv, 2);
        assert!(vm.is_poweroff());
        // Other VMs are untouched.
        assert!(h.vm(0).is_created());
    }

    #[test]
    fn reset_request_restarts_the_vm() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        vm.set_boot_regs(BootRegs {
            entry: 0x20_0000,
            rsi: 0x8000,
        });
        request_reset(&h.hv, &vm);
        assert!(vm.is_paused());
        reset_from_idle(&h.hv, &vm);
        assert!(vm.is_started());
        let mut arch = vm.bsp().unwrap().arch();
        assert_eq!(arch.startup, StartupState::Protected32 { entry: 0x20_0000 });
        assert_eq!(arch.context().gprs.rsi, 0x8000);
    }
}
