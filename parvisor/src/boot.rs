//! Boot sequencing.
//!
//! The primary pCPU builds the [`Hypervisor`] out of the loader information,
//! enters VMX operation and wakes the APs through the trampoline. Every pCPU
//! then launches the VMs it is the BSP of and stays in its run loop.

use crate::{
    config::{sanitize_vm_configs, ConfigError, HvOptions, MAX_PCPU, VM_CONFIGS},
    hv::Hypervisor,
    sched::schedule,
    vm::{prepare_vm, start_vm},
    vmx::{start_vmx_on_cpu, vmcs::Vmcs, Vmx},
    Errno, VmError, VmxError,
};
use abyss::{
    addressing::{Pa, MEM_1M, PAGE_SIZE},
    boot::{e820::HostE820, BootInfo},
    dev::{x86_64::apic, ConsoleUart, DeviceError},
    kprint,
    platform::{IoWidth, Platform},
    timebase::CalibrationError,
};
use alloc::{boxed::Box, sync::Arc};

const CMOS_INDEX: u16 = 0x70;
const CMOS_DATA: u16 = 0x71;
/// CMOS shutdown status byte.
const CMOS_SHUTDOWN_STATUS: u8 = 0xf;
/// Resume through the warm reset vector.
const CMOS_WARM_RESET: u8 = 0xa;
/// Real-mode `offset:segment` the BIOS jumps through on a warm reset.
const WARM_RESET_VECTOR: usize = 0x467;

const INIT_DELAY_US: u64 = 10_000;
const STARTUP_DELAY_US: u64 = 200;
/// How long the APs get to check in.
const AP_STARTUP_TIMEOUT_US: u64 = 100_000;

/// Possible errorkind for booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// The TSC frequency could not be measured.
    Calibration,
    /// No free page below 1 MiB for the AP trampoline.
    NoTrampoline,
    /// The local APIC is unusable.
    Apic(DeviceError),
    /// The VM table does not fit the machine.
    Config(ConfigError),
    /// VMX operation could not be entered.
    Vmx(VmxError),
    /// A VM could not be launched.
    Vm(VmError),
    Errno(Errno),
}

impl From<CalibrationError> for BootError {
    fn from(_: CalibrationError) -> Self {
        Self::Calibration
    }
}

impl From<DeviceError> for BootError {
    fn from(e: DeviceError) -> Self {
        Self::Apic(e)
    }
}

impl From<ConfigError> for BootError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<VmxError> for BootError {
    fn from(e: VmxError) -> Self {
        Self::Vmx(e)
    }
}

impl From<VmError> for BootError {
    fn from(e: VmError) -> Self {
        Self::Vm(e)
    }
}

impl From<Errno> for BootError {
    fn from(e: Errno) -> Self {
        Self::Errno(e)
    }
}

/// The machine as handed to [`init_primary_pcpu`].
pub struct HostHw {
    pub platform: Arc<dyn Platform>,
    pub vmx: Arc<dyn Vmx>,
    pub uart: Option<Arc<dyn ConsoleUart>>,
    /// Real-mode code the APs start in. At most one page.
    pub trampoline: &'static [u8],
}

/// Bitmap of the pCPUs in the package, as CPUID leaf 1 counts them.
pub fn present_pcpus(p: &dyn Platform) -> u64 {
    let n = ((p.cpuid(1, 0).ebx >> 16) & 0xff).clamp(1, MAX_PCPU as u32);
    (1 << n) - 1
}

/// Bring up the hypervisor on the boot processor.
///
/// Builds the host E820 from the loader memory map and reserves the
/// trampoline page below 1 MiB, checks the VM table against the machine,
/// calibrates the TSC and enters VMX operation. The pCPU areas, the host
/// vector table and the ptirq pool come up with the [`Hypervisor`].
pub fn init_primary_pcpu(hw: HostHw, boot: &BootInfo) -> Result<Arc<Hypervisor>, BootError> {
    let options = HvOptions::parse(&boot.cmdline);
    kprint::init_logger(options.log_level);
    let p = &*hw.platform;

    let mut e820 = HostE820::new(boot.memory_map.iter().copied());
    if hw.trampoline.len() > PAGE_SIZE {
        return Err(Errno::EINVAL.into());
    }
    let trampoline = e820
        .alloc_below(PAGE_SIZE as u64, PAGE_SIZE as u64, MEM_1M as u64)
        .ok_or(BootError::NoTrampoline)?;
    // SAFETY: the page was just taken out of host RAM.
    unsafe { p.phys_write(trampoline, hw.trampoline) };
    log::info!(
        "{} MiB of host RAM, AP trampoline at {:#x}",
        e820.total_ram() >> 20,
        trampoline.into_usize()
    );

    let present = present_pcpus(p);
    sanitize_vm_configs(&VM_CONFIGS, &e820, present).map_err(|e| {
        log::error!("init_primary_pcpu: bad VM table: {:?}", e);
        e
    })?;
    apic::init(p)?;

    let mut hv = Hypervisor::new(hw.platform.clone(), hw.vmx, hw.uart, options, e820);
    hv.trampoline = Some(trampoline);
    hv.timebase.calibrate_tsc(p)?;
    enter_vmx(&hv, 0)?;
    log::info!("pcpu0 up, {} pCPU(s) present", present.count_ones());
    Ok(Arc::new(hv))
}

fn enter_vmx(hv: &Hypervisor, pcpu_id: usize) -> Result<(), BootError> {
    let percpu = hv.percpu(pcpu_id).ok_or(Errno::EINVAL)?;
    let region = Box::new(Vmcs::new(hv.vmcs_revision()));
    start_vmx_on_cpu(&*hv.platform, &*hv.vmx, &region).map_err(|e| {
        log::error!("pcpu{}: cannot enter VMX operation: {:?}", pcpu_id, e);
        e
    })?;
    percpu.set_vmxon_region(region);
    percpu.set_online(true);
    Ok(())
}

/// AP side of the bring-up, called from the trampoline.
pub fn init_secondary_pcpu(hv: &Hypervisor, pcpu_id: usize) -> Result<(), BootError> {
    apic::init(&*hv.platform)?;
    enter_vmx(hv, pcpu_id)?;
    log::info!("pcpu{} up", pcpu_id);
    Ok(())
}

/// Wake the pCPUs in `mask` with INIT, STARTUP, STARTUP and wait for them to
/// go online.
pub fn start_pcpus(hv: &Hypervisor, mask: u64) -> Result<(), Errno> {
    let p = &*hv.platform;
    let entry = hv.trampoline.ok_or(Errno::ENODEV)?.into_usize();
    let targets = mask & !(1 << hv.current_pcpu()) & ((1 << MAX_PCPU) - 1);
    if targets == 0 {
        return Ok(());
    }

    {
        let _guard = hv.cmos_lock.lock();
        p.pio_write(CMOS_INDEX, IoWidth::Byte, CMOS_SHUTDOWN_STATUS as u32);
        p.pio_write(CMOS_DATA, IoWidth::Byte, CMOS_WARM_RESET as u32);
    }
    let mut vector = [0u8; 4];
    vector[..2].copy_from_slice(&((entry & 0xf) as u16).to_le_bytes());
    vector[2..].copy_from_slice(&((entry >> 4) as u16).to_le_bytes());
    if let Some(pa) = Pa::new(WARM_RESET_VECTOR) {
        // SAFETY: the BIOS data area is reserved for this.
        unsafe { p.phys_write(pa, &vector) };
    }

    let ids = || (0..MAX_PCPU).filter(move |i| targets & (1 << i) != 0);
    for id in ids() {
        apic::send_init(p, id as u32);
    }
    hv.timebase.udelay(p, INIT_DELAY_US);
    for _ in 0..2 {
        for id in ids() {
            apic::send_startup(p, id as u32, entry);
        }
        hv.timebase.udelay(p, STARTUP_DELAY_US);
    }

    let start = p.rdtsc();
    while hv.online_mask() & targets != targets {
        if hv.timebase.elapsed_us(p, start) > AP_STARTUP_TIMEOUT_US {
            log::error!(
                "start_pcpus: pcpu mask {:#x} did not check in",
                targets & !hv.online_mask()
            );
            return Err(Errno::ETIMEDOUT);
        }
        p.cpu_relax();
    }
    Ok(())
}

/// Create, load and start every VM whose BSP runs on `pcpu_id`.
pub fn launch_vms(hv: &Hypervisor, pcpu_id: usize, boot: &BootInfo) -> Result<(), VmError> {
    for config in VM_CONFIGS.iter().filter(|c| c.bsp_pcpu() == Some(pcpu_id)) {
        let vm = prepare_vm(hv, config.vm_id, boot)?;
        start_vm(hv, &vm)?;
    }
    Ok(())
}

/// Launch the VMs of `pcpu_id` and run it until it goes offline.
pub fn pcpu_main(hv: &Hypervisor, pcpu_id: usize, boot: &BootInfo) {
    if let Err(e) = launch_vms(hv, pcpu_id, boot) {
        log::error!("pcpu_main: pcpu{} failed to launch its VMs: {:?}", pcpu_id, e);
    }
    schedule(hv, pcpu_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        percpu::PcpuFlags,
        vmx::mock::{vmx_capable, MockVmx},
    };
    use abyss::{
        boot::{
            e820::{E820Entry, E820Type},
            BootModule,
        },
        dev::x86_64::apic::{ICR_DELIVERY_INIT, ICR_DELIVERY_MASK, ICR_DELIVERY_STARTUP},
        mock::MockPlatform,
        platform::CpuidResult,
        timebase::CPUID_LEAF_FREQUENCY,
    };
    use alloc::{string::ToString, vec, vec::Vec};

    static TRAMPOLINE: [u8; 3] = [0xfa, 0xeb, 0xfe];

    fn machine(pcpus: u32) -> (Arc<MockPlatform>, Arc<MockVmx>) {
        let p = Arc::new(MockPlatform::new());
        vmx_capable(&p);
        p.set_cpuid(0, 0, CpuidResult { eax: CPUID_LEAF_FREQUENCY, ..Default::default() });
        // VMX and x2APIC.
        p.set_cpuid(1, 0, CpuidResult { ebx: pcpus << 16, ecx: 1 << 5 | 1 << 21, ..Default::default() });
        p.set_cpuid(CPUID_LEAF_FREQUENCY, 0, CpuidResult { eax: 2400, ..Default::default() });
        (p, Arc::new(MockVmx::new()))
    }

    fn memory_map(high: u64) -> Vec<E820Entry> {
        vec![
            E820Entry::new(0, 0x9f000, E820Type::Ram),
            E820Entry::new(0xf0000, 0x10000, E820Type::Reserved),
            E820Entry::new(0x10_0000, 0x3ff0_0000, E820Type::Ram),
            E820Entry::new(0x1_0000_0000, high, E820Type::Ram),
        ]
    }

    fn boot_info(high: u64, cmdline: &str) -> BootInfo {
        BootInfo {
            memory_map: memory_map(high),
            modules: Vec::new(),
            cmdline: cmdline.to_string(),
        }
    }

    fn hw(p: &Arc<MockPlatform>, vmx: &Arc<MockVmx>) -> HostHw {
        HostHw {
            platform: p.clone(),
            vmx: vmx.clone(),
            uart: Some(p.clone()),
            trampoline: &TRAMPOLINE,
        }
    }

    fn boot(pcpus: u32) -> (Arc<Hypervisor>, Arc<MockPlatform>, Arc<MockVmx>) {
        let (p, vmx) = machine(pcpus);
        let hv = init_primary_pcpu(hw(&p, &vmx), &boot_info(0x3000_0000, "console_vm=1")).unwrap();
        (hv, p, vmx)
    }

    #[test]
    fn primary_pcpu_comes_up() {
        let (hv, p, vmx) = boot(4);
        let tramp = hv.trampoline.unwrap();
        assert_eq!(tramp.into_usize(), 0x9e000);
        assert!(!hv.host_e820.is_ram(0x9e000, 0x1000));
        let mut code = [0u8; 3];
        unsafe { p.phys_read(tramp, &mut code) };
        assert_eq!(code, TRAMPOLINE);

        assert_eq!(hv.timebase.tsc_khz(), 2_400_000);
        assert_eq!(hv.options.console_vm, 1);
        assert_eq!(hv.online_mask(), 0b1);
        assert!(hv.percpu(0).unwrap().has_vmxon_region());
        assert_eq!(vmx.vmxon_regions().len(), 1);
        assert!(hv.vms().is_empty());
    }

    #[test]
    fn machine_must_fit_the_vm_table() {
        let (p, vmx) = machine(4);
        assert_eq!(
            init_primary_pcpu(hw(&p, &vmx), &boot_info(0x2000_0000, "")).err(),
            Some(BootError::Config(ConfigError::MemoryNotRam(1)))
        );
        let (p, vmx) = machine(2);
        assert_eq!(
            init_primary_pcpu(hw(&p, &vmx), &boot_info(0x3000_0000, "")).err(),
            Some(BootError::Config(ConfigError::AffinityOutOfRange(1)))
        );
        let (p, vmx) = machine(4);
        let mut info = boot_info(0x3000_0000, "");
        info.memory_map.remove(0);
        assert_eq!(init_primary_pcpu(hw(&p, &vmx), &info).err(), Some(BootError::NoTrampoline));
        assert!(!vmx.is_on());
    }

    #[test]
    fn aps_check_in() {
        let (hv, p, vmx) = boot(4);
        let weak = Arc::downgrade(&hv);
        p.set_icr_hook(Arc::new(move |dest, icr| {
            let Some(hv) = weak.upgrade() else {
                return;
            };
            let online = hv.percpu(dest as usize).map_or(true, |c| c.is_online());
            if icr & ICR_DELIVERY_MASK == ICR_DELIVERY_STARTUP && !online {
                init_secondary_pcpu(&hv, dest as usize).unwrap();
            }
        }));

        start_pcpus(&hv, 0b1111).unwrap();
        assert_eq!(hv.online_mask(), 0b1111);
        assert_eq!(vmx.vmxon_regions().len(), 4);

        let icrs = p.icr_log();
        let kinds = |k| icrs.iter().filter(|(_, icr)| icr & ICR_DELIVERY_MASK == k).count();
        assert_eq!(kinds(ICR_DELIVERY_INIT), 3);
        assert_eq!(kinds(ICR_DELIVERY_STARTUP), 6);
        assert!(icrs.iter().all(|&(dest, _)| dest != 0));
        // The STARTUP vector is the trampoline page.
        assert_eq!(icrs[3].1 & 0xff, 0x9e);

        let writes = p.pio_writes();
        assert!(writes.contains(&(CMOS_INDEX, IoWidth::Byte, 0xf)));
        assert!(writes.contains(&(CMOS_DATA, IoWidth::Byte, 0xa)));
        let mut vector = [0u8; 4];
        unsafe { p.phys_read(Pa::new(WARM_RESET_VECTOR).unwrap(), &mut vector) };
        assert_eq!(vector, [0, 0, 0x00, 0x9e]);
    }

    #[test]
    fn silent_aps_time_out() {
        let (hv, p, _vmx) = boot(4);
        // About 400 us per TSC read.
        p.set_tsc_step(1_000_000);
        assert_eq!(start_pcpus(&hv, 0b0010), Err(Errno::ETIMEDOUT));
        assert_eq!(hv.online_mask(), 0b1);
        assert_eq!(start_pcpus(&hv, 0b0001), Ok(()));
    }

    #[test]
    fn each_pcpu_launches_its_own_vms() {
        let (hv, p, _vmx) = boot(4);
        let start = Pa::new(0x4100_0000).unwrap();
        unsafe { p.phys_write(start, &[0x90; 64]) };
        let mut info = boot_info(0x3000_0000, "");
        info.modules.push(BootModule {
            start,
            size: 64,
            tag: "Zephyr_RawImage".to_string(),
        });

        launch_vms(&hv, 1, &info).unwrap();
        assert!(hv.vms().is_empty());
        launch_vms(&hv, 2, &info).unwrap();
        let vm1 = hv.vm(1).unwrap();
        assert!(vm1.is_started());
        assert_eq!(hv.percpu(3).unwrap().current().map(|a| a.vcpu_id), Some(1));

        // No bzImage module for VM0.
        assert_eq!(launch_vms(&hv, 0, &info), Err(VmError::Errno(Errno::ENODEV)));
        assert!(hv.vm(0).is_none());
        assert!(hv.percpu(0).unwrap().current().is_none());
    }

    #[test]
    fn pcpu_main_returns_when_offlined() {
        let (hv, _p, _vmx) = boot(4);
        let percpu = hv.percpu(0).unwrap();
        percpu.request(PcpuFlags::NEED_OFFLINE);
        pcpu_main(&hv, 0, &BootInfo::default());
        assert!(!percpu.is_online());
        assert!(hv.vm(0).is_none());
    }
}
