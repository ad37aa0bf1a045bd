//! Static configuration of the partitioned machine.
//!
//! Every VM is pre-launched: its vCPUs, memory window, kernel and devices are
//! fixed here at build time. [`sanitize_vm_configs`] checks the table against
//! the machine at boot before anything runs.

use abyss::boot::e820::HostE820;

/// Identifier of a VM, an index into [`VM_CONFIGS`].
pub type VmId = u16;

/// Marker for "no VM".
pub const INVALID_VMID: VmId = 0xffff;
/// Number of VM slots.
pub const MAX_VM: usize = 2;
/// Number of physical CPUs supported.
pub const MAX_PCPU: usize = abyss::MAX_CPU;
/// Number of vCPUs a single VM can have.
pub const MAX_VCPUS_PER_VM: usize = 4;
/// Size of the passthrough interrupt pool.
pub const MAX_PT_IRQ_ENTRIES: usize = 64;
/// The pCPU that polls the physical console.
pub const CONSOLE_PCPU_ID: usize = 3;
/// Console polling period in milliseconds.
pub const CONSOLE_TIMER_PERIOD_MS: u64 = 40;

/// Board ports.
pub mod board {
    /// PM1A event block (status + enable).
    pub const PM1A_EVT_PORT: u16 = 0x1800;
    /// PM1A control block.
    pub const PM1A_CNT_PORT: u16 = 0x1804;
    /// PM1B event block.
    pub const PM1B_EVT_PORT: u16 = 0x1820;
    /// PM1B control block.
    pub const PM1B_CNT_PORT: u16 = 0x1824;
    /// PM1 control block exposed to pre-launched VMs.
    pub const VIRTUAL_PM1A_CNT_PORT: u16 = 0x404;
    /// System control port A; bit 0 requests a fast reset.
    pub const RESET_REG_PORT: u16 = 0x92;
    /// Value that triggers the reset through [`RESET_REG_PORT`].
    pub const RESET_REG_VALUE: u8 = 0x1;
    /// S5 sleep type the virtual PM1 control block reports.
    pub const S5_SLP_TYP: u8 = 5;
}

/// Kind of guest kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    /// Linux bzImage, started through the 32-bit boot protocol.
    BzImage,
    /// Zephyr raw binary.
    Zephyr,
}

/// How to boot the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsConfig {
    pub kind: OsKind,
    /// Tag of the boot module holding the kernel.
    pub kernel_mod_tag: &'static str,
    pub bootargs: &'static str,
    /// Guest physical address the kernel is loaded to.
    pub load_addr: u64,
    /// Guest physical address of the first instruction.
    pub entry_addr: u64,
}

/// Host physical memory window of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub start_hpa: u64,
    pub size: u64,
}

impl MemoryConfig {
    /// End of the window, exclusive.
    #[inline]
    pub const fn end_hpa(&self) -> u64 {
        self.start_hpa + self.size
    }
}

/// Virtual UART of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuartConfig {
    None,
    /// A 16550 at a legacy port.
    Legacy { port: u16, irq: u8 },
}

/// PCI bus/device/function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bdf(pub u16);

impl Bdf {
    /// Compose a BDF.
    pub const fn new(bus: u8, dev: u8, func: u8) -> Self {
        Self(((bus as u16) << 8) | (((dev & 0x1f) as u16) << 3) | (func & 0x7) as u16)
    }

    #[inline]
    pub const fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub const fn dev(self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    #[inline]
    pub const fn func(self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

impl core::fmt::Debug for Bdf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus(), self.dev(), self.func())
    }
}

/// How a PCI function is presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciEmuType {
    /// Emulated by the hypervisor.
    HvEmul,
    /// Physical function passed through.
    PtDev,
}

/// One PCI function of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDevConfig {
    pub emu_type: PciEmuType,
    pub vbdf: Bdf,
    /// Physical function; ignored for emulated functions.
    pub pbdf: Bdf,
    /// Guest physical BAR bases.
    pub vbar_base: [u64; 6],
}

bitflags::bitflags! {
    /// Per-VM policy flags.
    pub struct GuestFlags: u32 {
        /// The guest drives the physical local APIC.
        const LAPIC_PASSTHROUGH = 1 << 0;
        /// The VM may act on other VMs.
        const HIGHEST_SEVERITY = 1 << 1;
    }
}

/// Static configuration of one VM.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub vm_id: VmId,
    pub name: &'static str,
    pub uuid: [u8; 16],
    /// pCPUs of the VM; vCPU `i` runs on the `i`-th set bit.
    pub cpu_affinity: u64,
    pub memory: MemoryConfig,
    pub os: OsConfig,
    pub vuart: [VuartConfig; 2],
    pub pci_devs: &'static [PciDevConfig],
    pub guest_flags: GuestFlags,
}

impl VmConfig {
    /// Number of vCPUs.
    #[inline]
    pub fn vcpu_num(&self) -> usize {
        self.cpu_affinity.count_ones() as usize
    }

    /// pCPU of vCPU `vcpu_id`.
    pub fn pcpu_of(&self, vcpu_id: usize) -> Option<usize> {
        (0..64)
            .filter(|i| self.cpu_affinity & (1 << i) != 0)
            .nth(vcpu_id)
    }

    /// The pCPU that runs the BSP and creates the VM.
    pub fn bsp_pcpu(&self) -> Option<usize> {
        self.pcpu_of(0)
    }

    /// Find the passthrough function at `vbdf`.
    pub fn ptdev(&self, vbdf: Bdf) -> Option<&'static PciDevConfig> {
        self.pci_devs
            .iter()
            .find(|d| d.emu_type == PciEmuType::PtDev && d.vbdf == vbdf)
    }
}

const MEM_1M: u64 = 0x10_0000;

static VM0_PCI_DEVS: [PciDevConfig; 2] = [
    PciDevConfig {
        emu_type: PciEmuType::HvEmul,
        vbdf: Bdf::new(0, 0, 0),
        pbdf: Bdf::new(0, 0, 0),
        vbar_base: [0; 6],
    },
    PciDevConfig {
        emu_type: PciEmuType::PtDev,
        vbdf: Bdf::new(0, 1, 0),
        pbdf: Bdf::new(3, 0, 0),
        vbar_base: [0xc000_0000, 0, 0, 0, 0, 0],
    },
];

static VM1_PCI_DEVS: [PciDevConfig; 1] = [PciDevConfig {
    emu_type: PciEmuType::HvEmul,
    vbdf: Bdf::new(0, 0, 0),
    pbdf: Bdf::new(0, 0, 0),
    vbar_base: [0; 6],
}];

/// The VM table.
pub static VM_CONFIGS: [VmConfig; MAX_VM] = [
    VmConfig {
        vm_id: 0,
        name: "PRE_LAUNCHED_VM0",
        uuid: *b"parvisor-vm0\0\0\0\0",
        cpu_affinity: 0b0011,
        memory: MemoryConfig {
            start_hpa: 0x1_0000_0000,
            size: 512 * MEM_1M,
        },
        os: OsConfig {
            kind: OsKind::BzImage,
            kernel_mod_tag: "Linux_bzImage",
            bootargs: "console=ttyS0 root=/dev/ram0 rw rdinit=/bin/sh",
            load_addr: 0x100_0000,
            entry_addr: 0x100_0000,
        },
        vuart: [
            VuartConfig::Legacy { port: 0x3f8, irq: 4 },
            VuartConfig::None,
        ],
        pci_devs: &VM0_PCI_DEVS,
        guest_flags: GuestFlags::HIGHEST_SEVERITY,
    },
    VmConfig {
        vm_id: 1,
        name: "PRE_LAUNCHED_VM1",
        uuid: *b"parvisor-vm1\0\0\0\0",
        cpu_affinity: 0b1100,
        memory: MemoryConfig {
            start_hpa: 0x1_2000_0000,
            size: 256 * MEM_1M,
        },
        os: OsConfig {
            kind: OsKind::Zephyr,
            kernel_mod_tag: "Zephyr_RawImage",
            bootargs: "",
            load_addr: 0x10_0000,
            entry_addr: 0x10_0000,
        },
        vuart: [
            VuartConfig::Legacy { port: 0x3f8, irq: 4 },
            VuartConfig::None,
        ],
        pci_devs: &VM1_PCI_DEVS,
        guest_flags: GuestFlags::empty(),
    },
];

/// Config of `vm_id`.
#[inline]
pub fn get_vm_config(vm_id: VmId) -> Option<&'static VmConfig> {
    VM_CONFIGS.get(vm_id as usize)
}

/// A violation of the static configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The entry at `index` does not carry `vm_id == index`.
    VmIdMismatch { index: usize },
    /// The VM has no pCPU.
    EmptyAffinity(VmId),
    /// The VM is pinned to a pCPU that is not present.
    AffinityOutOfRange(VmId),
    /// Two VMs share a pCPU.
    AffinityOverlap(VmId, VmId),
    /// The VM has more vCPUs than supported.
    TooManyVcpus(VmId),
    /// The memory window is smaller than 1 MiB or not page aligned.
    BadMemoryWindow(VmId),
    /// Two memory windows overlap.
    MemoryOverlap(VmId, VmId),
    /// The memory window is not backed by host RAM.
    MemoryNotRam(VmId),
}

/// Check the VM table against the machine.
///
/// `present_pcpus` is the bitmap of pCPUs the boot code found.
pub fn sanitize_vm_configs(
    configs: &[VmConfig],
    e820: &HostE820,
    present_pcpus: u64,
) -> Result<(), ConfigError> {
    for (index, cfg) in configs.iter().enumerate() {
        let id = cfg.vm_id;
        if id as usize != index {
            return Err(ConfigError::VmIdMismatch { index });
        }
        if cfg.cpu_affinity == 0 {
            return Err(ConfigError::EmptyAffinity(id));
        }
        if cfg.cpu_affinity & !present_pcpus != 0 {
            return Err(ConfigError::AffinityOutOfRange(id));
        }
        if cfg.vcpu_num() > MAX_VCPUS_PER_VM {
            return Err(ConfigError::TooManyVcpus(id));
        }
        let mem = cfg.memory;
        if mem.size < MEM_1M || mem.start_hpa & 0xfff != 0 || mem.size & 0xfff != 0 {
            return Err(ConfigError::BadMemoryWindow(id));
        }
        if !e820.is_ram(mem.start_hpa, mem.size) {
            return Err(ConfigError::MemoryNotRam(id));
        }
        for other in &configs[..index] {
            if other.cpu_affinity & cfg.cpu_affinity != 0 {
                return Err(ConfigError::AffinityOverlap(other.vm_id, id));
            }
            if other.memory.start_hpa < mem.end_hpa() && mem.start_hpa < other.memory.end_hpa() {
                return Err(ConfigError::MemoryOverlap(other.vm_id, id));
            }
        }
    }
    Ok(())
}

/// Options from the hypervisor command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HvOptions {
    pub log_level: log::LevelFilter,
    /// VM owning the console at boot, or [`INVALID_VMID`] for the shell.
    pub console_vm: VmId,
}

impl Default for HvOptions {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            console_vm: 0,
        }
    }
}

impl HvOptions {
    /// Parse whitespace separated `key=value` tokens. Unknown keys and
    /// malformed values are ignored.
    pub fn parse(cmdline: &str) -> Self {
        let mut opts = Self::default();
        for (key, value) in cmdline
            .split_ascii_whitespace()
            .filter_map(|tok| tok.split_once('='))
        {
            match key {
                "loglevel" => {
                    opts.log_level = match value {
                        "0" => log::LevelFilter::Off,
                        "1" => log::LevelFilter::Error,
                        "2" => log::LevelFilter::Warn,
                        "3" => log::LevelFilter::Info,
                        "4" => log::LevelFilter::Debug,
                        "5" => log::LevelFilter::Trace,
                        _ => opts.log_level,
                    }
                }
                "console_vm" => {
                    opts.console_vm = match value {
                        "none" => INVALID_VMID,
                        v => v
                            .parse::<VmId>()
                            .ok()
                            .filter(|&id| (id as usize) < MAX_VM)
                            .unwrap_or(opts.console_vm),
                    }
                }
                _ => (),
            }
        }
        opts
    }
}
