//! Virtual PCI configuration space behind 0xCF8/0xCFC.
//!
//! Each function listed in the VM configuration appears at its virtual BDF.
//! An emulated function is a host bridge whose whole configuration space is
//! synthesized. A passthrough function forwards configuration accesses to
//! the physical function, except for
//! * the BARs, which show the guest bases of the VM configuration and are
//!   mapped into the EPT onto the physical BARs;
//! * the MSI capability, which is remapped through the ptirq table;
//! * the interrupt line, which routes the physical pin to a vPIC line.

use crate::{
    config::{Bdf, PciDevConfig, PciEmuType, VmConfig},
    ept::{ept_add_mr, ept_del_mr, EPT_MMIO},
    hv::Hypervisor,
    io::{PioHandler, PioRange},
    ptirq::{ptirq_intx_pin_remap, ptirq_msix_remap, ptirq_remove_msix_remapping, MsiInfo, MsiMessage},
    vcpu::VCpu,
    vm::Vm,
};
use abyss::platform::IoWidth;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin_lock::SpinLock;

pub const PCI_CONFIG_ADDR: u16 = 0xcf8;
pub const PCI_CONFIG_DATA: u16 = 0xcfc;

pub const PCI_CFG_ADDR_RANGE: PioRange = PioRange::new(PCI_CONFIG_ADDR, 1);
pub const PCI_CFG_DATA_RANGE: PioRange = PioRange::new(PCI_CONFIG_DATA, 4);

const CFG_ENABLE: u32 = 1 << 31;

const PCIR_VENDOR: u8 = 0x00;
const PCIR_STATUS: u8 = 0x06;
const PCIR_CLASS_REV: u8 = 0x08;
const PCIR_BAR0: u8 = 0x10;
const PCIR_CAP_PTR: u8 = 0x34;
const PCIR_INTR_LINE: u8 = 0x3c;
const PCIR_INTR_PIN: u8 = 0x3d;

const PCIM_STATUS_CAPPRESENT: u32 = 1 << 4;
const PCIY_MSI: u8 = 0x05;
const PCIM_MSICTRL_MSI_ENABLE: u16 = 1 << 0;
const PCIM_MSICTRL_64BIT: u16 = 1 << 7;

const BAR_COUNT: usize = 6;
const BAR_IO_SPACE: u32 = 1 << 0;
const BAR_MEM_TYPE_64: u32 = 0b10 << 1;
const BAR_MEM_FLAGS: u32 = 0xf;

const HOSTBRIDGE_VENDOR: u32 = 0x8086;
const HOSTBRIDGE_DEVICE: u32 = 0x5af0;
/// Class 06h (bridge), subclass 00h (host bridge).
const HOSTBRIDGE_CLASS: u32 = 0x0600_0000;

/// Address a configuration dword of `bdf` through CF8.
#[inline]
pub fn make_address(bdf: Bdf, offset: u8) -> u32 {
    CFG_ENABLE | ((bdf.0 as u32) << 8) | (offset as u32 & 0xfc)
}

/// Read `width` bytes at `offset` of the physical function `bdf`.
pub fn pci_pdev_read_cfg(hv: &Hypervisor, bdf: Bdf, offset: u8, width: IoWidth) -> u32 {
    let _guard = hv.pci_cfg_lock.lock();
    hv.platform
        .pio_write(PCI_CONFIG_ADDR, IoWidth::Dword, make_address(bdf, offset));
    hv.platform
        .pio_read(PCI_CONFIG_DATA + (offset & 3) as u16, width)
}

/// Write `width` bytes at `offset` of the physical function `bdf`.
pub fn pci_pdev_write_cfg(hv: &Hypervisor, bdf: Bdf, offset: u8, width: IoWidth, value: u32) {
    let _guard = hv.pci_cfg_lock.lock();
    hv.platform
        .pio_write(PCI_CONFIG_ADDR, IoWidth::Dword, make_address(bdf, offset));
    hv.platform
        .pio_write(PCI_CONFIG_DATA + (offset & 3) as u16, width, value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarKind {
    None,
    Io,
    Mem32,
    Mem64,
    /// Upper half of the preceding 64-bit BAR.
    Mem64Hi,
}

#[derive(Debug, Clone, Copy)]
struct VBar {
    kind: BarKind,
    /// Low flag bits reported to the guest.
    flags: u32,
    size: u64,
    /// Physical base.
    hpa: u64,
    /// Guest base, as written by the guest.
    base: u64,
    /// Guest base currently mapped in the EPT.
    mapped: Option<u64>,
}

impl VBar {
    const fn none() -> Self {
        Self {
            kind: BarKind::None,
            flags: 0,
            size: 0,
            hpa: 0,
            base: 0,
            mapped: None,
        }
    }

    #[inline]
    fn mask(&self) -> u64 {
        !(self.size - 1)
    }
}

#[derive(Debug, Clone, Copy)]
struct MsiCap {
    offset: u8,
    ctrl: u16,
    addr: u64,
    data: u16,
}

impl MsiCap {
    #[inline]
    fn is_64(&self) -> bool {
        self.ctrl & PCIM_MSICTRL_64BIT != 0
    }

    #[inline]
    fn data_offset(&self) -> u8 {
        self.offset + if self.is_64() { 0xc } else { 0x8 }
    }

    #[inline]
    fn end(&self) -> u8 {
        self.data_offset() + 4
    }

    #[inline]
    fn enabled(&self) -> bool {
        self.ctrl & PCIM_MSICTRL_MSI_ENABLE != 0
    }
}

struct PtState {
    bars: [VBar; BAR_COUNT],
    msi: Option<MsiCap>,
    /// Interrupt line programmed by the guest.
    intr_line: u8,
    /// Physical interrupt pin and line.
    phys_pin: u8,
    phys_line: u8,
}

impl PtState {
    const fn new() -> Self {
        Self {
            bars: [VBar::none(); BAR_COUNT],
            msi: None,
            intr_line: 0xff,
            phys_pin: 0,
            phys_line: 0,
        }
    }
}

enum Function {
    HostBridge,
    PtDev(SpinLock<PtState>),
}

/// One function on the virtual bus.
struct PciVdev {
    config: &'static PciDevConfig,
    function: Function,
}

impl PciVdev {
    fn new(config: &'static PciDevConfig) -> Self {
        let function = match config.emu_type {
            PciEmuType::HvEmul => Function::HostBridge,
            PciEmuType::PtDev => Function::PtDev(SpinLock::new(PtState::new())),
        };
        Self { config, function }
    }

    fn read_dword(&self, hv: &Hypervisor, reg: u8) -> u32 {
        match &self.function {
            Function::HostBridge => hostbridge_read(reg),
            Function::PtDev(st) => {
                let st = st.lock();
                ptdev_read(hv, self.config, &st, reg)
            }
        }
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, offset: u8, width: IoWidth, value: u32) {
        match &self.function {
            Function::HostBridge => {
                log::trace!("vm{}: host bridge write {:#x} dropped", vm.vm_id, offset)
            }
            Function::PtDev(st) => {
                let mut st = st.lock();
                ptdev_write(hv, vm, self.config, &mut st, offset, width, value);
            }
        }
    }
}

fn hostbridge_read(reg: u8) -> u32 {
    match reg {
        PCIR_VENDOR => HOSTBRIDGE_DEVICE << 16 | HOSTBRIDGE_VENDOR,
        PCIR_CLASS_REV => HOSTBRIDGE_CLASS,
        _ => 0,
    }
}

/// Whether `reg` is inside the virtualized part of `st`.
fn is_bar_reg(reg: u8) -> bool {
    (PCIR_BAR0..PCIR_BAR0 + 4 * BAR_COUNT as u8).contains(&reg)
}

fn bar_read(bars: &[VBar; BAR_COUNT], idx: usize) -> u32 {
    let bar = &bars[idx];
    match bar.kind {
        BarKind::None | BarKind::Io => 0,
        BarKind::Mem32 | BarKind::Mem64 => (bar.base & bar.mask()) as u32 | bar.flags,
        BarKind::Mem64Hi => {
            let lo = &bars[idx - 1];
            ((lo.base & lo.mask()) >> 32) as u32
        }
    }
}

fn msi_read(cap: &MsiCap, phys: u32, reg: u8) -> u32 {
    match reg - cap.offset {
        // Capability id and next pointer come from the device.
        0 => (phys & 0xffff) | (cap.ctrl as u32) << 16,
        4 => cap.addr as u32,
        8 if cap.is_64() => (cap.addr >> 32) as u32,
        r if r == cap.data_offset() - cap.offset => cap.data as u32,
        _ => phys,
    }
}

fn ptdev_read(hv: &Hypervisor, config: &PciDevConfig, st: &PtState, reg: u8) -> u32 {
    if is_bar_reg(reg) {
        return bar_read(&st.bars, ((reg - PCIR_BAR0) / 4) as usize);
    }
    let phys = pci_pdev_read_cfg(hv, config.pbdf, reg, IoWidth::Dword);
    match st.msi {
        Some(cap) if (cap.offset..cap.end()).contains(&reg) => msi_read(&cap, phys, reg),
        _ if reg == PCIR_INTR_LINE => (phys & !0xff) | st.intr_line as u32,
        _ => phys,
    }
}

/// Merge a `width` write of `value` at byte `offset` into dword `old`.
fn merge(old: u32, offset: u8, width: IoWidth, value: u32) -> u32 {
    let shift = (offset & 3) as u32 * 8;
    let mask = width.mask() << shift;
    (old & !mask) | ((value << shift) & mask)
}

fn unmap_bar(vm: &Vm, bar: &mut VBar) {
    if let Some(gpa) = bar.mapped.take() {
        if let Err(e) = ept_del_mr(vm, gpa, bar.size) {
            log::warn!("vm{}: unmapping bar at {:#x}: {:?}", vm.vm_id, gpa, e);
        }
    }
}

fn map_bar(vm: &Vm, bar: &mut VBar) {
    if bar.size == 0 {
        return;
    }
    let gpa = bar.base & bar.mask();
    if gpa == 0 {
        return;
    }
    match ept_add_mr(vm, bar.hpa, gpa, bar.size, EPT_MMIO) {
        Ok(()) => bar.mapped = Some(gpa),
        Err(e) => log::warn!(
            "vm{}: mapping bar {:#x} -> {:#x}: {:?}",
            vm.vm_id,
            gpa,
            bar.hpa,
            e
        ),
    }
}

fn bar_write(vm: &Vm, bars: &mut [VBar; BAR_COUNT], idx: usize, value: u32) {
    // A sizing probe unmaps the BAR until a real base is written back.
    let sizing = value == u32::MAX;
    let lo = match bars[idx].kind {
        BarKind::None | BarKind::Io => return,
        BarKind::Mem64Hi => idx - 1,
        BarKind::Mem32 | BarKind::Mem64 => idx,
    };
    let bar = &mut bars[lo];
    unmap_bar(vm, bar);
    bar.base = if idx == lo {
        (bar.base & !0xffff_ffff) | (value & !BAR_MEM_FLAGS) as u64
    } else {
        (bar.base & 0xffff_ffff) | (value as u64) << 32
    };
    if bar.kind == BarKind::Mem32 {
        bar.base &= 0xffff_ffff;
    }
    if !sizing {
        map_bar(vm, bar);
    }
}

fn msi_write(
    hv: &Hypervisor,
    vm: &Vm,
    config: &PciDevConfig,
    cap: &mut MsiCap,
    reg: u8,
    offset: u8,
    width: IoWidth,
    value: u32,
) {
    let was_enabled = cap.enabled();
    match reg - cap.offset {
        0 => {
            let dword = merge((cap.ctrl as u32) << 16, offset, width, value);
            // Only the enable bit is writable; multiple messages stay off.
            let enable = (dword >> 16) as u16 & PCIM_MSICTRL_MSI_ENABLE;
            cap.ctrl = (cap.ctrl & !PCIM_MSICTRL_MSI_ENABLE) | enable;
        }
        4 => {
            let lo = merge(cap.addr as u32, offset, width, value);
            cap.addr = (cap.addr & !0xffff_ffff) | lo as u64;
        }
        8 if cap.is_64() => {
            let hi = merge((cap.addr >> 32) as u32, offset, width, value);
            cap.addr = (cap.addr & 0xffff_ffff) | (hi as u64) << 32;
        }
        r if r == cap.data_offset() - cap.offset => {
            cap.data = merge(cap.data as u32, offset, width, value) as u16;
        }
        _ => {
            pci_pdev_write_cfg(hv, config.pbdf, offset, width, value);
            return;
        }
    }
    match (was_enabled, cap.enabled()) {
        (_, true) => remap_msi(hv, vm, config, cap),
        (true, false) => {
            write_phys_ctrl(hv, config, cap, false);
            ptirq_remove_msix_remapping(hv, vm, config.vbdf, 1);
        }
        (false, false) => (),
    }
}

fn write_phys_ctrl(hv: &Hypervisor, config: &PciDevConfig, cap: &MsiCap, enable: bool) {
    let ctrl = (cap.ctrl & !PCIM_MSICTRL_MSI_ENABLE) | enable as u16;
    pci_pdev_write_cfg(hv, config.pbdf, cap.offset + 2, IoWidth::Word, ctrl as u32);
}

/// Program the physical MSI of the function after the guest enabled or
/// reprogrammed its virtual one.
fn remap_msi(hv: &Hypervisor, vm: &Vm, config: &PciDevConfig, cap: &MsiCap) {
    let mut info = MsiInfo {
        vmsi: MsiMessage {
            addr: cap.addr,
            data: cap.data as u32,
        },
        ..Default::default()
    };
    write_phys_ctrl(hv, config, cap, false);
    if let Err(e) = ptirq_msix_remap(hv, vm, config.vbdf, config.pbdf, 0, &mut info) {
        log::error!("remap_msi: vm{} {:?}: {:?}", vm.vm_id, config.vbdf, e);
        return;
    }
    let pbdf = config.pbdf;
    pci_pdev_write_cfg(hv, pbdf, cap.offset + 4, IoWidth::Dword, info.pmsi.addr as u32);
    if cap.is_64() {
        pci_pdev_write_cfg(hv, pbdf, cap.offset + 8, IoWidth::Dword, (info.pmsi.addr >> 32) as u32);
    }
    pci_pdev_write_cfg(hv, pbdf, cap.data_offset(), IoWidth::Word, info.pmsi.data);
    write_phys_ctrl(hv, config, cap, true);
}

fn ptdev_write(
    hv: &Hypervisor,
    vm: &Vm,
    config: &PciDevConfig,
    st: &mut PtState,
    offset: u8,
    width: IoWidth,
    value: u32,
) {
    let reg = offset & 0xfc;
    if is_bar_reg(reg) {
        let idx = ((reg - PCIR_BAR0) / 4) as usize;
        let old = bar_read(&st.bars, idx);
        bar_write(vm, &mut st.bars, idx, merge(old, offset, width, value));
        return;
    }
    if let Some(cap) = st.msi.as_mut() {
        if (cap.offset..cap.end()).contains(&reg) {
            msi_write(hv, vm, config, cap, reg, offset, width, value);
            return;
        }
    }
    if offset == PCIR_INTR_LINE {
        st.intr_line = value as u8;
        if st.phys_pin != 0 && st.intr_line < 16 {
            if let Err(e) = ptirq_intx_pin_remap(hv, vm, st.intr_line, st.phys_line) {
                log::error!("ptdev_write: vm{} {:?} intx: {:?}", vm.vm_id, config.vbdf, e);
            }
        }
        return;
    }
    if reg == PCIR_INTR_LINE {
        // Pin, min grant and max latency are read-only.
        return;
    }
    pci_pdev_write_cfg(hv, config.pbdf, offset, width, value);
}

/// Size the BARs of the physical function and record their bases.
fn probe_bars(hv: &Hypervisor, config: &PciDevConfig, bars: &mut [VBar; BAR_COUNT]) {
    let pbdf = config.pbdf;
    let mut i = 0;
    while i < BAR_COUNT {
        let reg = PCIR_BAR0 + 4 * i as u8;
        let orig = pci_pdev_read_cfg(hv, pbdf, reg, IoWidth::Dword);
        pci_pdev_write_cfg(hv, pbdf, reg, IoWidth::Dword, u32::MAX);
        let probe = pci_pdev_read_cfg(hv, pbdf, reg, IoWidth::Dword);
        pci_pdev_write_cfg(hv, pbdf, reg, IoWidth::Dword, orig);

        if orig & BAR_IO_SPACE != 0 {
            if probe & !0x3 != 0 {
                bars[i].kind = BarKind::Io;
            }
            i += 1;
            continue;
        }
        let is_64 = orig & 0x6 == BAR_MEM_TYPE_64 && i + 1 < BAR_COUNT;
        let (mut base, mut mask) = ((orig & !BAR_MEM_FLAGS) as u64, (probe & !BAR_MEM_FLAGS) as u64);
        if is_64 {
            let hreg = reg + 4;
            let horig = pci_pdev_read_cfg(hv, pbdf, hreg, IoWidth::Dword);
            pci_pdev_write_cfg(hv, pbdf, hreg, IoWidth::Dword, u32::MAX);
            let hprobe = pci_pdev_read_cfg(hv, pbdf, hreg, IoWidth::Dword);
            pci_pdev_write_cfg(hv, pbdf, hreg, IoWidth::Dword, horig);
            base |= (horig as u64) << 32;
            mask |= (hprobe as u64) << 32;
        } else if mask != 0 {
            mask |= !0xffff_ffff;
        }
        if mask != 0 {
            let size = (!mask).wrapping_add(1);
            bars[i] = VBar {
                kind: if is_64 { BarKind::Mem64 } else { BarKind::Mem32 },
                flags: orig & BAR_MEM_FLAGS,
                size,
                hpa: base,
                base: config.vbar_base[i],
                mapped: None,
            };
            if is_64 {
                bars[i + 1].kind = BarKind::Mem64Hi;
            }
        }
        i += if is_64 { 2 } else { 1 };
    }
}

/// Walk the capability list of the physical function for MSI.
fn probe_msi(hv: &Hypervisor, pbdf: Bdf) -> Option<MsiCap> {
    if pci_pdev_read_cfg(hv, pbdf, PCIR_STATUS, IoWidth::Word) & PCIM_STATUS_CAPPRESENT == 0 {
        return None;
    }
    let mut ptr = pci_pdev_read_cfg(hv, pbdf, PCIR_CAP_PTR, IoWidth::Byte) as u8 & 0xfc;
    // A well formed list can not hold more entries than fit in the space.
    for _ in 0..48 {
        if ptr < 0x40 {
            return None;
        }
        let hdr = pci_pdev_read_cfg(hv, pbdf, ptr, IoWidth::Dword);
        if hdr as u8 == PCIY_MSI {
            return Some(MsiCap {
                offset: ptr,
                ctrl: ((hdr >> 16) as u16) & PCIM_MSICTRL_64BIT,
                addr: 0,
                data: 0,
            });
        }
        ptr = (hdr >> 8) as u8 & 0xfc;
    }
    None
}

/// The virtual PCI bus of a VM.
pub struct VPci {
    /// Last value written to CF8.
    addr: AtomicU32,
    vdevs: Vec<PciVdev>,
}

impl VPci {
    pub fn new(config: &'static VmConfig) -> Self {
        Self {
            addr: AtomicU32::new(0),
            vdevs: config.pci_devs.iter().map(PciVdev::new).collect(),
        }
    }

    /// Probe the passthrough functions and map their BARs into the EPT.
    pub fn init(&self, hv: &Hypervisor, vm: &Vm) {
        for vdev in &self.vdevs {
            let Function::PtDev(st) = &vdev.function else {
                continue;
            };
            let pbdf = vdev.config.pbdf;
            let mut st = st.lock();
            probe_bars(hv, vdev.config, &mut st.bars);
            st.msi = probe_msi(hv, pbdf);
            st.phys_line = pci_pdev_read_cfg(hv, pbdf, PCIR_INTR_LINE, IoWidth::Byte) as u8;
            st.phys_pin = pci_pdev_read_cfg(hv, pbdf, PCIR_INTR_PIN, IoWidth::Byte) as u8;
            st.bars.iter_mut().for_each(|bar| map_bar(vm, bar));
            log::info!(
                "vm{}: {:?} -> {:?} passed through, msi {}",
                vm.vm_id,
                vdev.config.vbdf,
                pbdf,
                if st.msi.is_some() { "present" } else { "absent" }
            );
        }
    }

    /// Forget the configuration address.
    pub fn reset(&self) {
        self.addr.store(0, Ordering::Relaxed);
    }

    fn find(&self, bdf: Bdf) -> Option<&PciVdev> {
        self.vdevs.iter().find(|d| d.config.vbdf == bdf)
    }

    /// Decode the current configuration address for an access at `port`.
    fn target(&self, port: u16, width: IoWidth) -> Option<(&PciVdev, u8)> {
        let addr = self.addr.load(Ordering::Relaxed);
        let byte = (port - PCI_CONFIG_DATA) as usize;
        if addr & CFG_ENABLE == 0 || byte + width.bytes() > 4 {
            return None;
        }
        let bdf = Bdf((addr >> 8) as u16);
        let offset = (addr & 0xfc) as u8 + byte as u8;
        self.find(bdf).map(|d| (d, offset))
    }
}

impl PioHandler for VPci {
    fn read(&self, hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, port: u16, width: IoWidth) -> u32 {
        if port == PCI_CONFIG_ADDR {
            return match width {
                IoWidth::Dword => self.addr.load(Ordering::Relaxed),
                _ => width.mask(),
            };
        }
        match self.target(port, width) {
            Some((vdev, offset)) => {
                let dword = vdev.read_dword(hv, offset & 0xfc);
                (dword >> ((offset & 3) * 8)) & width.mask()
            }
            None => width.mask(),
        }
    }

    fn write(&self, hv: &Hypervisor, vm: &Vm, _vcpu: &VCpu, port: u16, width: IoWidth, value: u32) {
        if port == PCI_CONFIG_ADDR {
            if width == IoWidth::Dword {
                self.addr.store(value & !0x3, Ordering::Relaxed);
            }
            return;
        }
        if let Some((vdev, offset)) = self.target(port, width) {
            vdev.write(hv, vm, offset, width, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ept::gpa2hpa, ept::INVALID_HPA, tests::Harness, vm::start_vm};

    static HOSTBRIDGE: PciDevConfig = PciDevConfig {
        emu_type: PciEmuType::HvEmul,
        vbdf: Bdf::new(0, 0, 0),
        pbdf: Bdf::new(0, 0, 0),
        vbar_base: [0; 6],
    };

    static NIC: PciDevConfig = PciDevConfig {
        emu_type: PciEmuType::PtDev,
        vbdf: Bdf::new(0, 2, 0),
        pbdf: Bdf::new(4, 0, 0),
        vbar_base: [0xd000_0000, 0, 0, 0, 0, 0],
    };

    /// A bus with a host bridge and a NIC with a 1 MiB BAR0 and 64-bit MSI
    /// at 0x50.
    fn bus(vm: &Vm) -> VPci {
        let vpci = VPci {
            addr: AtomicU32::new(0),
            vdevs: [&HOSTBRIDGE, &NIC].into_iter().map(PciVdev::new).collect(),
        };
        if let Function::PtDev(st) = &vpci.vdevs[1].function {
            let mut st = st.lock();
            st.bars[0] = VBar {
                kind: BarKind::Mem32,
                flags: 0,
                size: 0x10_0000,
                hpa: 0xf000_0000,
                base: NIC.vbar_base[0],
                mapped: None,
            };
            map_bar(vm, &mut st.bars[0]);
            st.msi = Some(MsiCap {
                offset: 0x50,
                ctrl: PCIM_MSICTRL_64BIT,
                addr: 0,
                data: 0,
            });
            st.phys_pin = 1;
            st.phys_line = 10;
        }
        vpci
    }

    fn cfg_write(h: &Harness, vm: &Vm, vpci: &VPci, bdf: Bdf, off: u8, width: IoWidth, v: u32) {
        let vcpu = vm.bsp().unwrap();
        vpci.write(&h.hv, vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Dword, make_address(bdf, off));
        vpci.write(&h.hv, vm, vcpu, PCI_CONFIG_DATA + (off & 3) as u16, width, v);
    }

    fn cfg_read(h: &Harness, vm: &Vm, vpci: &VPci, bdf: Bdf, off: u8, width: IoWidth) -> u32 {
        let vcpu = vm.bsp().unwrap();
        vpci.write(&h.hv, vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Dword, make_address(bdf, off));
        vpci.read(&h.hv, vm, vcpu, PCI_CONFIG_DATA + (off & 3) as u16, width)
    }

    #[test]
    fn host_bridge_and_address_decoding() {
        let h = Harness::new();
        let vm = h.vm(0);
        let vcpu = vm.bsp().unwrap();
        let vpci = bus(&vm);
        let hb = HOSTBRIDGE.vbdf;
        assert_eq!(cfg_read(&h, &vm, &vpci, hb, 0, IoWidth::Dword), 0x5af0_8086);
        assert_eq!(cfg_read(&h, &vm, &vpci, hb, 2, IoWidth::Word), 0x5af0);
        assert_eq!(cfg_read(&h, &vm, &vpci, hb, 0x0b, IoWidth::Byte), 0x06);
        assert_eq!(vpci.read(&h.hv, &vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Dword), 0x8000_0008);
        // Absent function.
        assert_eq!(cfg_read(&h, &vm, &vpci, Bdf::new(0, 7, 0), 0, IoWidth::Dword), u32::MAX);
        // CF8 keeps the last dword written; only dword accesses reach it.
        let absent = make_address(Bdf::new(0, 7, 0), 0);
        assert_eq!(absent, 0x8000_3800);
        vpci.write(&h.hv, &vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Byte, 0);
        assert_eq!(vpci.read(&h.hv, &vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Dword), absent);
        assert_eq!(vpci.read(&h.hv, &vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Word), 0xffff);
        // Disabled address.
        vpci.write(&h.hv, &vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Dword, 0);
        assert_eq!(vpci.read(&h.hv, &vm, vcpu, PCI_CONFIG_DATA, IoWidth::Dword), u32::MAX);
        // Crossing the dword.
        vpci.write(&h.hv, &vm, vcpu, PCI_CONFIG_ADDR, IoWidth::Dword, make_address(hb, 0));
        assert_eq!(vpci.read(&h.hv, &vm, vcpu, PCI_CONFIG_DATA + 2, IoWidth::Dword), u32::MAX);
    }

    #[test]
    fn bar_sizing_and_relocation() {
        let h = Harness::new();
        let vm = h.vm(0);
        let vpci = bus(&vm);
        let nic = NIC.vbdf;
        assert_eq!(cfg_read(&h, &vm, &vpci, nic, PCIR_BAR0, IoWidth::Dword), 0xd000_0000);
        assert_eq!(gpa2hpa(&vm, 0xd000_0000), 0xf000_0000);

        cfg_write(&h, &vm, &vpci, nic, PCIR_BAR0, IoWidth::Dword, u32::MAX);
        assert_eq!(cfg_read(&h, &vm, &vpci, nic, PCIR_BAR0, IoWidth::Dword), 0xfff0_0000);
        assert_eq!(gpa2hpa(&vm, 0xd000_0000), INVALID_HPA);

        cfg_write(&h, &vm, &vpci, nic, PCIR_BAR0, IoWidth::Dword, 0xb000_0000);
        assert_eq!(cfg_read(&h, &vm, &vpci, nic, PCIR_BAR0, IoWidth::Dword), 0xb000_0000);
        assert_eq!(gpa2hpa(&vm, 0xb000_0000 + 0x1234), 0xf000_1234);
        assert_eq!(gpa2hpa(&vm, 0xd000_0000), INVALID_HPA);
        // Unimplemented BARs read zero.
        assert_eq!(cfg_read(&h, &vm, &vpci, nic, PCIR_BAR0 + 4, IoWidth::Dword), 0);
    }

    #[test]
    fn msi_enable_remaps_through_ptirq() {
        let h = Harness::new();
        let vm = h.vm(0);
        start_vm(&h.hv, &vm).unwrap();
        let vpci = bus(&vm);
        let nic = NIC.vbdf;
        cfg_write(&h, &vm, &vpci, nic, 0x54, IoWidth::Dword, 0xfee0_0000);
        cfg_write(&h, &vm, &vpci, nic, 0x58, IoWidth::Dword, 0);
        cfg_write(&h, &vm, &vpci, nic, 0x5c, IoWidth::Word, 0x31);
        assert_eq!(h.hv.ptirq.active_count(0), 0);
        assert_eq!(cfg_read(&h, &vm, &vpci, nic, 0x5c, IoWidth::Word), 0x31);

        let before = h.p.pio_writes().len();
        cfg_write(&h, &vm, &vpci, nic, 0x52, IoWidth::Word, (PCIM_MSICTRL_MSI_ENABLE | 0x70) as u32);
        assert_eq!(h.hv.ptirq.active_count(0), 1);
        // Multiple message enable stays clear.
        assert_eq!(
            cfg_read(&h, &vm, &vpci, nic, 0x52, IoWidth::Word),
            (PCIM_MSICTRL_64BIT | PCIM_MSICTRL_MSI_ENABLE) as u32
        );
        let writes = h.p.pio_writes();
        let data_write = writes[before..]
            .iter()
            .find(|w| w.0 == PCI_CONFIG_DATA && w.1 == IoWidth::Word && w.2 < 0x100)
            .copied()
            .unwrap();
        assert!(h.hv.irq.is_registered(data_write.2 as u8));

        cfg_write(&h, &vm, &vpci, nic, 0x52, IoWidth::Word, 0);
        assert_eq!(h.hv.ptirq.active_count(0), 0);
        assert!(!h.hv.irq.is_registered(data_write.2 as u8));
    }

    #[test]
    fn interrupt_line_routes_the_pin() {
        let h = Harness::new();
        let vm = h.vm(0);
        let vpci = bus(&vm);
        let nic = NIC.vbdf;
        cfg_write(&h, &vm, &vpci, nic, PCIR_INTR_LINE, IoWidth::Byte, 11);
        assert_eq!(cfg_read(&h, &vm, &vpci, nic, PCIR_INTR_LINE, IoWidth::Byte), 11);
        assert_eq!(h.hv.ptirq.active_count(0), 1);
        // Line 0xff means "not connected".
        cfg_write(&h, &vm, &vpci, nic, PCIR_INTR_LINE, IoWidth::Byte, 0xff);
        assert_eq!(h.hv.ptirq.active_count(0), 1);
    }
}
