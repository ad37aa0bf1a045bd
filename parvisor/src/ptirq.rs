//! Passthrough interrupt remapping.
//!
//! Interrupts of passthrough devices land on host vectors. Each mapping from
//! a physical source to the virtual interrupt of its VM is an entry of one
//! global pool of [`MAX_PT_IRQ_ENTRIES`]. Allocation claims the first clear
//! bit of the pool bitmap.
//!
//! An entry is `active` exactly while a host vector is registered for it.
//! A host interrupt on an active entry queues it on the softirq list of its
//! VM; the list is drained by [`ptirq_softirq`] on the way back into the
//! guest.

use crate::{
    config::{Bdf, VmId, INVALID_VMID, MAX_PT_IRQ_ENTRIES},
    errno::Errno,
    hv::Hypervisor,
    irq::{IrqFlags, IrqHandler},
    util::{bitmap, list::Link},
    vcpu::{VCpu, VCpuRequest},
    virq::{vpic_lower, vpic_raise},
    vlapic::{calc_dest, set_intr, DEFAULT_APIC_BASE},
    vm::Vm,
};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin_lock::SpinLock;

/// Returned by [`PtirqTable::alloc_entry`] when the pool is exhausted.
pub const INVALID_PTDEV_ENTRY_ID: u16 = 0xffff;

const BITMAP_WORDS: usize = (MAX_PT_IRQ_ENTRIES + 63) / 64;

const MSI_ADDR_DEST_SHIFT: u64 = 12;
const MSI_ADDR_LOGICAL: u64 = 1 << 2;
const MSI_DATA_DELIVERY_SHIFT: u32 = 8;
const MSI_DATA_LEVEL: u32 = 1 << 15;
const DELIVERY_LOWPRI: u32 = 1;
const DELIVERY_NMI: u32 = 4;

/// Kind of a passthrough interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtirqIntrType {
    /// MSI or one MSI-X table entry.
    Msi,
    /// Legacy pin.
    Intx,
}

/// An MSI address/data pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsiMessage {
    pub addr: u64,
    pub data: u32,
}

impl MsiMessage {
    #[inline]
    pub fn vector(&self) -> u8 {
        self.data as u8
    }

    #[inline]
    fn dest(&self) -> u32 {
        ((self.addr >> MSI_ADDR_DEST_SHIFT) & 0xff) as u32
    }

    #[inline]
    fn delivery_mode(&self) -> u32 {
        (self.data >> MSI_DATA_DELIVERY_SHIFT) & 0x7
    }
}

/// The message the guest programmed and the one the device must send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsiInfo {
    pub vmsi: MsiMessage,
    pub pmsi: MsiMessage,
}

/// What an entry maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtirqSource {
    None,
    Msi {
        virt_bdf: Bdf,
        phys_bdf: Bdf,
        entry_nr: u16,
        vmsi: MsiMessage,
    },
    Intx {
        virt_pin: u8,
        phys_pin: u8,
    },
}

/// Run on an active entry right before it is torn down with its VM.
pub type ReleaseCallback = fn(&Hypervisor, &PtirqEntry);

#[derive(Clone, Copy)]
struct EntryData {
    vm_id: VmId,
    intr_type: PtirqIntrType,
    source: PtirqSource,
    allocated_pirq: Option<u8>,
    release_cb: Option<ReleaseCallback>,
}

impl EntryData {
    const fn zeroed() -> Self {
        Self {
            vm_id: INVALID_VMID,
            intr_type: PtirqIntrType::Msi,
            source: PtirqSource::None,
            allocated_pirq: None,
            release_cb: None,
        }
    }
}

/// One slot of the pool.
pub struct PtirqEntry {
    pub ptdev_entry_id: u16,
    active: AtomicBool,
    /// Node of the softirq list of the owner.
    pub link: Link,
    intr_count: AtomicU64,
    data: SpinLock<EntryData>,
}

impl PtirqEntry {
    fn new(id: u16) -> Self {
        Self {
            ptdev_entry_id: id,
            active: AtomicBool::new(false),
            link: Link::new(),
            intr_count: AtomicU64::new(0),
            data: SpinLock::new(EntryData::zeroed()),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Owner of the entry, [`INVALID_VMID`] when free.
    pub fn vm_id(&self) -> VmId {
        self.data.lock().vm_id
    }

    pub fn intr_type(&self) -> PtirqIntrType {
        self.data.lock().intr_type
    }

    pub fn source(&self) -> PtirqSource {
        self.data.lock().source
    }

    /// Host vector while active.
    pub fn allocated_pirq(&self) -> Option<u8> {
        self.data.lock().allocated_pirq
    }

    pub fn intr_count(&self) -> u64 {
        self.intr_count.load(Ordering::Relaxed)
    }

    pub fn set_release_cb(&self, cb: ReleaseCallback) {
        self.data.lock().release_cb = Some(cb);
    }
}

/// Host interrupt handler of an entry.
struct PtirqInterrupt {
    id: u16,
}

impl IrqHandler for PtirqInterrupt {
    fn handle(&self, hv: &Hypervisor, _vector: u8) {
        let Some(entry) = hv.ptirq.entry(self.id) else {
            return;
        };
        if !entry.is_active() {
            return;
        }
        entry.intr_count.fetch_add(1, Ordering::Relaxed);
        let Some(vm) = hv.vm(entry.vm_id()) else {
            return;
        };
        vm.softirq.lock().push_back(self.id, |i| hv.ptirq.link(i));
        if let Some(target) = softirq_target(hv, &vm) {
            target.make_request(VCpuRequest::SOFTIRQ);
            hv.kick_vcpu(target);
        }
    }
}

/// The vCPU that drains the softirq list: the one of `vm` on this pCPU, or
/// its BSP.
fn softirq_target<'a>(hv: &Hypervisor, vm: &'a Vm) -> Option<&'a VCpu> {
    let me = hv.current_pcpu();
    vm.vcpus().find(|v| v.pcpu_id == me).or_else(|| vm.bsp())
}

/// The global pool.
pub struct PtirqTable {
    bitmap: [AtomicU64; BITMAP_WORDS],
    entries: Vec<PtirqEntry>,
    /// Serializes remapping and the per-VM sweep.
    ptdev_lock: SpinLock<()>,
}

impl PtirqTable {
    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            bitmap: [ZERO; BITMAP_WORDS],
            entries: (0..MAX_PT_IRQ_ENTRIES as u16).map(PtirqEntry::new).collect(),
            ptdev_lock: SpinLock::new(()),
        }
    }

    #[inline]
    pub fn entry(&self, id: u16) -> Option<&PtirqEntry> {
        self.entries.get(id as usize)
    }

    fn link(&self, id: u16) -> &Link {
        &self.entries[id as usize].link
    }

    /// Whether `id` is allocated.
    pub fn is_allocated(&self, id: u16) -> bool {
        (id as usize) < MAX_PT_IRQ_ENTRIES && bitmap::test(&self.bitmap, id as usize)
    }

    /// Claim a free entry for `vm`. Returns [`INVALID_PTDEV_ENTRY_ID`] when
    /// the pool is exhausted.
    pub fn alloc_entry(&self, vm: &Vm, intr_type: PtirqIntrType) -> u16 {
        let Some(bit) = bitmap::alloc_first_zero(&self.bitmap, MAX_PT_IRQ_ENTRIES) else {
            log::warn!("alloc_entry: vm{}: ptirq pool exhausted", vm.vm_id);
            return INVALID_PTDEV_ENTRY_ID;
        };
        let entry = &self.entries[bit];
        entry.active.store(false, Ordering::Release);
        entry.intr_count.store(0, Ordering::Relaxed);
        *entry.data.lock() = EntryData {
            vm_id: vm.vm_id,
            intr_type,
            ..EntryData::zeroed()
        };
        entry.ptdev_entry_id
    }

    /// Register a host vector for `id`, `phys_irq` if given. On success the
    /// entry becomes active.
    pub fn activate_entry(&self, hv: &Hypervisor, id: u16, phys_irq: Option<u8>) -> Result<u8, Errno> {
        if !self.is_allocated(id) {
            return Err(Errno::EINVAL);
        }
        let entry = &self.entries[id as usize];
        if entry.is_active() {
            return entry.allocated_pirq().ok_or(Errno::EINVAL);
        }
        let vector = hv
            .irq
            .request_irq(phys_irq, Arc::new(PtirqInterrupt { id }), IrqFlags::PT)?;
        entry.data.lock().allocated_pirq = Some(vector);
        entry.active.store(true, Ordering::Release);
        Ok(vector)
    }

    /// Clear `active`, then give the host vector back.
    pub fn deactivate_entry(&self, hv: &Hypervisor, id: u16) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        if entry.active.swap(false, Ordering::AcqRel) {
            if let Some(vector) = entry.data.lock().allocated_pirq.take() {
                hv.irq.free_irq(vector);
            }
        }
    }

    /// Return `id` of `vm` to the pool. The entry must be inactive.
    pub fn release_entry(&self, vm: &Vm, id: u16) {
        if !self.is_allocated(id) {
            return;
        }
        let entry = &self.entries[id as usize];
        debug_assert!(!entry.is_active());
        vm.softirq.lock().remove(id, |i| self.link(i));
        entry.intr_count.store(0, Ordering::Relaxed);
        *entry.data.lock() = EntryData::zeroed();
        // The slot is free only once it is fully cleared.
        bitmap::clear(&self.bitmap, id as usize);
    }

    /// Allocated entries owned by `vm_id`.
    fn owned(&self, vm_id: VmId) -> impl Iterator<Item = &PtirqEntry> + '_ {
        self.entries
            .iter()
            .filter(move |e| self.is_allocated(e.ptdev_entry_id) && e.vm_id() == vm_id)
    }

    fn find_msi(&self, vm_id: VmId, bdf: Bdf, nr: u16) -> Option<&PtirqEntry> {
        self.owned(vm_id).find(|e| {
            matches!(e.source(), PtirqSource::Msi { virt_bdf, entry_nr, .. }
                if virt_bdf == bdf && entry_nr == nr)
        })
    }

    fn find_intx(&self, vm_id: VmId, pin: u8) -> Option<&PtirqEntry> {
        self.owned(vm_id)
            .find(|e| matches!(e.source(), PtirqSource::Intx { virt_pin, .. } if virt_pin == pin))
    }

    /// Number of active entries owned by `vm_id`.
    pub fn active_count(&self, vm_id: VmId) -> usize {
        self.owned(vm_id).filter(|e| e.is_active()).count()
    }
}

impl Default for PtirqTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Tear down every entry `vm` owns.
pub fn ptdev_release_all_entries(hv: &Hypervisor, vm: &Vm) {
    let table = &hv.ptirq;
    let _guard = table.ptdev_lock.lock();
    let owned: Vec<u16> = table.owned(vm.vm_id).map(|e| e.ptdev_entry_id).collect();
    for id in owned {
        let entry = &table.entries[id as usize];
        if entry.is_active() {
            let cb = entry.data.lock().release_cb;
            if let Some(cb) = cb {
                cb(hv, entry);
            }
            table.deactivate_entry(hv, id);
        }
        table.release_entry(vm, id);
    }
}

/// Physical MSI address steering to the pCPU of the vCPU the guest targets.
fn physical_msi(vm: &Vm, vmsi: &MsiMessage, vector: u8) -> MsiMessage {
    let phys = vmsi.addr & MSI_ADDR_LOGICAL == 0;
    let lowprio = vmsi.delivery_mode() == DELIVERY_LOWPRI;
    let mask = calc_dest(vm, false, vmsi.dest(), phys, lowprio);
    let pcpu = bitmap::iter_ones(mask)
        .next()
        .and_then(|i| vm.vcpu(i))
        .or_else(|| vm.bsp())
        .map_or(0, |v| v.pcpu_id as u64);
    MsiMessage {
        addr: DEFAULT_APIC_BASE | (pcpu << MSI_ADDR_DEST_SHIFT),
        data: vector as u32,
    }
}

/// Map MSI (`entry_nr == 0`) or MSI-X entry `entry_nr` of the passthrough
/// function `virt_bdf` to `info.vmsi`.
///
/// The existing entry is reused when the guest reprograms the message.
/// On success `info.pmsi` holds the message to program into the device.
pub fn ptirq_msix_remap(
    hv: &Hypervisor,
    vm: &Vm,
    virt_bdf: Bdf,
    phys_bdf: Bdf,
    entry_nr: u16,
    info: &mut MsiInfo,
) -> Result<(), Errno> {
    let table = &hv.ptirq;
    let _guard = table.ptdev_lock.lock();
    let id = match table.find_msi(vm.vm_id, virt_bdf, entry_nr) {
        Some(e) => e.ptdev_entry_id,
        None => {
            let id = table.alloc_entry(vm, PtirqIntrType::Msi);
            if id == INVALID_PTDEV_ENTRY_ID {
                return Err(Errno::EBUSY);
            }
            id
        }
    };
    let vector = match table.activate_entry(hv, id, None) {
        Ok(v) => v,
        Err(e) => {
            log::error!(
                "ptirq_msix_remap: vm{} {:?} entry {}: no host vector",
                vm.vm_id,
                virt_bdf,
                entry_nr
            );
            table.release_entry(vm, id);
            return Err(e);
        }
    };
    table.entries[id as usize].data.lock().source = PtirqSource::Msi {
        virt_bdf,
        phys_bdf,
        entry_nr,
        vmsi: info.vmsi,
    };
    info.pmsi = physical_msi(vm, &info.vmsi, vector);
    log::debug!(
        "vm{} {:?}: msi entry {} vector {:#x} -> host {:#x}",
        vm.vm_id,
        virt_bdf,
        entry_nr,
        info.vmsi.vector(),
        vector
    );
    Ok(())
}

/// Remove the mappings of the first `vector_count` MSI entries of
/// `virt_bdf`.
pub fn ptirq_remove_msix_remapping(hv: &Hypervisor, vm: &Vm, virt_bdf: Bdf, vector_count: u16) {
    let table = &hv.ptirq;
    let _guard = table.ptdev_lock.lock();
    for nr in 0..vector_count {
        if let Some(id) = table.find_msi(vm.vm_id, virt_bdf, nr).map(|e| e.ptdev_entry_id) {
            table.deactivate_entry(hv, id);
            table.release_entry(vm, id);
        }
    }
}

/// Map physical legacy pin `phys_pin` to vPIC line `virt_pin`.
///
/// The board routes the physical pin to the returned host vector.
pub fn ptirq_intx_pin_remap(hv: &Hypervisor, vm: &Vm, virt_pin: u8, phys_pin: u8) -> Result<u8, Errno> {
    if virt_pin >= 16 {
        return Err(Errno::EINVAL);
    }
    let table = &hv.ptirq;
    let _guard = table.ptdev_lock.lock();
    let id = match table.find_intx(vm.vm_id, virt_pin) {
        Some(e) => e.ptdev_entry_id,
        None => match table.alloc_entry(vm, PtirqIntrType::Intx) {
            INVALID_PTDEV_ENTRY_ID => return Err(Errno::EBUSY),
            id => id,
        },
    };
    table.entries[id as usize].data.lock().source = PtirqSource::Intx { virt_pin, phys_pin };
    table.activate_entry(hv, id, None).map_err(|e| {
        table.release_entry(vm, id);
        e
    })
}

fn deliver_msi(hv: &Hypervisor, vm: &Vm, vmsi: &MsiMessage) {
    let phys = vmsi.addr & MSI_ADDR_LOGICAL == 0;
    let mode = vmsi.delivery_mode();
    let mask = calc_dest(vm, false, vmsi.dest(), phys, mode == DELIVERY_LOWPRI);
    for vcpu in bitmap::iter_ones(mask).filter_map(|i| vm.vcpu(i)) {
        if mode == DELIVERY_NMI {
            vcpu.make_request(VCpuRequest::NMI);
            hv.kick_vcpu(vcpu);
        } else {
            set_intr(hv, vcpu, vmsi.vector(), vmsi.data & MSI_DATA_LEVEL != 0);
        }
    }
}

/// Deliver the queued passthrough interrupts of `vm`.
///
/// Deliveries to a VM that is not running stay queued.
pub fn ptirq_softirq(hv: &Hypervisor, vm: &Vm) {
    let table = &hv.ptirq;
    loop {
        let Some(id) = vm.softirq.lock().pop_front(|i| table.link(i)) else {
            break;
        };
        let entry = &table.entries[id as usize];
        if !vm.is_started() {
            vm.softirq.lock().push_back(id, |i| table.link(i));
            vm.requeued.fetch_add(1, Ordering::Relaxed);
            if let Some(bsp) = vm.bsp() {
                bsp.make_request(VCpuRequest::SOFTIRQ);
            }
            break;
        }
        if !entry.is_active() {
            continue;
        }
        match entry.source() {
            PtirqSource::Msi { vmsi, .. } => deliver_msi(hv, vm, &vmsi),
            PtirqSource::Intx { virt_pin, .. } => {
                vpic_raise(hv, vm, virt_pin);
                vpic_lower(vm, virt_pin);
            }
            PtirqSource::None => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::Harness, vm::start_vm};
    use rand::seq::SliceRandom;

    #[test]
    fn alloc_release_reuse() {
        let h = Harness::new();
        let vm = h.vm(0);
        let t = &h.hv.ptirq;
        let a = t.alloc_entry(&vm, PtirqIntrType::Msi);
        let b = t.alloc_entry(&vm, PtirqIntrType::Intx);
        assert_eq!((a, b), (0, 1));
        let e = t.entry(b).unwrap();
        assert_eq!(e.vm_id(), 0);
        assert_eq!(e.intr_type(), PtirqIntrType::Intx);
        assert!(!e.is_active());
        t.release_entry(&vm, a);
        assert!(!t.is_allocated(a));
        assert_eq!(t.entry(a).unwrap().vm_id(), INVALID_VMID);
        assert_eq!(t.alloc_entry(&vm, PtirqIntrType::Msi), a);
    }

    #[test]
    fn random_alloc_release() {
        let h = Harness::new();
        let vm = h.vm(1);
        let t = &h.hv.ptirq;
        let mut rng = rand::thread_rng();
        let mut held: Vec<u16> = (0..MAX_PT_IRQ_ENTRIES)
            .map(|_| t.alloc_entry(&vm, PtirqIntrType::Msi))
            .collect();
        assert!(held.iter().all(|&id| (id as usize) < MAX_PT_IRQ_ENTRIES));
        for _ in 0..8 {
            held.shuffle(&mut rng);
            let freed: Vec<u16> = held.drain(..16).collect();
            for &id in &freed {
                t.release_entry(&vm, id);
            }
            for _ in 0..16 {
                let id = t.alloc_entry(&vm, PtirqIntrType::Msi);
                assert!(freed.contains(&id));
                held.push(id);
            }
            assert_eq!(t.alloc_entry(&vm, PtirqIntrType::Msi), INVALID_PTDEV_ENTRY_ID);
        }
    }

    #[test]
    fn active_iff_host_vector_registered() {
        let h = Harness::new();
        let vm = h.vm(0);
        let t = &h.hv.ptirq;
        let id = t.alloc_entry(&vm, PtirqIntrType::Msi);
        let v = t.activate_entry(&h.hv, id, None).unwrap();
        assert!(t.entry(id).unwrap().is_active());
        assert!(h.hv.irq.is_registered(v));
        assert_eq!(h.hv.irq.flags(v), Some(IrqFlags::PT));
        // Activating twice keeps the vector.
        assert_eq!(t.activate_entry(&h.hv, id, None), Ok(v));
        t.deactivate_entry(&h.hv, id);
        assert!(!t.entry(id).unwrap().is_active());
        assert!(!h.hv.irq.is_registered(v));
        assert_eq!(t.activate_entry(&h.hv, INVALID_PTDEV_ENTRY_ID, None), Err(Errno::EINVAL));
    }

    #[test]
    fn msi_remap_and_delivery() {
        let h = Harness::new();
        let vm = h.vm(0);
        start_vm(&h.hv, &vm).unwrap();
        let (vbdf, pbdf) = (Bdf::new(0, 1, 0), Bdf::new(3, 0, 0));
        let mut info = MsiInfo {
            vmsi: MsiMessage {
                addr: 0xfee0_1000,
                data: 0x41,
            },
            ..Default::default()
        };
        ptirq_msix_remap(&h.hv, &vm, vbdf, pbdf, 0, &mut info).unwrap();
        // vCPU 1 of VM0 runs on pCPU 1.
        assert_eq!(info.pmsi.addr, 0xfee0_1000);
        let host = info.pmsi.vector();
        assert_eq!(h.hv.ptirq.active_count(0), 1);

        // Reprogramming reuses the entry and its vector.
        info.vmsi.data = 0x42;
        ptirq_msix_remap(&h.hv, &vm, vbdf, pbdf, 0, &mut info).unwrap();
        assert_eq!(info.pmsi.vector(), host);
        assert_eq!(h.hv.ptirq.active_count(0), 1);

        assert!(h.hv.irq.dispatch(&h.hv, host));
        let vcpu1 = vm.vcpu(1).unwrap();
        assert!(vcpu1.has_request(VCpuRequest::SOFTIRQ) || vm.bsp().unwrap().has_request(VCpuRequest::SOFTIRQ));
        ptirq_softirq(&h.hv, &vm);
        assert_eq!(vcpu1.vlapic.pending_intr(), Some(0x42));
        assert!(vm.bsp().unwrap().vlapic.pending_intr().is_none());
        assert!(vm.softirq.lock().is_empty());

        ptirq_remove_msix_remapping(&h.hv, &vm, vbdf, 1);
        assert_eq!(h.hv.ptirq.active_count(0), 0);
        assert!(!h.hv.irq.is_registered(host));
    }

    #[test]
    fn paused_vm_keeps_its_deliveries() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let vector = ptirq_intx_pin_remap(&h.hv, &vm, 5, 11).unwrap();
        crate::vm::pause_vm(&h.hv, &vm);
        assert!(h.hv.irq.dispatch(&h.hv, vector));
        ptirq_softirq(&h.hv, &vm);
        assert_eq!(vm.requeued.load(Ordering::Relaxed), 1);
        assert!(!vm.softirq.lock().is_empty());
        crate::vm::resume_vm(&h.hv, &vm).unwrap();
        ptirq_softirq(&h.hv, &vm);
        assert!(vm.softirq.lock().is_empty());
        assert_eq!(h.hv.ptirq.entry(0).unwrap().intr_count(), 1);
        assert_eq!(ptirq_intx_pin_remap(&h.hv, &vm, 16, 0), Err(Errno::EINVAL));
    }

    fn count_release(_hv: &Hypervisor, e: &PtirqEntry) {
        assert!(e.is_active());
        RELEASED.fetch_add(1, Ordering::Relaxed);
    }

    static RELEASED: AtomicU64 = AtomicU64::new(0);

    #[test]
    fn release_all_only_touches_the_owner() {
        let h = Harness::new();
        let (vm0, vm1) = (h.vm(0), h.vm(1));
        let t = &h.hv.ptirq;
        let mine = t.alloc_entry(&vm1, PtirqIntrType::Msi);
        t.activate_entry(&h.hv, mine, None).unwrap();
        t.entry(mine).unwrap().set_release_cb(count_release);
        let idle = t.alloc_entry(&vm1, PtirqIntrType::Intx);
        let other = t.alloc_entry(&vm0, PtirqIntrType::Msi);
        t.activate_entry(&h.hv, other, None).unwrap();

        ptdev_release_all_entries(&h.hv, &vm1);
        assert_eq!(RELEASED.load(Ordering::Relaxed), 1);
        assert!(!t.is_allocated(mine) && !t.is_allocated(idle));
        assert_eq!(t.active_count(1), 0);
        assert!(t.entry(other).unwrap().is_active());
        // A second sweep finds nothing.
        ptdev_release_all_entries(&h.hv, &vm1);
        assert_eq!(RELEASED.load(Ordering::Relaxed), 1);
    }
}
