//! Extended Page Table.
//!
//! ## Background
//! Every VM owns one 4-level EPT translating guest physical addresses (GPA)
//! into host physical addresses (HPA). The table is rooted at a host page and
//! each level indexes 9 bits of the GPA:
//!
//! | level | entry maps | leaf allowed |
//! |-------|-----------|--------------|
//! | PML4  | 512 GiB   | no           |
//! | PDPT  | 1 GiB     | if the processor supports 1 GiB EPT pages |
//! | PD    | 2 MiB     | yes          |
//! | PT    | 4 KiB     | yes          |
//!
//! An entry is present when any of its read/write/execute bits is set.
//! Leaves carry the memory type in bits 5:3 and, above the PT level, the
//! large-page bit 7.
//!
//! ## Locking
//! The table lives behind the per-VM [`RwSpinLock`]. Structural edits (adding
//! or removing mappings, splitting a large leaf) take the lock exclusively.
//! Entries are atomic words, so protection-only edits and translations run
//! under the shared lock. Running vCPUs observe an edit at their next
//! VM-exit, when the posted `EPT_FLUSH` request issues INVEPT.
//!
//! [`RwSpinLock`]: spin_lock::RwSpinLock

use crate::{vcpu::VCpuRequest, vm::Vm};
use abyss::addressing::{Pa, Va, PAGE_MASK};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Returned by [`gpa2hpa`] for a GPA without a mapping.
pub const INVALID_HPA: u64 = 1 << 52;

const ENTRIES: usize = 512;
const LEVELS: usize = 4;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
/// First GPA a 4-level table cannot translate.
pub const MAX_GPA: u64 = 1 << 48;

/// Possible errors of an EPT edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptError {
    /// Unaligned address or size.
    Unaligned,
    /// Not exist
    NotExist,
    /// Has a duplicated mapping.
    Duplicated,
    /// The range is beyond what the table translates.
    OutOfRange,
}

bitflags::bitflags! {
    /// Bits of an EPT entry, see Intel SDM vol. 3C, 29.3.2.
    pub struct EptFlags: u64 {
        /// Reads are allowed.
        const READ = 1 << 0;
        /// Writes are allowed.
        const WRITE = 1 << 1;
        /// Instruction fetches are allowed.
        const EXECUTE = 1 << 2;
        #[doc(hidden)]
        const MT_BIT0 = 1 << 3;
        #[doc(hidden)]
        const MT_BIT1 = 1 << 4;
        #[doc(hidden)]
        const MT_BIT2 = 1 << 5;
        /// Ignore the guest PAT memory type.
        const IGNORE_PAT = 1 << 6;
        /// The entry maps a 2 MiB or 1 GiB page.
        const LARGE = 1 << 7;
        const ACCESSED = 1 << 8;
        const DIRTY = 1 << 9;
        const SUPPRESS_VE = 1 << 63;

        const RWX = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
        /// Uncacheable.
        const MT_UC = 0;
        /// Write back.
        const MT_WB = Self::MT_BIT1.bits | Self::MT_BIT2.bits;
        const MT_MASK = Self::MT_BIT0.bits | Self::MT_BIT1.bits | Self::MT_BIT2.bits;
        /// Bits [`ept_modify_mr`] may change.
        const PROT_MASK = Self::RWX.bits | Self::MT_MASK.bits | Self::IGNORE_PAT.bits;
    }
}

/// Protection of guest RAM.
pub const EPT_RAM: EptFlags = EptFlags::from_bits_truncate(EptFlags::RWX.bits() | EptFlags::MT_WB.bits());
/// Protection of passthrough device memory.
pub const EPT_MMIO: EptFlags =
    EptFlags::from_bits_truncate(EptFlags::READ.bits() | EptFlags::WRITE.bits() | EptFlags::MT_UC.bits());

#[inline]
const fn shift(level: usize) -> u32 {
    12 + 9 * level as u32
}

#[inline]
const fn entry_size(level: usize) -> u64 {
    1 << shift(level)
}

#[inline]
const fn index(gpa: u64, level: usize) -> usize {
    ((gpa >> shift(level)) as usize) & (ENTRIES - 1)
}

#[inline]
fn is_present(e: u64) -> bool {
    e & EptFlags::RWX.bits() != 0
}

#[inline]
fn is_leaf(e: u64, level: usize) -> bool {
    level == 0 || e & EptFlags::LARGE.bits() != 0
}

// Make the table align to 4096.
#[repr(C, align(4096))]
struct Table([AtomicU64; ENTRIES]);

impl Table {
    fn new() -> Box<Self> {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Box::new(Self([ZERO; ENTRIES]))
    }

    fn pa(&self) -> Pa {
        Va::of(self).into_pa()
    }

    fn is_empty(&self) -> bool {
        self.0.iter().all(|e| e.load(Ordering::Acquire) == 0)
    }
}

/// The table an intermediate entry points to.
///
/// # Safety
/// `e` must be a present non-leaf entry written by this module.
unsafe fn child<'a>(e: u64) -> Option<&'a Table> {
    Pa::new((e & ADDR_MASK) as usize).and_then(|pa| pa.into_va().as_ref::<Table>())
}

/// A mapped leaf, as found by a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub hpa: u64,
    /// Size of the leaf page.
    pub page_size: u64,
    pub flags: EptFlags,
}

/// Second level page table that holds guest-physical to host-physical mapping.
pub struct Ept {
    root: Box<Table>,
    tables: AtomicUsize,
    huge_1g: bool,
}

impl Ept {
    /// An empty table. `huge_1g` allows 1 GiB leaves.
    pub fn new(huge_1g: bool) -> Self {
        Self {
            root: Table::new(),
            tables: AtomicUsize::new(1),
            huge_1g,
        }
    }

    /// Physical address of the PML4 page.
    pub fn root_pa(&self) -> Pa {
        self.root.pa()
    }

    /// EPT pointer: write-back paging structures, 4-level walk.
    pub fn eptp(&self) -> u64 {
        self.root_pa().into_usize() as u64 | (3 << 3) | 6
    }

    /// Number of pages used by the table itself, root included.
    pub fn table_count(&self) -> usize {
        self.tables.load(Ordering::Relaxed)
    }

    fn leaf_allowed(&self, level: usize) -> bool {
        match level {
            0 | 1 => true,
            2 => self.huge_1g,
            _ => false,
        }
    }

    fn alloc_table(&self) -> u64 {
        let table = Box::leak(Table::new());
        self.tables.fetch_add(1, Ordering::Relaxed);
        table.pa().into_usize() as u64 | EptFlags::RWX.bits()
    }

    /// # Safety
    /// `e` must point to a table allocated by [`Ept::alloc_table`] that is no
    /// longer referenced.
    unsafe fn free_table(&self, e: u64) {
        if let Some(t) = child(e) {
            drop(Box::from_raw(t as *const Table as *mut Table));
            self.tables.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn check_range(gpa: u64, size: u64) -> Result<u64, EptError> {
        if gpa & PAGE_MASK as u64 != 0 || size & PAGE_MASK as u64 != 0 {
            return Err(EptError::Unaligned);
        }
        match gpa.checked_add(size) {
            Some(end) if end <= MAX_GPA => Ok(end),
            _ => Err(EptError::OutOfRange),
        }
    }

    /// Visit every present leaf intersecting `[gpa, end)` as
    /// `(entry, leaf_gpa, leaf_size)`.
    fn for_each_leaf(
        &self,
        table: &Table,
        level: usize,
        base: u64,
        gpa: u64,
        end: u64,
        f: &mut dyn FnMut(&AtomicU64, u64, u64),
    ) {
        let size = entry_size(level);
        let mut cur = gpa;
        while cur < end {
            let idx = index(cur, level);
            let entry_gpa = base + idx as u64 * size;
            let next = (entry_gpa + size).min(end);
            let slot = &table.0[idx];
            let e = slot.load(Ordering::Acquire);
            if is_present(e) {
                if is_leaf(e, level) {
                    f(slot, entry_gpa, size);
                } else if let Some(t) = unsafe { child(e) } {
                    self.for_each_leaf(t, level - 1, entry_gpa, cur, next, f);
                }
            }
            cur = next;
        }
    }

    fn map_range(
        &self,
        table: &Table,
        level: usize,
        mut gpa: u64,
        mut hpa: u64,
        end: u64,
        prot: EptFlags,
    ) -> Result<(), EptError> {
        let size = entry_size(level);
        while gpa < end {
            let slot = &table.0[index(gpa, level)];
            let next = ((gpa & !(size - 1)) + size).min(end);
            let e = slot.load(Ordering::Acquire);
            let fits = gpa & (size - 1) == 0 && hpa & (size - 1) == 0 && end - gpa >= size;
            if !is_present(e) && fits && self.leaf_allowed(level) {
                let large = if level == 0 { 0 } else { EptFlags::LARGE.bits() };
                slot.store(hpa | prot.bits() | large, Ordering::Release);
            } else {
                if is_present(e) && is_leaf(e, level) {
                    return Err(EptError::Duplicated);
                }
                let e = if is_present(e) {
                    e
                } else {
                    let e = self.alloc_table();
                    slot.store(e, Ordering::Release);
                    e
                };
                let t = unsafe { child(e) }.ok_or(EptError::NotExist)?;
                self.map_range(t, level - 1, gpa, hpa, next, prot)?;
            }
            hpa += next - gpa;
            gpa = next;
        }
        Ok(())
    }

    /// Make sure no leaf straddles `addr`.
    fn split_at(&self, addr: u64) {
        if addr >= MAX_GPA {
            return;
        }
        let mut table: &Table = &self.root;
        for level in (1..LEVELS).rev() {
            let slot = &table.0[index(addr, level)];
            let e = slot.load(Ordering::Acquire);
            if !is_present(e) {
                return;
            }
            if is_leaf(e, level) {
                let size = entry_size(level);
                if addr & (size - 1) == 0 {
                    return;
                }
                // Re-express the leaf with 512 smaller ones of the same type.
                let new = self.alloc_table();
                let Some(t) = (unsafe { child(new) }) else {
                    return;
                };
                let sub = entry_size(level - 1);
                let large = if level - 1 == 0 { 0 } else { EptFlags::LARGE.bits() };
                let keep = e & !(ADDR_MASK | EptFlags::LARGE.bits());
                let hpa = e & ADDR_MASK & !(size - 1);
                for (i, s) in t.0.iter().enumerate() {
                    s.store((hpa + i as u64 * sub) | keep | large, Ordering::Relaxed);
                }
                slot.store(new, Ordering::Release);
            }
            match unsafe { child(slot.load(Ordering::Acquire)) } {
                Some(t) => table = t,
                None => return,
            }
        }
    }

    /// Returns whether the table became empty.
    fn unmap_range(&self, table: &Table, level: usize, base: u64, gpa: u64, end: u64) -> bool {
        let size = entry_size(level);
        let mut cur = gpa;
        while cur < end {
            let idx = index(cur, level);
            let entry_gpa = base + idx as u64 * size;
            let next = (entry_gpa + size).min(end);
            let slot = &table.0[idx];
            let e = slot.load(Ordering::Acquire);
            if e != 0 {
                if is_leaf(e, level) || !is_present(e) {
                    // Boundaries were split beforehand, so the leaf is inside.
                    slot.store(0, Ordering::Release);
                } else if let Some(t) = unsafe { child(e) } {
                    if self.unmap_range(t, level - 1, entry_gpa, cur, next) {
                        slot.store(0, Ordering::Release);
                        unsafe { self.free_table(e) };
                    }
                }
            }
            cur = next;
        }
        table.is_empty()
    }

    /// Map `[gpa, gpa + size)` onto `[hpa, hpa + size)`.
    ///
    /// The largest page size whose alignment both addresses satisfy is used at
    /// every step. Mapping over an existing mapping fails with
    /// [`EptError::Duplicated`] without changing the table.
    pub fn add_mr(&mut self, hpa: u64, gpa: u64, size: u64, prot: EptFlags) -> Result<(), EptError> {
        let end = Self::check_range(gpa, size)?;
        if hpa & PAGE_MASK as u64 != 0 {
            return Err(EptError::Unaligned);
        }
        if hpa.checked_add(size).map_or(true, |e| e > INVALID_HPA) {
            return Err(EptError::OutOfRange);
        }
        if self.is_mapped(gpa, size) {
            return Err(EptError::Duplicated);
        }
        self.map_range(&self.root, LEVELS - 1, gpa, hpa, end, prot & EptFlags::PROT_MASK)
    }

    /// Whether any page of the range is mapped.
    pub fn is_mapped(&self, gpa: u64, size: u64) -> bool {
        let mut found = false;
        self.for_each_leaf(&self.root, LEVELS - 1, 0, gpa, gpa.saturating_add(size).min(MAX_GPA), &mut |_, _, _| {
            found = true
        });
        found
    }

    /// Whether changing `[gpa, gpa + size)` would need a large leaf split.
    pub fn needs_split(&self, gpa: u64, size: u64) -> bool {
        let end = gpa.saturating_add(size);
        let mut split = false;
        self.for_each_leaf(&self.root, LEVELS - 1, 0, gpa, end.min(MAX_GPA), &mut |_, leaf, sz| {
            split |= leaf < gpa || leaf + sz > end;
        });
        split
    }

    /// Split the large leaves crossing the boundaries of the range.
    pub fn split_range(&mut self, gpa: u64, size: u64) -> Result<(), EptError> {
        let end = Self::check_range(gpa, size)?;
        self.split_at(gpa);
        self.split_at(end);
        Ok(())
    }

    /// Change the protection of every leaf inside `[gpa, gpa + size)`.
    ///
    /// Leaves crossing the range boundaries are left alone; split them first.
    /// Returns the number of leaves changed.
    pub fn modify_leaves(&self, gpa: u64, size: u64, set: EptFlags, clear: EptFlags) -> usize {
        let end = gpa.saturating_add(size);
        let (set, clear) = (set & EptFlags::PROT_MASK, clear & EptFlags::PROT_MASK);
        let mut n = 0;
        self.for_each_leaf(&self.root, LEVELS - 1, 0, gpa, end.min(MAX_GPA), &mut |slot, leaf, sz| {
            if leaf >= gpa && leaf + sz <= end {
                let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| {
                    Some((e & !clear.bits()) | set.bits())
                });
                n += 1;
            }
        });
        n
    }

    /// Remove every mapping inside `[gpa, gpa + size)` and free the tables
    /// that become empty. Removing an unmapped range is a no-op.
    pub fn del_mr(&mut self, gpa: u64, size: u64) -> Result<(), EptError> {
        let end = Self::check_range(gpa, size)?;
        self.split_at(gpa);
        self.split_at(end);
        self.unmap_range(&self.root, LEVELS - 1, 0, gpa, end);
        Ok(())
    }

    /// Invoke `cb(entry, page_size)` on every leaf.
    pub fn walk(&self, cb: &mut dyn FnMut(&AtomicU64, u64)) {
        self.for_each_leaf(&self.root, LEVELS - 1, 0, 0, MAX_GPA, &mut |slot, _, size| cb(slot, size));
    }

    /// Translate `gpa`.
    pub fn translate(&self, gpa: u64) -> Option<Translation> {
        if gpa >= MAX_GPA {
            return None;
        }
        let mut table: &Table = &self.root;
        for level in (0..LEVELS).rev() {
            let e = table.0[index(gpa, level)].load(Ordering::Acquire);
            if !is_present(e) {
                return None;
            }
            if is_leaf(e, level) {
                let size = entry_size(level);
                return Some(Translation {
                    hpa: (e & ADDR_MASK & !(size - 1)) | (gpa & (size - 1)),
                    page_size: size,
                    flags: EptFlags::from_bits_truncate(e),
                });
            }
            table = unsafe { child(e) }?;
        }
        None
    }

    fn free_all(&self, table: &Table, level: usize) {
        if level == 0 {
            return;
        }
        for slot in table.0.iter() {
            let e = slot.swap(0, Ordering::AcqRel);
            if is_present(e) && !is_leaf(e, level) {
                if let Some(t) = unsafe { child(e) } {
                    self.free_all(t, level - 1);
                }
                unsafe { self.free_table(e) };
            }
        }
    }

    /// Drop every mapping and every table but the root.
    pub fn destroy(&mut self) {
        self.free_all(&self.root, LEVELS - 1);
    }
}

impl Drop for Ept {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn request_flush(vm: &Vm) {
    for vcpu in vm.vcpus() {
        vcpu.make_request(VCpuRequest::EPT_FLUSH);
    }
}

/// Map `[gpa, gpa + size)` of `vm` onto `[hpa, hpa + size)`.
pub fn ept_add_mr(vm: &Vm, hpa: u64, gpa: u64, size: u64, prot: EptFlags) -> Result<(), EptError> {
    vm.ept.write().add_mr(hpa, gpa, size, prot)?;
    request_flush(vm);
    Ok(())
}

/// Change protection and memory type bits of a mapped range.
///
/// Runs under the shared lock unless a large leaf must be split first.
pub fn ept_modify_mr(vm: &Vm, gpa: u64, size: u64, set: EptFlags, clear: EptFlags) -> Result<(), EptError> {
    Ept::check_range(gpa, size)?;
    {
        let ept = vm.ept.read();
        if !ept.needs_split(gpa, size) {
            ept.modify_leaves(gpa, size, set, clear);
            drop(ept);
            request_flush(vm);
            return Ok(());
        }
    }
    let mut ept = vm.ept.write();
    ept.split_range(gpa, size)?;
    ept.modify_leaves(gpa, size, set, clear);
    drop(ept);
    request_flush(vm);
    Ok(())
}

/// Unmap `[gpa, gpa + size)` of `vm`.
pub fn ept_del_mr(vm: &Vm, gpa: u64, size: u64) -> Result<(), EptError> {
    vm.ept.write().del_mr(gpa, size)?;
    request_flush(vm);
    Ok(())
}

/// Invoke `cb(entry, page_size)` on every leaf of `vm`'s table.
pub fn walk_ept_table(vm: &Vm, cb: &mut dyn FnMut(&AtomicU64, u64)) {
    vm.ept.read().walk(cb)
}

/// Host physical address backing `gpa`, [`INVALID_HPA`] when unmapped.
pub fn gpa2hpa(vm: &Vm, gpa: u64) -> u64 {
    vm.ept
        .read()
        .translate(gpa)
        .map_or(INVALID_HPA, |t| t.hpa)
}

/// Hypervisor virtual address backing `gpa`.
pub fn gpa2hva(vm: &Vm, gpa: u64) -> Option<Va> {
    match gpa2hpa(vm, gpa) {
        INVALID_HPA => None,
        hpa => Pa::new(hpa as usize).map(Pa::into_va),
    }
}
