//! Physical memory map of the host.

use crate::addressing::{Pa, PAGE_SIZE};
use alloc::vec::Vec;
use core::ops::Range;

/// E820 region types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u32)]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
    AcpiReclaim = 3,
    AcpiNvs = 4,
    Unusable = 5,
}

impl E820Type {
    /// Firmware reports unknown types; they are treated as reserved.
    pub fn from_raw(ty: u32) -> Self {
        Self::try_from(ty).unwrap_or(Self::Reserved)
    }
}

/// One entry of an E820 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct E820Entry {
    pub base_addr: u64,
    pub length: u64,
    pub ty: u32,
}

impl E820Entry {
    /// Create a new entry.
    pub const fn new(base_addr: u64, length: u64, ty: E820Type) -> Self {
        Self {
            base_addr,
            length,
            ty: ty as u32,
        }
    }

    /// Type of this entry.
    pub fn kind(&self) -> E820Type {
        E820Type::from_raw(self.ty)
    }

    /// Address range covered by the entry.
    pub fn range(&self) -> Range<u64> {
        let (base, len) = (self.base_addr, self.length);
        base..base.saturating_add(len)
    }
}

/// Sorted, merged E820 map of the host.
#[derive(Debug, Clone, Default)]
pub struct HostE820 {
    entries: Vec<E820Entry>,
}

impl HostE820 {
    /// Build the table from raw firmware entries.
    ///
    /// Entries are sorted by address and adjacent entries of the same type are
    /// merged. Empty entries are dropped.
    pub fn new(raw: impl IntoIterator<Item = E820Entry>) -> Self {
        let mut entries: Vec<E820Entry> = raw.into_iter().filter(|e| e.length != 0).collect();
        entries.sort_unstable_by_key(|e| e.base_addr);

        let mut merged: Vec<E820Entry> = Vec::with_capacity(entries.len());
        for en in entries {
            match merged.last_mut() {
                Some(last) if last.range().end == en.base_addr && last.kind() == en.kind() => {
                    last.length = last.length + en.length;
                }
                _ => merged.push(en),
            }
        }
        Self { entries: merged }
    }

    /// Entries of the table.
    pub fn entries(&self) -> &[E820Entry] {
        &self.entries
    }

    /// Total bytes of usable RAM.
    pub fn total_ram(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind() == E820Type::Ram)
            .map(|e| e.length)
            .sum()
    }

    /// Whether `[start, start + size)` lies entirely in usable RAM.
    pub fn is_ram(&self, start: u64, size: u64) -> bool {
        let end = match start.checked_add(size) {
            Some(end) => end,
            None => return false,
        };
        let mut cursor = start;
        for en in self.entries.iter().filter(|e| e.kind() == E820Type::Ram) {
            let r = en.range();
            if r.start <= cursor && cursor < r.end {
                cursor = r.end;
            }
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }

    /// Carve `size` bytes of RAM ending below `limit` out of the map and mark
    /// them reserved.
    ///
    /// The highest fitting, `align`ed address is chosen. Returns the start of
    /// the reserved block.
    pub fn alloc_below(&mut self, size: u64, align: u64, limit: u64) -> Option<Pa> {
        let align = align.max(PAGE_SIZE as u64);
        let idx = (0..self.entries.len()).rev().find(|&i| {
            let e = self.entries[i];
            let r = e.range();
            e.kind() == E820Type::Ram
                && r.start < limit
                && r.end.min(limit).checked_sub(size).map_or(false, |top| {
                    (top & !(align - 1)) >= r.start
                })
        })?;

        let en = self.entries[idx];
        let r = en.range();
        let start = (r.end.min(limit) - size) & !(align - 1);
        let end = start + size;

        let mut replacement: Vec<E820Entry> = Vec::with_capacity(3);
        if start > r.start {
            replacement.push(E820Entry::new(r.start, start - r.start, E820Type::Ram));
        }
        replacement.push(E820Entry::new(start, size, E820Type::Reserved));
        if end < r.end {
            replacement.push(E820Entry::new(end, r.end - end, E820Type::Ram));
        }
        self.entries.splice(idx..=idx, replacement);
        Pa::new(start as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HostE820 {
        HostE820::new([
            E820Entry::new(0x10_0000, 0x7ff0_0000, E820Type::Ram),
            E820Entry::new(0, 0x9_f000, E820Type::Ram),
            E820Entry::new(0x9_f000, 0x1000, E820Type::Reserved),
            E820Entry::new(0xf_0000, 0x1_0000, E820Type::Reserved),
            E820Entry::new(0x8000_0000, 0x8000_0000, E820Type::Ram),
        ])
    }

    #[test]
    fn sorted_and_merged() {
        let e820 = sample();
        let bases: Vec<u64> = e820.entries().iter().map(|e| e.base_addr).collect();
        assert_eq!(bases, [0, 0x9_f000, 0xf_0000, 0x10_0000]);
        let last = e820.entries()[3];
        assert_eq!({ last.length }, 0xfff0_0000);
        assert_eq!(e820.total_ram(), 0x9_f000 + 0xfff0_0000);
    }

    #[test]
    fn ram_coverage() {
        let e820 = sample();
        assert!(e820.is_ram(0x1000_0000, 0x2000_0000));
        assert!(!e820.is_ram(0x9_e000, 0x2000));
        assert!(!e820.is_ram(0xffff_0000, 0x2_0000));
    }

    #[test]
    fn trampoline_below_1m() {
        let mut e820 = sample();
        let pa = e820.alloc_below(0x2000, 0x1000, 0x10_0000).unwrap();
        assert_eq!(pa.into_usize(), 0x9_d000);
        assert!(!e820.is_ram(0x9_d000, 0x1000));
        assert!(e820.is_ram(0, 0x9_d000));
        assert_eq!(e820.total_ram(), 0x9_f000 - 0x2000 + 0xfff0_0000);
    }

    #[test]
    fn alloc_fails_without_room() {
        let mut e820 = HostE820::new([E820Entry::new(0x10_0000, 0x1000_0000, E820Type::Ram)]);
        assert!(e820.alloc_below(0x1000, 0x1000, 0x10_0000).is_none());
    }
}
