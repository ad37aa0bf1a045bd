//! Virtual E820 of pre-launched VMs.
//!
//! Every pre-launched VM sees the same three-entry layout:
//!
//! | range                         | type     |
//! |-------------------------------|----------|
//! | `[0, 960K)`                   | RAM      |
//! | `[960K, 1M)`                  | reserved (ACPI tables) |
//! | `[1M, 1M + (size - 1M))`      | RAM      |

use crate::config::MemoryConfig;
use abyss::{
    addressing::MEM_1M,
    boot::e820::{E820Entry, E820Type},
};

/// Start of the reserved hole holding the guest ACPI tables.
pub const VM_ACPI_BASE: u64 = 0xf_0000;
/// Number of entries of a pre-launched VM's E820.
pub const PRELAUNCHED_E820_ENTRIES: usize = 3;

/// Build the E820 of a pre-launched VM owning `mem`.
///
/// The memory window must be at least 1 MiB; this is checked by
/// [`crate::config::sanitize_vm_configs`].
pub fn create_prelaunched_vm_e820(mem: &MemoryConfig) -> [E820Entry; PRELAUNCHED_E820_ENTRIES] {
    let one_mb = MEM_1M as u64;
    [
        E820Entry::new(0, VM_ACPI_BASE, E820Type::Ram),
        E820Entry::new(VM_ACPI_BASE, one_mb - VM_ACPI_BASE, E820Type::Reserved),
        E820Entry::new(one_mb, mem.size.saturating_sub(one_mb), E820Type::Ram),
    ]
}

/// Serialize `entries` in the boot protocol layout (20 bytes each).
pub fn encode(entries: &[E820Entry], out: &mut [u8]) -> usize {
    let mut n = 0;
    for (en, dst) in entries.iter().zip(out.chunks_exact_mut(20)) {
        dst[0..8].copy_from_slice(&{ en.base_addr }.to_le_bytes());
        dst[8..16].copy_from_slice(&{ en.length }.to_le_bytes());
        dst[16..20].copy_from_slice(&{ en.ty }.to_le_bytes());
        n += 1;
    }
    n
}

/// Total bytes of guest RAM described by `entries`.
pub fn guest_ram(entries: &[E820Entry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.kind() == E820Type::Ram)
        .map(|e| e.length)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_entry_layout() {
        let mem = MemoryConfig {
            start_hpa: 0x1_0000_0000,
            size: 512 << 20,
        };
        let e820 = create_prelaunched_vm_e820(&mem);
        assert_eq!(e820.len(), 3);
        let kinds: [E820Type; 3] = [e820[0].kind(), e820[1].kind(), e820[2].kind()];
        assert_eq!(kinds, [E820Type::Ram, E820Type::Reserved, E820Type::Ram]);
        assert_eq!({ e820[0].length }, 960 << 10);
        assert_eq!(e820[1].range(), 0xf_0000..0x10_0000);
        assert_eq!({ e820[2].base_addr }, 0x10_0000);
        assert_eq!({ e820[2].length }, 511 << 20);
        assert_eq!(guest_ram(&e820), (960 << 10) + (511 << 20));
    }

    #[test]
    fn boot_protocol_encoding() {
        let mem = MemoryConfig {
            start_hpa: 0,
            size: 2 << 20,
        };
        let mut out = [0u8; 80];
        assert_eq!(encode(&create_prelaunched_vm_e820(&mem), &mut out), 3);
        assert_eq!(&out[20..28], &0xf_0000u64.to_le_bytes());
        assert_eq!(&out[36..40], &2u32.to_le_bytes());
        assert_eq!(&out[60..], &[0; 20]);
    }
}
