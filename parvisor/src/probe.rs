//! Access to guest memory.
//!
//! Guest physical memory is reached by translating through the EPT of the VM
//! and then touching host physical memory through the platform. Guest virtual
//! addresses are first walked through the guest page tables of the current
//! vCPU.

use crate::{
    ept::INVALID_HPA,
    hv::Hypervisor,
    vcpu::VCpuContext,
    vcr::{guest_cr0, guest_cr4},
    vm::{Gpa, Vm},
    Errno, VmError,
};
use abyss::{
    addressing::{Pa, Va, PAGE_MASK, PAGE_SIZE},
    x86_64::{Cr0, Cr4, Efer},
};

/// Traits to probe guest memory.
pub trait Probe {
    /// Translate guest physical address to host physical address
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa>;
    /// Translate guest physical address to host virtual address
    #[inline]
    fn gpa2hva(&self, gpa: Gpa) -> Option<Va> {
        self.gpa2hpa(gpa).map(|pa| pa.into_va())
    }
}

impl Probe for Vm {
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa> {
        match crate::ept::gpa2hpa(self, gpa.into_usize() as u64) {
            INVALID_HPA => None,
            hpa => Pa::new(hpa as usize),
        }
    }
}

/// Why a guest memory access could not be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// The guest page walk faults; the guest expects a #PF.
    PageFault { addr: u64, error_code: u32 },
    /// The guest physical address is not backed.
    Unmapped(u64),
    /// Legacy PAE paging without IA-32e mode.
    UnsupportedMode,
    Vm(VmError),
}

impl From<VmError> for ProbeError {
    fn from(e: VmError) -> Self {
        Self::Vm(e)
    }
}

impl From<ProbeError> for Errno {
    fn from(_: ProbeError) -> Self {
        Errno::EFAULT
    }
}

/// Kind of access a translation is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Fetch,
}

// Page fault error code bits.
const PFEC_P: u32 = 1 << 0;
const PFEC_W: u32 = 1 << 1;
const PFEC_U: u32 = 1 << 2;
const PFEC_I: u32 = 1 << 4;

// Paging structure entry bits.
const PTE_P: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;
const PTE_PS: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Walk `len` bytes of guest physical memory one host page at a time.
fn for_each_chunk(
    vm: &Vm,
    gpa: u64,
    len: usize,
    mut f: impl FnMut(Pa, usize, usize),
) -> Result<(), ProbeError> {
    let mut done = 0;
    while done < len {
        let cur = gpa + done as u64;
        let n = (PAGE_SIZE - (cur as usize & PAGE_MASK)).min(len - done);
        let hpa = match crate::ept::gpa2hpa(vm, cur) {
            INVALID_HPA => None,
            hpa => Pa::new(hpa as usize),
        }
        .ok_or(ProbeError::Unmapped(cur))?;
        f(hpa, done, n);
        done += n;
    }
    Ok(())
}

/// Copy guest physical memory at `gpa` into `buf`.
pub fn copy_from_gpa(hv: &Hypervisor, vm: &Vm, buf: &mut [u8], gpa: u64) -> Result<(), ProbeError> {
    for_each_chunk(vm, gpa, buf.len(), |hpa, off, n| unsafe {
        hv.platform.phys_read(hpa, &mut buf[off..off + n])
    })
}

/// Copy `data` to guest physical memory at `gpa`.
pub fn copy_to_gpa(hv: &Hypervisor, vm: &Vm, data: &[u8], gpa: u64) -> Result<(), ProbeError> {
    for_each_chunk(vm, gpa, data.len(), |hpa, off, n| unsafe {
        hv.platform.phys_write(hpa, &data[off..off + n])
    })
}

fn read_entry(ctx: &VCpuContext, gpa: u64, wide: bool) -> Result<u64, ProbeError> {
    let mut b = [0; 8];
    let n = if wide { 8 } else { 4 };
    copy_from_gpa(ctx.hv, ctx.vm, &mut b[..n], gpa)?;
    Ok(u64::from_le_bytes(b))
}

/// Translate `gva` through the page tables of the guest.
///
/// Supports paging off, 32-bit paging (with 4 MiB pages) and 4- or 5-level
/// paging in IA-32e mode. Accessed and dirty bits are not updated.
pub fn gva2gpa(ctx: &mut VCpuContext, gva: u64, access: Access) -> Result<u64, ProbeError> {
    let cr0 = Cr0::from_bits_truncate(guest_cr0(ctx)?);
    if !cr0.contains(Cr0::PG) {
        return Ok(gva);
    }
    let cr4 = Cr4::from_bits_truncate(guest_cr4(ctx)?);
    let efer = Efer::from_bits_truncate(ctx.efer()?);
    let user = ctx.cpl()? == 3;
    let cr3 = ctx.cr3()?;

    let (levels, bits, wide) = if efer.contains(Efer::LMA) {
        (if cr4.contains(Cr4::LA57) { 5 } else { 4 }, 9, true)
    } else if cr4.contains(Cr4::PAE) {
        return Err(ProbeError::UnsupportedMode);
    } else {
        (2, 10, false)
    };
    let entry_size = if wide { 8 } else { 4 };
    let addr_mask = if wide { PTE_ADDR_MASK } else { 0xffff_f000 };

    let mut fault = match access {
        Access::Write => PFEC_W,
        Access::Fetch if efer.contains(Efer::NXE) => PFEC_I,
        _ => 0,
    };
    if user {
        fault |= PFEC_U;
    }

    let mut table = cr3 & addr_mask;
    let (mut rw, mut us, mut nx) = (true, true, false);
    for level in (0..levels).rev() {
        let shift = 12 + bits * level;
        let idx = (gva >> shift) & ((1 << bits) - 1);
        let e = read_entry(ctx, table + idx * entry_size, wide)?;
        if e & PTE_P == 0 {
            return Err(ProbeError::PageFault {
                addr: gva,
                error_code: fault,
            });
        }
        rw &= e & PTE_RW != 0;
        us &= e & PTE_US != 0;
        nx |= wide && e & PTE_NX != 0;

        let large = level > 0 && e & PTE_PS != 0 && (wide || cr4.contains(Cr4::PSE));
        if level == 0 || large {
            let denied = match access {
                Access::Write => !rw && (user || cr0.contains(Cr0::WP)),
                Access::Fetch => nx && efer.contains(Efer::NXE),
                Access::Read => false,
            } || (user && !us);
            if denied {
                return Err(ProbeError::PageFault {
                    addr: gva,
                    error_code: fault | PFEC_P,
                });
            }
            let page = 1u64 << shift;
            let base = if !wide && large {
                // PSE-36: bits 20:13 hold physical address bits 39:32.
                (e & 0xffc0_0000) | ((e >> 13) & 0xff) << 32
            } else {
                e & addr_mask & !(page - 1)
            };
            return Ok(base | (gva & (page - 1)));
        }
        table = e & addr_mask;
    }
    Err(ProbeError::UnsupportedMode)
}

/// Copy guest virtual memory at `gva` into `buf`.
pub fn copy_from_gva(
    ctx: &mut VCpuContext,
    buf: &mut [u8],
    gva: u64,
    access: Access,
) -> Result<(), ProbeError> {
    let mut done = 0;
    while done < buf.len() {
        let cur = gva.wrapping_add(done as u64);
        let n = (PAGE_SIZE - (cur as usize & PAGE_MASK)).min(buf.len() - done);
        let gpa = gva2gpa(ctx, cur, access)?;
        copy_from_gpa(ctx.hv, ctx.vm, &mut buf[done..done + n], gpa)?;
        done += n;
    }
    Ok(())
}

/// Copy `data` to guest virtual memory at `gva`.
pub fn copy_to_gva(ctx: &mut VCpuContext, data: &[u8], gva: u64) -> Result<(), ProbeError> {
    let mut done = 0;
    while done < data.len() {
        let cur = gva.wrapping_add(done as u64);
        let n = (PAGE_SIZE - (cur as usize & PAGE_MASK)).min(data.len() - done);
        let gpa = gva2gpa(ctx, cur, Access::Write)?;
        copy_to_gpa(ctx.hv, ctx.vm, &data[done..done + n], gpa)?;
        done += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::Harness, vmx::vmcs::Field};

    fn put(h: &Harness, vm: &Vm, gpa: u64, v: u64) {
        copy_to_gpa(&h.hv, vm, &v.to_le_bytes(), gpa).unwrap();
    }

    #[test]
    fn gpa_copies_cross_pages() {
        let h = Harness::new();
        let vm = h.vm(1);
        copy_to_gpa(&h.hv, &vm, b"parvisor", 0x1ffc).unwrap();
        let mut buf = [0; 8];
        copy_from_gpa(&h.hv, &vm, &mut buf, 0x1ffc).unwrap();
        assert_eq!(&buf, b"parvisor");
        // Window base plus offset on the host side.
        assert!(h.p.page_touched(Pa::new(0x1_2000_2000).unwrap()));
        assert_eq!(
            vm.gpa2hpa(Gpa::new(0x1ffc).unwrap()),
            Pa::new(0x1_2000_1ffc)
        );
        assert_eq!(
            copy_from_gpa(&h.hv, &vm, &mut buf, 256 << 20),
            Err(ProbeError::Unmapped(256 << 20))
        );
    }

    #[test]
    fn long_mode_walk() {
        let h = Harness::new();
        let vm = h.vm(1);
        // PML4 at 0x10000 -> PDPT 0x11000 -> PD 0x12000 -> PT 0x13000.
        put(&h, &vm, 0x10000, 0x11000 | PTE_P | PTE_RW);
        put(&h, &vm, 0x11000, 0x12000 | PTE_P | PTE_RW);
        put(&h, &vm, 0x12000, 0x13000 | PTE_P | PTE_RW);
        put(&h, &vm, 0x12008, 0x40_0000 | PTE_P | PTE_PS);
        put(&h, &vm, 0x13008, 0x5000 | PTE_P);
        h.with_vcpu(&vm, 0, |ctx| {
            let cr0 = (Cr0::PE | Cr0::PG | Cr0::WP).bits();
            ctx.vmcs.write(Field::Cr0ReadShadow, cr0).unwrap();
            // WP is not in the guest/host mask: the real CR0 carries it.
            ctx.set_cr0(cr0);
            ctx.vmcs.write(Field::Cr4ReadShadow, Cr4::PAE.bits()).unwrap();
            ctx.set_efer((Efer::LME | Efer::LMA).bits());
            ctx.set_cr3(0x10000);

            assert_eq!(gva2gpa(ctx, 0x1234, Access::Read), Ok(0x5234));
            assert_eq!(gva2gpa(ctx, 0x20_1234, Access::Write), Ok(0x40_1234));
            assert_eq!(
                gva2gpa(ctx, 0x1234, Access::Write),
                Err(ProbeError::PageFault {
                    addr: 0x1234,
                    error_code: PFEC_W | PFEC_P
                })
            );
            assert_eq!(
                gva2gpa(ctx, 0x3000, Access::Read),
                Err(ProbeError::PageFault {
                    addr: 0x3000,
                    error_code: 0
                })
            );

            copy_to_gpa(ctx.hv, ctx.vm, b"hello", 0x5ffe).unwrap();
            put(&h, &vm, 0x13010, 0x6000 | PTE_P);
            let mut buf = [0; 5];
            copy_from_gva(ctx, &mut buf, 0x1ffe, Access::Read).unwrap();
            assert_eq!(&buf, b"hello");
        });
    }

    #[test]
    fn paging_off_and_legacy_pae() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.vmcs.write(Field::Cr0ReadShadow, Cr0::PE.bits()).unwrap();
            assert_eq!(gva2gpa(ctx, 0xb8000, Access::Write), Ok(0xb8000));
            ctx.vmcs
                .write(Field::Cr0ReadShadow, (Cr0::PE | Cr0::PG).bits())
                .unwrap();
            ctx.vmcs.write(Field::Cr4ReadShadow, Cr4::PAE.bits()).unwrap();
            assert_eq!(
                gva2gpa(ctx, 0xb8000, Access::Read),
                Err(ProbeError::UnsupportedMode)
            );
        });
    }
}
