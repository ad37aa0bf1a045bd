//! Control register virtualization.
//!
//! CR0 and CR4 bits in the guest/host masks are owned by the hypervisor:
//! guest writes to them exit, the value the guest wrote goes to the read
//! shadow and a value acceptable to VMX goes to the real register. CR8 is
//! the TPR of the vLAPIC.

use crate::{
    vcpu::VCpuContext,
    virq::inject_gp,
    vmx::{
        control::VmcsEntryCtl,
        setup::{CR0_GUEST_HOST_MASK, CR4_GUEST_HOST_MASK},
        vmcs::{CrAccessQualification, CrAccessType, Field},
    },
    VmError,
};
use abyss::x86_64::{Cr0, Cr4, Efer};

/// Bits the guest CR4 must keep clear: VMX and SMX belong to the host.
const CR4_DENIED: Cr4 = Cr4::from_bits_truncate(Cr4::VMXE.bits() | Cr4::SMXE.bits());

/// The CR0 the guest believes it has.
pub fn guest_cr0(ctx: &mut VCpuContext) -> Result<u64, VmError> {
    let real = ctx.cr0()?;
    let shadow = ctx.vmcs.read(Field::Cr0ReadShadow)?;
    Ok((real & !CR0_GUEST_HOST_MASK) | (shadow & CR0_GUEST_HOST_MASK))
}

/// The CR4 the guest believes it has.
pub fn guest_cr4(ctx: &mut VCpuContext) -> Result<u64, VmError> {
    let real = ctx.cr4()?;
    let shadow = ctx.vmcs.read(Field::Cr4ReadShadow)?;
    Ok((real & !CR4_GUEST_HOST_MASK) | (shadow & CR4_GUEST_HOST_MASK))
}

/// Emulate a guest write of `val` to CR0. Returns `false` if the write
/// faults.
pub fn write_cr0(ctx: &mut VCpuContext, val: u64) -> Result<bool, VmError> {
    let Some(new) = Cr0::from_bits(val) else {
        return Ok(false);
    };
    if (new.contains(Cr0::PG) && !new.contains(Cr0::PE))
        || (new.contains(Cr0::NW) && !new.contains(Cr0::CD))
    {
        return Ok(false);
    }

    let old = Cr0::from_bits_truncate(guest_cr0(ctx)?);
    let efer = Efer::from_bits_truncate(ctx.efer()?);
    if new.contains(Cr0::PG) && !old.contains(Cr0::PG) && efer.contains(Efer::LME) {
        // Entering IA-32e mode.
        if guest_cr4(ctx)? & Cr4::PAE.bits() == 0 {
            return Ok(false);
        }
        ctx.set_efer((efer | Efer::LMA).bits());
        ctx.vmcs
            .set_bits(Field::VmentryControls, VmcsEntryCtl::IA32E_MODE_GUEST.bits())?;
    } else if !new.contains(Cr0::PG) && old.contains(Cr0::PG) && efer.contains(Efer::LMA) {
        ctx.set_efer((efer - Efer::LMA).bits());
        ctx.vmcs
            .clear_bits(Field::VmentryControls, VmcsEntryCtl::IA32E_MODE_GUEST.bits())?;
    }

    // Caching stays enabled on the hardware; memory types come from EPT.
    let real = (new | Cr0::NE | Cr0::ET) - (Cr0::CD | Cr0::NW);
    ctx.set_cr0(real.bits());
    ctx.vmcs.write(Field::Cr0ReadShadow, new.bits())?;
    Ok(true)
}

/// Emulate a guest write of `val` to CR4. Returns `false` if the write
/// faults.
pub fn write_cr4(ctx: &mut VCpuContext, val: u64) -> Result<bool, VmError> {
    let Some(new) = Cr4::from_bits(val) else {
        return Ok(false);
    };
    if new.intersects(CR4_DENIED) {
        return Ok(false);
    }
    let efer = Efer::from_bits_truncate(ctx.efer()?);
    if efer.contains(Efer::LMA) && !new.contains(Cr4::PAE) {
        return Ok(false);
    }
    ctx.set_cr4((new | Cr4::VMXE).bits());
    ctx.vmcs.write(Field::Cr4ReadShadow, new.bits())?;
    Ok(true)
}

/// MOV CR / CLTS / LMSW exit.
pub fn cr_access_vmexit_handler(
    ctx: &mut VCpuContext,
    q: CrAccessQualification,
) -> Result<(), VmError> {
    let gpr = q.gpr as usize;
    let ok = match (q.access_type, q.cr_num) {
        (CrAccessType::MovToCr, 0) => {
            let v = ctx.reg(gpr)?;
            write_cr0(ctx, v)?
        }
        (CrAccessType::MovToCr, 3) => {
            let v = ctx.reg(gpr)?;
            ctx.set_cr3(v);
            true
        }
        (CrAccessType::MovToCr, 4) => {
            let v = ctx.reg(gpr)?;
            write_cr4(ctx, v)?
        }
        (CrAccessType::MovToCr, 8) => {
            let v = ctx.reg(gpr)?;
            if v & !0xf != 0 {
                false
            } else {
                ctx.vcpu.vlapic.set_tpr((v as u8) << 4);
                true
            }
        }
        (CrAccessType::MovFromCr, 3) => {
            let v = ctx.cr3()?;
            ctx.set_reg(gpr, v)?;
            true
        }
        (CrAccessType::MovFromCr, 8) => {
            let v = (ctx.vcpu.vlapic.tpr() >> 4) as u64;
            ctx.set_reg(gpr, v)?;
            true
        }
        (CrAccessType::Clts, _) => {
            let v = guest_cr0(ctx)? & !Cr0::TS.bits();
            write_cr0(ctx, v)?
        }
        (CrAccessType::Lmsw, _) => {
            // LMSW loads PE, MP, EM and TS, and never clears PE.
            let old = guest_cr0(ctx)?;
            let src = q.lmsw_source as u64 & 0xf;
            write_cr0(ctx, (old & !0xe) | src)?
        }
        (ty, cr) => {
            log::error!(
                "cr_access_vmexit_handler: vm{} vcpu{} unexpected {:?} cr{}",
                ctx.vm.vm_id,
                ctx.vcpu.vcpu_id,
                ty,
                cr
            );
            return Err(VmError::VCpuError("unexpected control register access"));
        }
    };
    if !ok {
        log::debug!(
            "vm{} vcpu{}: cr{} write rejected",
            ctx.vm.vm_id,
            ctx.vcpu.vcpu_id,
            q.cr_num
        );
        inject_gp(ctx, 0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::Harness, vcpu::StartupState, vmx::setup::init_vmcs};

    fn mov_to_cr(ctx: &mut VCpuContext, cr: u8, v: u64) {
        ctx.gprs().rbx = v as usize;
        let q = CrAccessQualification::decode((3 << 8) | cr as u64);
        cr_access_vmexit_handler(ctx, q).unwrap();
    }

    #[test]
    fn long_mode_entry() {
        let h = Harness::new();
        let vm = h.vm(0);
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.arch.startup = StartupState::Protected32 { entry: 0x100_0000 };
            init_vmcs(ctx).unwrap();
            // PG with LME but without PAE faults.
            ctx.set_efer(Efer::LME.bits());
            mov_to_cr(ctx, 0, (Cr0::PE | Cr0::ET | Cr0::PG).bits());
            assert_eq!(ctx.arch.exception.take().map(|e| e.vector), Some(13));

            mov_to_cr(ctx, 4, Cr4::PAE.bits());
            assert_eq!(ctx.cr4().unwrap(), (Cr4::PAE | Cr4::VMXE).bits());
            assert_eq!(guest_cr4(ctx).unwrap(), Cr4::PAE.bits());
            mov_to_cr(ctx, 0, (Cr0::PE | Cr0::ET | Cr0::PG | Cr0::CD).bits());
            assert!(ctx.arch.exception.is_none());
            assert_ne!(ctx.efer().unwrap() & Efer::LMA.bits(), 0);
            let entry = ctx.vmcs.read(Field::VmentryControls).unwrap() as u32;
            assert_ne!(entry & VmcsEntryCtl::IA32E_MODE_GUEST.bits(), 0);
            let real = Cr0::from_bits_truncate(ctx.cr0().unwrap());
            assert!(real.contains(Cr0::NE) && !real.contains(Cr0::CD));
            assert!(Cr0::from_bits_truncate(guest_cr0(ctx).unwrap()).contains(Cr0::CD));

            // PAE can not be cleared in IA-32e mode.
            mov_to_cr(ctx, 4, 0);
            assert_eq!(ctx.arch.exception.take().map(|e| e.vector), Some(13));
        });
    }

    #[test]
    fn rejected_values() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            init_vmcs(ctx).unwrap();
            for (cr, v) in [
                (0, Cr0::PG.bits()),
                (0, (Cr0::PE | Cr0::NW).bits()),
                (0, 1 << 40),
                (4, Cr4::VMXE.bits()),
                (4, 1 << 15),
                (8, 0x10),
            ] {
                mov_to_cr(ctx, cr, v);
                assert_eq!(ctx.arch.exception.take().map(|e| e.vector), Some(13), "cr{} {:#x}", cr, v);
            }
        });
    }

    #[test]
    fn cr8_and_clts() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            init_vmcs(ctx).unwrap();
            mov_to_cr(ctx, 8, 0x9);
            assert_eq!(ctx.vcpu.vlapic.tpr(), 0x90);
            // mov rbx, cr8
            let q = CrAccessQualification::decode((3 << 8) | (1 << 4) | 8);
            ctx.gprs().rbx = 0;
            cr_access_vmexit_handler(ctx, q).unwrap();
            assert_eq!(ctx.gprs().rbx, 9);

            mov_to_cr(ctx, 0, (Cr0::PE | Cr0::ET | Cr0::TS).bits());
            cr_access_vmexit_handler(ctx, CrAccessQualification::decode(2 << 4)).unwrap();
            assert_eq!(guest_cr0(ctx).unwrap() & Cr0::TS.bits(), 0);
            assert!(ctx.arch.exception.is_none());
        });
    }
}
