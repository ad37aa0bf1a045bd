//! VM-exit dispatch.
//!
//! [`vmexit_handler`] decodes the exit reason of the current VMCS, runs the
//! handler of that reason and moves RIP past the exiting instruction unless
//! the handler asked to retain it. An `Err` is fatal for the vCPU; the run
//! loop shuts its VM down.

use crate::{
    hypercall::vmcall_vmexit_handler,
    io::{mmio, pio_instr_vmexit_handler},
    vcpu::{StartupState, VCpuContext, VCpuRequest, VCpuState},
    vcpuid::cpuid_vmexit_handler,
    vcr::{cr_access_vmexit_handler, guest_cr4},
    virq::{
        exception_vmexit_handler, external_interrupt_vmexit_handler, inject_gp, inject_ud,
        interrupt_window_vmexit_handler, nmi_window_vmexit_handler,
    },
    vmsr::{rdmsr_vmexit_handler, wrmsr_vmexit_handler},
    vmx::vmcs::{BasicExitReason, ExitReason},
    VmError,
};
use abyss::x86_64::Cr4;

/// XCR0 bits: x87, SSE, AVX.
const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;
/// BNDREGS and BNDCSR go together.
const XCR0_MPX: u64 = 0b11 << 3;

/// Handle the exit the current VMCS reports.
pub fn vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let reason = ctx.vmcs.exit_reason()?;
    let basic = match reason {
        ExitReason::BasicExitReason(b) => b,
        _ => {
            log::error!(
                "vm{} vcpu{}: vm entry failed: {:?}",
                ctx.vm.vm_id,
                ctx.vcpu.vcpu_id,
                reason
            );
            return Err(VmError::HandleVmexitFailed(reason));
        }
    };
    ctx.arch.nr_exits += 1;
    ctx.arch.retain_rip = false;
    log::trace!("vm{} vcpu{}: exit {:?}", ctx.vm.vm_id, ctx.vcpu.vcpu_id, basic);

    match basic {
        BasicExitReason::ExceptionOrNmi(info) => exception_vmexit_handler(ctx, info),
        BasicExitReason::ExternalInt(info) => external_interrupt_vmexit_handler(ctx, info),
        BasicExitReason::InitSignal => init_signal_vmexit_handler(ctx),
        BasicExitReason::StartupIpi { vector } => sipi_vmexit_handler(ctx, vector),
        BasicExitReason::InterruptWindow => interrupt_window_vmexit_handler(ctx),
        BasicExitReason::NmiWindow => nmi_window_vmexit_handler(ctx),
        BasicExitReason::TprBelowThreshold => {
            ctx.vcpu.make_request(VCpuRequest::EVENT);
            Ok(())
        }
        BasicExitReason::Cpuid => cpuid_vmexit_handler(ctx),
        BasicExitReason::Vmcall => vmcall_vmexit_handler(ctx),
        BasicExitReason::MovCr(q) => cr_access_vmexit_handler(ctx, q),
        BasicExitReason::IoInstruction(q) => pio_instr_vmexit_handler(ctx, q),
        BasicExitReason::Rdmsr => rdmsr_vmexit_handler(ctx),
        BasicExitReason::Wrmsr => wrmsr_vmexit_handler(ctx),
        BasicExitReason::EptViolation {
            qualification,
            fault_addr,
        } => mmio::ept_violation_vmexit_handler(ctx, qualification, fault_addr),
        BasicExitReason::ApicAccess => mmio::apic_access_vmexit_handler(ctx),
        BasicExitReason::VirtualizedEoi { vector } => {
            log::trace!("vcpu{}: eoi of level vector {:#x}", ctx.vcpu.vcpu_id, vector);
            Ok(())
        }
        // Expired deadlines are served before the next entry.
        BasicExitReason::VmxPreemptTimer => Ok(()),
        BasicExitReason::Xsetbv => xsetbv_vmexit_handler(ctx),
        // The guest idles or waits on its own pCPU; nothing else runs here.
        BasicExitReason::Hlt
        | BasicExitReason::Pause
        | BasicExitReason::Wbinvd
        | BasicExitReason::Invd => Ok(()),
        BasicExitReason::MovDr => {
            inject_gp(ctx, 0);
            Ok(())
        }
        BasicExitReason::Vmclear
        | BasicExitReason::Vmlaunch
        | BasicExitReason::Vmptrld
        | BasicExitReason::Vmptrst
        | BasicExitReason::Vmread
        | BasicExitReason::Vmresume
        | BasicExitReason::Vmwrite
        | BasicExitReason::Vmxoff
        | BasicExitReason::Vmxon
        | BasicExitReason::Invept
        | BasicExitReason::Invvpid
        | BasicExitReason::Getsec
        | BasicExitReason::Rdpmc
        | BasicExitReason::Rdtscp
        | BasicExitReason::Monitor
        | BasicExitReason::Mwait => {
            inject_ud(ctx);
            Ok(())
        }
        BasicExitReason::TripleFault => {
            log::error!("vm{} vcpu{}: triple fault", ctx.vm.vm_id, ctx.vcpu.vcpu_id);
            Err(VmError::HandleVmexitFailed(reason))
        }
        _ => {
            log::error!(
                "vm{} vcpu{}: unhandled exit {:?}",
                ctx.vm.vm_id,
                ctx.vcpu.vcpu_id,
                basic
            );
            Err(VmError::HandleVmexitFailed(reason))
        }
    }?;

    if basic.is_instruction() && !ctx.arch.retain_rip {
        ctx.forward_rip()?;
    }
    Ok(())
}

/// INIT arrived while the guest ran: the vCPU goes back to wait-for-SIPI.
fn init_signal_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    if ctx.vcpu.is_bsp() {
        log::warn!("vm{}: INIT on the BSP ignored", ctx.vm.vm_id);
        return Ok(());
    }
    ctx.vcpu.set_state(VCpuState::Init);
    ctx.arch.startup = StartupState::WaitForSipi;
    ctx.vcpu.make_request(VCpuRequest::INIT_VMCS);
    Ok(())
}

fn sipi_vmexit_handler(ctx: &mut VCpuContext, vector: u8) -> Result<(), VmError> {
    if ctx.vcpu.state() == VCpuState::Init {
        ctx.vcpu.post_sipi(vector);
        ctx.vcpu.make_request(VCpuRequest::INIT_VMCS);
        ctx.vcpu.set_state(VCpuState::Running);
    }
    Ok(())
}

fn xsetbv_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    if guest_cr4(ctx)? & Cr4::OSXSAVE.bits() == 0 {
        inject_ud(ctx);
        return Ok(());
    }
    let (xcr, value) = {
        let g = ctx.gprs();
        (g.rcx as u32, (g.rdx as u64) << 32 | (g.rax as u64 & 0xffff_ffff))
    };
    let leaf = ctx.arch.cpuid.lookup(0xd, 0);
    let supported = (leaf.edx as u64) << 32 | leaf.eax as u64;
    let valid = ctx.cpl()? == 0
        && xcr == 0
        && value & !supported == 0
        && value & XCR0_X87 != 0
        && (value & XCR0_AVX == 0 || value & XCR0_SSE != 0)
        && (value & XCR0_MPX == 0 || value & XCR0_MPX == XCR0_MPX);
    if !valid {
        inject_gp(ctx, 0);
        return Ok(());
    }
    ctx.hv.platform.xsetbv(xcr, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tests::Harness,
        vcpu::VCpuContext,
        vmx::{mock::ScriptedExit, vmcs::Field, Vmx},
    };

    const EXIT_CPUID: u32 = 0xa;
    const EXIT_VMCALL: u32 = 0x12;
    const EXIT_VMREAD: u32 = 0x17;
    const EXIT_XSETBV: u32 = 0x37;

    /// Enter once with `exit` scripted and handle the result.
    fn exit_with(h: &Harness, ctx: &mut VCpuContext, exit: ScriptedExit) -> Result<(), VmError> {
        let pa = ctx.vmcs.pa();
        h.vmx.script(pa, exit);
        ctx.flush()?;
        unsafe { h.vmx.vmentry(pa, &mut ctx.arch.context().gprs, false) }?;
        ctx.invalidate();
        vmexit_handler(ctx)
    }

    #[test]
    fn instructions_move_rip() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.vmcs.write(Field::GuestRip, 0x1000).unwrap();
            exit_with(&h, ctx, ScriptedExit::new(EXIT_CPUID).instruction_len(2).reg(0, 0)).unwrap();
            assert_eq!(ctx.rip().unwrap(), 0x1002);
            assert_eq!(ctx.arch.nr_exits, 1);

            // Faulting instructions stay where they are.
            exit_with(&h, ctx, ScriptedExit::new(EXIT_VMREAD).instruction_len(3)).unwrap();
            ctx.flush().unwrap();
            assert_eq!(ctx.vmcs.read(Field::GuestRip).unwrap(), 0x1002);
            assert_eq!(ctx.arch.exception.map(|e| e.vector), Some(6));
        });
    }

    #[test]
    fn hypercalls_are_dispatched() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            let exit = ScriptedExit::new(EXIT_VMCALL).reg(0, 0x8000_007f);
            exit_with(&h, ctx, exit).unwrap();
            assert_eq!(ctx.gprs().rax as i64, crate::Errno::EINVAL.as_neg());
        });
    }

    #[test]
    fn entry_failures_and_triple_faults_are_fatal() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            // Invalid guest state.
            let r = exit_with(&h, ctx, ScriptedExit::new(0x8000_0021));
            assert!(matches!(r, Err(VmError::HandleVmexitFailed(ExitReason::EntryFailure(_)))));
            let r = exit_with(&h, ctx, ScriptedExit::new(0x2));
            assert!(matches!(r, Err(VmError::HandleVmexitFailed(_))));
            // EPT misconfiguration.
            assert!(exit_with(&h, ctx, ScriptedExit::new(0x31)).is_err());
        });
    }

    #[test]
    fn xsetbv_checks_the_value() {
        // The harness host offers x87, SSE and AVX state.
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            // No OSXSAVE yet.
            exit_with(&h, ctx, ScriptedExit::new(EXIT_XSETBV).reg(0, 0x3)).unwrap();
            assert_eq!(ctx.arch.exception.take().map(|e| e.vector), Some(6));

            ctx.vmcs.write(Field::Cr4ReadShadow, Cr4::OSXSAVE.bits()).unwrap();
            ctx.vmcs.write(Field::GuestCr4, Cr4::OSXSAVE.bits()).unwrap();
            // AVX without SSE.
            let exit = ScriptedExit::new(EXIT_XSETBV).reg(0, 0x5).reg(1, 0).reg(2, 0);
            exit_with(&h, ctx, exit).unwrap();
            assert_eq!(ctx.arch.exception.take().map(|e| e.vector), Some(13));
            assert_eq!(h.p.xcr(0), None);

            let exit = ScriptedExit::new(EXIT_XSETBV).reg(0, 0x7).reg(1, 0).reg(2, 0);
            exit_with(&h, ctx, exit).unwrap();
            assert!(ctx.arch.exception.is_none());
            assert_eq!(h.p.xcr(0), Some(0x7));
        });
    }

    #[test]
    fn startup_ipi_wakes_an_ap() {
        let h = Harness::new();
        let vm = h.vm(0);
        h.with_vcpu(&vm, 1, |ctx| {
            assert_eq!(ctx.vcpu.state(), VCpuState::Init);
            ctx.vcpu.clear_requests();
            // Vector 0x9d in the qualification.
            exit_with(&h, ctx, ScriptedExit::new(0x4).qualification(0x9d)).unwrap();
            assert_eq!(ctx.vcpu.state(), VCpuState::Running);
            assert!(ctx.vcpu.has_request(VCpuRequest::INIT_VMCS));
            assert_eq!(ctx.vcpu.take_sipi(), Some(0x9d));
        });
    }
}
