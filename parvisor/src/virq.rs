//! Virtual interrupts and exceptions.
//!
//! Events reach a vCPU in two steps. A producer (an exit handler, a device,
//! another pCPU) records the event and posts a [`VCpuRequest`]; right before
//! the next VM entry [`inject_pending`] turns the requests into at most one
//! injected event, opening an interrupt or NMI window when the guest cannot
//! take what is pending.

use crate::{
    hv::{Hypervisor, NOTIFY_VECTOR, POSTED_INTR_VECTOR},
    vcpu::{PendingException, VCpuArch, VCpuContext, VCpuRequest},
    vlapic::Injection,
    vm::Vm,
    vmx::{
        control::VmcsProcBasedVmexecCtl,
        vmcs::{ActiveVmcs, Field, InterruptionInfo, InterruptionType},
    },
    VmError,
};
use abyss::{dev::x86_64::apic, x86_64::Rflags};

pub const EXCEPTION_DE: u8 = 0;
pub const EXCEPTION_DB: u8 = 1;
pub const EXCEPTION_NMI: u8 = 2;
pub const EXCEPTION_BP: u8 = 3;
pub const EXCEPTION_OF: u8 = 4;
pub const EXCEPTION_UD: u8 = 6;
pub const EXCEPTION_DF: u8 = 8;
pub const EXCEPTION_TS: u8 = 10;
pub const EXCEPTION_NP: u8 = 11;
pub const EXCEPTION_SS: u8 = 12;
pub const EXCEPTION_GP: u8 = 13;
pub const EXCEPTION_PF: u8 = 14;
pub const EXCEPTION_AC: u8 = 17;

/// Blocking by STI.
const INTERRUPTIBILITY_STI: u64 = 1 << 0;
/// Blocking by MOV SS.
const INTERRUPTIBILITY_MOVSS: u64 = 1 << 1;
/// Blocking by NMI.
const INTERRUPTIBILITY_NMI: u64 = 1 << 3;

/// Exception classes of Intel SDM Table 6-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

fn exception_class(vector: u8) -> ExceptionClass {
    match vector {
        EXCEPTION_DE | EXCEPTION_TS | EXCEPTION_NP | EXCEPTION_SS | EXCEPTION_GP => {
            ExceptionClass::Contributory
        }
        EXCEPTION_PF => ExceptionClass::PageFault,
        _ => ExceptionClass::Benign,
    }
}

/// Whether the exception pushes an error code.
pub fn has_error_code(vector: u8) -> bool {
    matches!(vector, EXCEPTION_DF | EXCEPTION_TS..=EXCEPTION_PF | EXCEPTION_AC)
}

/// Queue `vector` for delivery at the next entry.
///
/// An exception raised while another one is pending is merged the way the
/// processor would: two contributory exceptions, or a page fault followed by
/// a contributory exception or page fault, become a double fault; any of
/// those during a double fault is a triple fault.
pub fn queue_exception(
    vcpu: &crate::vcpu::VCpu,
    arch: &mut VCpuArch,
    vector: u8,
    error_code: u32,
) {
    let new_class = exception_class(vector);
    let merged = match arch.exception {
        Some(prev) if prev.vector == EXCEPTION_DF && new_class != ExceptionClass::Benign => {
            vcpu.make_request(VCpuRequest::TRP_FAULT);
            return;
        }
        Some(prev)
            if matches!(
                (exception_class(prev.vector), new_class),
                (ExceptionClass::Contributory, ExceptionClass::Contributory)
                    | (ExceptionClass::PageFault, ExceptionClass::Contributory)
                    | (ExceptionClass::PageFault, ExceptionClass::PageFault)
            ) =>
        {
            PendingException {
                vector: EXCEPTION_DF,
                error_code: Some(0),
            }
        }
        _ => PendingException {
            vector,
            error_code: has_error_code(vector).then_some(error_code),
        },
    };
    arch.exception = Some(merged);
    vcpu.make_request(VCpuRequest::EXCP);
}

fn inject_fault(ctx: &mut VCpuContext, vector: u8, error_code: u32) {
    queue_exception(ctx.vcpu, ctx.arch, vector, error_code);
    // A fault reports the address of the faulting instruction.
    ctx.retain_rip();
}

/// Raise #GP(`error_code`).
pub fn inject_gp(ctx: &mut VCpuContext, error_code: u32) {
    inject_fault(ctx, EXCEPTION_GP, error_code)
}

/// Raise #UD.
pub fn inject_ud(ctx: &mut VCpuContext) {
    inject_fault(ctx, EXCEPTION_UD, 0)
}

/// Raise #PF at `addr`.
pub fn inject_pf(ctx: &mut VCpuContext, addr: u64, error_code: u32) {
    ctx.gprs().cr2 = addr as usize;
    inject_fault(ctx, EXCEPTION_PF, error_code)
}

#[inline]
fn event_pending(vmcs: &ActiveVmcs) -> Result<bool, VmError> {
    Ok(vmcs.read(Field::VmentryInterruptionInfo)? & (1 << 31) != 0)
}

fn write_event(vmcs: &ActiveVmcs, info: InterruptionInfo, error_code: Option<u32>) -> Result<(), VmError> {
    if let Some(e) = error_code {
        vmcs.write(Field::VmentryExceptionErrCode, e as u64)?;
    }
    vmcs.write(Field::VmentryInterruptionInfo, info.encode() as u64)
}

/// Deliver a pending exception.
fn inject_exception(ctx: &mut VCpuContext, e: PendingException) -> Result<(), VmError> {
    let interruption_type = match e.vector {
        // #BP and #OF come from INT3 and INTO.
        EXCEPTION_BP | EXCEPTION_OF => {
            let len = ctx.vmcs.read(Field::VmexitInstructionLength)?;
            ctx.vmcs.write(Field::VmentryInstructionLength, len)?;
            InterruptionType::SoftwareException
        }
        EXCEPTION_NMI => InterruptionType::Nmi,
        _ => InterruptionType::HardwareException,
    };
    write_event(
        &ctx.vmcs,
        InterruptionInfo {
            vector: e.vector,
            interruption_type,
            error_code_valid: e.error_code.is_some(),
            nmi_unblocked_by_iret: false,
        },
        e.error_code,
    )?;
    // A fault clears RF; the instruction is restarted.
    if matches!(exception_class(e.vector), ExceptionClass::Contributory | ExceptionClass::PageFault) {
        let rflags = ctx.rflags()?;
        ctx.set_rflags(rflags & !Rflags::RF.bits());
    }
    Ok(())
}

fn open_window(vmcs: &ActiveVmcs, window: VmcsProcBasedVmexecCtl) -> Result<(), VmError> {
    vmcs.set_bits(Field::ProcessorBasedVmexecControls, window.bits())
}

/// Turn the pending requests of `ctx.vcpu` into VMCS state.
///
/// The order is: triple fault, EPT flush, passthrough softirq, exception,
/// NMI, vLAPIC interrupt, vPIC interrupt. Only one event is injected per
/// entry; whatever is left opens a window.
pub fn inject_pending(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let vcpu = ctx.vcpu;
    if vcpu.take_request(VCpuRequest::TRP_FAULT) {
        log::error!(
            "inject_pending: vm{} vcpu{} triple fault",
            ctx.vm.vm_id,
            vcpu.vcpu_id
        );
        return Err(VmError::VCpuError("triple fault"));
    }
    if vcpu.take_request(VCpuRequest::EPT_FLUSH) {
        let eptp = ctx.vm.ept.read().eptp();
        ctx.hv.vmx.invept(eptp)?;
    }
    if vcpu.take_request(VCpuRequest::SOFTIRQ) {
        crate::ptirq::ptirq_softirq(ctx.hv, ctx.vm);
    }

    // A re-injected IDT-vectoring event owns this entry.
    let mut busy = event_pending(&ctx.vmcs)?;
    if !busy && vcpu.take_request(VCpuRequest::EXCP) {
        if let Some(e) = ctx.arch.exception.take() {
            inject_exception(ctx, e)?;
            busy = true;
        }
    }

    let intr_state = ctx.vmcs.read(Field::GuestInterruptibilityState)?;
    if vcpu.has_request(VCpuRequest::NMI) {
        if !busy && intr_state & (INTERRUPTIBILITY_NMI | INTERRUPTIBILITY_MOVSS) == 0 {
            vcpu.take_request(VCpuRequest::NMI);
            write_event(
                &ctx.vmcs,
                InterruptionInfo {
                    vector: EXCEPTION_NMI,
                    interruption_type: InterruptionType::Nmi,
                    error_code_valid: false,
                    nmi_unblocked_by_iret: false,
                },
                None,
            )?;
            busy = true;
        } else {
            open_window(&ctx.vmcs, VmcsProcBasedVmexecCtl::NMIWINEXIT)?;
        }
    }

    let interruptible = !busy
        && ctx.rflags()? & Rflags::IF.bits() != 0
        && intr_state & (INTERRUPTIBILITY_STI | INTERRUPTIBILITY_MOVSS) == 0;
    if vcpu.take_request(VCpuRequest::EVENT) {
        let vlapic = &vcpu.vlapic;
        match vlapic.ops().inject_intr(vlapic, &ctx.vmcs, interruptible)? {
            Injection::Injected(v) => {
                log::trace!("vm{} vcpu{}: inject {:#x}", ctx.vm.vm_id, vcpu.vcpu_id, v);
                // Interruption-information is only consumed by software injection.
                busy |= event_pending(&ctx.vmcs)?;
            }
            Injection::NeedWindow => {
                vcpu.make_request(VCpuRequest::EVENT);
                open_window(&ctx.vmcs, VmcsProcBasedVmexecCtl::INTRWINEXIT)?;
            }
            Injection::Nothing => (),
        }
    }
    if vcpu.has_request(VCpuRequest::EXTINT) {
        let vpic = &ctx.vm.devices.vpic;
        if !busy && interruptible && vcpu.is_bsp() {
            vcpu.take_request(VCpuRequest::EXTINT);
            if let Some(vector) = vpic.pending_intr() {
                write_event(
                    &ctx.vmcs,
                    InterruptionInfo {
                        vector,
                        interruption_type: InterruptionType::ExternalInt,
                        error_code_valid: false,
                        nmi_unblocked_by_iret: false,
                    },
                    None,
                )?;
                vpic.intr_accepted(vector);
                if vpic.pending_intr().is_some() {
                    vcpu.make_request(VCpuRequest::EXTINT);
                }
            }
        } else if vcpu.is_bsp() {
            open_window(&ctx.vmcs, VmcsProcBasedVmexecCtl::INTRWINEXIT)?;
        } else {
            vcpu.take_request(VCpuRequest::EXTINT);
        }
    }
    Ok(())
}

/// Re-inject an event whose delivery was interrupted by the exit.
pub fn reinject_idt_vectoring(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let raw = ctx.vmcs.read(Field::IdtVectoringInfo)? as u32;
    let Some(info) = InterruptionInfo::decode(raw) else {
        return Ok(());
    };
    let error_code = if info.error_code_valid {
        Some(ctx.vmcs.read(Field::IdtVectoringErrCode)? as u32)
    } else {
        None
    };
    if matches!(
        info.interruption_type,
        InterruptionType::SoftwareInt
            | InterruptionType::PrivSoftwareException
            | InterruptionType::SoftwareException
    ) {
        let len = ctx.vmcs.read(Field::VmexitInstructionLength)?;
        ctx.vmcs.write(Field::VmentryInstructionLength, len)?;
    }
    write_event(&ctx.vmcs, info, error_code)
}

/// Interrupt window exit: the guest can take interrupts again.
pub fn interrupt_window_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    ctx.vmcs.clear_bits(
        Field::ProcessorBasedVmexecControls,
        VmcsProcBasedVmexecCtl::INTRWINEXIT.bits(),
    )?;
    ctx.vcpu.make_request(VCpuRequest::EVENT);
    if ctx.vcpu.is_bsp() && ctx.vm.devices.vpic.pending_intr().is_some() {
        ctx.vcpu.make_request(VCpuRequest::EXTINT);
    }
    Ok(())
}

/// NMI window exit: virtual NMIs are unblocked.
pub fn nmi_window_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    ctx.vmcs.clear_bits(
        Field::ProcessorBasedVmexecControls,
        VmcsProcBasedVmexecCtl::NMIWINEXIT.bits(),
    )
}

/// External interrupt exit. The interrupt was acknowledged on exit.
pub fn external_interrupt_vmexit_handler(
    ctx: &mut VCpuContext,
    info: Option<InterruptionInfo>,
) -> Result<(), VmError> {
    let Some(info) = info else {
        log::warn!("vm{} vcpu{}: external interrupt without information", ctx.vm.vm_id, ctx.vcpu.vcpu_id);
        return Ok(());
    };
    match info.vector {
        // Kicks have done their job by causing the exit.
        NOTIFY_VECTOR => (),
        POSTED_INTR_VECTOR => ctx.vcpu.make_request(VCpuRequest::EVENT),
        vector => {
            if !ctx.hv.irq.dispatch(ctx.hv, vector) {
                log::debug!("pcpu{}: spurious vector {:#x}", ctx.vcpu.pcpu_id, vector);
            }
        }
    }
    apic::eoi(&*ctx.hv.platform);
    Ok(())
}

/// Exception or NMI exit. Only NMIs are intercepted; they belong to the
/// guest of this pCPU.
pub fn exception_vmexit_handler(
    ctx: &mut VCpuContext,
    info: Option<InterruptionInfo>,
) -> Result<(), VmError> {
    match info {
        Some(i) if i.interruption_type == InterruptionType::Nmi => {
            ctx.vcpu.make_request(VCpuRequest::NMI);
        }
        Some(i) => {
            let error_code = if i.error_code_valid {
                ctx.vmcs.read(Field::VmexitInterruptionErrCode)? as u32
            } else {
                0
            };
            queue_exception(ctx.vcpu, ctx.arch, i.vector, error_code);
        }
        None => log::warn!("vm{} vcpu{}: exception exit without information", ctx.vm.vm_id, ctx.vcpu.vcpu_id),
    }
    Ok(())
}

/// Assert legacy `irq` on the vPIC of `vm`.
pub fn vpic_raise(hv: &Hypervisor, vm: &Vm, irq: u8) {
    if vm.devices.vpic.assert_irq(irq) {
        if let Some(bsp) = vm.bsp() {
            bsp.make_request(VCpuRequest::EXTINT);
            hv.kick_vcpu(bsp);
        }
    }
}

/// Deassert legacy `irq`.
pub fn vpic_lower(vm: &Vm, irq: u8) {
    vm.devices.vpic.deassert_irq(irq);
}
