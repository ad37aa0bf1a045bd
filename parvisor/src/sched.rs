//! The run loop of a pCPU.
//!
//! Every pCPU owns at most one vCPU. [`run_once`] serves the requests
//! posted to the pCPU, then enters the bound vCPU once and handles the exit
//! it comes back with. [`schedule`] repeats that until the pCPU goes
//! offline.

use crate::{
    config::{CONSOLE_PCPU_ID, CONSOLE_TIMER_PERIOD_MS},
    console::console_kick,
    hv::Hypervisor,
    percpu::{Assignment, PcpuFlags, PerCpu},
    vcpu::{StartupState, VCpu, VCpuContext, VCpuRequest, VCpuState},
    virq::{inject_pending, reinject_idt_vectoring},
    vlapic::set_intr,
    vm::{fatal_error_shutdown_vm, reset_from_idle, shutdown_vm_from_idle, Vm},
    vmexit::vmexit_handler,
    vmx::{control::preemption_timer_rate, setup::init_vmcs, vmcs::Field},
    VmError,
};

/// What one pass of the run loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// The vCPU ran until its next exit.
    Ran,
    /// Nothing to run.
    Idle,
    /// The pCPU left the loop.
    Offline,
}

/// Run `pcpu_id` until it is taken offline.
pub fn schedule(hv: &Hypervisor, pcpu_id: usize) {
    loop {
        match run_once(hv, pcpu_id) {
            Schedule::Ran => (),
            Schedule::Idle => hv.platform.cpu_relax(),
            Schedule::Offline => return,
        }
    }
}

/// One pass of the run loop of `pcpu_id`.
pub fn run_once(hv: &Hypervisor, pcpu_id: usize) -> Schedule {
    let Some(percpu) = hv.percpu(pcpu_id) else {
        return Schedule::Offline;
    };
    if percpu.take(PcpuFlags::NEED_OFFLINE) {
        percpu.set_online(false);
        log::info!("pcpu{} offline", pcpu_id);
        return Schedule::Offline;
    }
    if percpu.take(PcpuFlags::NEED_SHUTDOWN_VM) {
        shutdown_vm_from_idle(hv, pcpu_id);
    }
    if percpu.take(PcpuFlags::NEED_RESCHEDULE) {
        if let Some(a) = percpu.current() {
            reset_from_idle(hv, &a.vm);
        }
    }
    if percpu.take(PcpuFlags::CONSOLE_KICK) {
        console_kick(hv);
    }

    let Some(Assignment { vm, vcpu_id }) = percpu.current() else {
        return idle(hv, percpu);
    };
    let Some(vcpu) = vm.vcpu(vcpu_id) else {
        return idle(hv, percpu);
    };
    if !vm.is_started() || vcpu.state() != VCpuState::Running {
        return idle(hv, percpu);
    }
    if let Err(e) = run_vcpu(hv, percpu, &vm, vcpu) {
        log::error!("vm{} vcpu{}: {:?}", vm.vm_id, vcpu.vcpu_id, e);
        fatal_error_shutdown_vm(hv, &vm, vcpu);
    }
    Schedule::Ran
}

fn run_vcpu(hv: &Hypervisor, percpu: &PerCpu, vm: &Vm, vcpu: &VCpu) -> Result<(), VmError> {
    let mut guard = vcpu.arch();
    let arch = &mut *guard;

    let init = vcpu.take_request(VCpuRequest::INIT_VMCS);
    if init && arch.launched {
        // VMLAUNCH again from a clear VMCS.
        arch.vmcs.clear(&*hv.vmx)?;
        arch.launched = false;
    }
    let vmcs = arch.vmcs.activate(&*hv.vmx)?;
    if init {
        if let Some(vector) = vcpu.take_sipi() {
            arch.reset(StartupState::Sipi { vector });
        }
    }
    let mut ctx = VCpuContext {
        hv,
        vm,
        vcpu,
        arch,
        vmcs,
    };
    if init {
        // Drop stale writes of the previous run.
        ctx.invalidate();
        init_vmcs(&mut ctx)?;
    }

    arm_timers(&mut ctx, percpu)?;
    inject_pending(&mut ctx)?;
    ctx.flush()?;

    // Kicks sent from here on force an exit right after the entry.
    vcpu.set_running(true);
    if vcpu.state() != VCpuState::Running {
        vcpu.set_running(false);
        return Ok(());
    }
    let launched = ctx.arch.launched;
    // SAFETY: the VMCS is current and was initialized by init_vmcs.
    let entered = unsafe { hv.vmx.vmentry(vmcs.pa(), &mut ctx.arch.context().gprs, launched) };
    let r = match entered {
        Ok(()) => {
            ctx.arch.launched = true;
            ctx.invalidate();
            reinject_idt_vectoring(&mut ctx).and_then(|_| vmexit_handler(&mut ctx))
        }
        Err(e) => {
            log::error!(
                "vm{} vcpu{}: {} failed: {:?}",
                vm.vm_id,
                vcpu.vcpu_id,
                if launched { "vmresume" } else { "vmlaunch" },
                e
            );
            Err(e.into())
        }
    };
    vcpu.set_running(false);
    r
}

/// Nothing to enter. The console pCPU still serves its poll.
fn idle(hv: &Hypervisor, percpu: &PerCpu) -> Schedule {
    if percpu.pcpu_id == CONSOLE_PCPU_ID && console_due(hv, percpu, hv.platform.rdtsc()) {
        console_kick(hv);
    }
    Schedule::Idle
}

/// Whether the console poll expired at `now`. Moves the deadline one period
/// ahead when it did.
fn console_due(hv: &Hypervisor, percpu: &PerCpu, now: u64) -> bool {
    if now < percpu.tsc_deadline() {
        return false;
    }
    percpu.set_tsc_deadline(now + hv.timebase.us_to_ticks(CONSOLE_TIMER_PERIOD_MS * 1000));
    true
}

/// Fire expired deadlines and program the preemption timer for the next one.
///
/// The timer backs the TSC-deadline timer of the vLAPIC and, on the console
/// pCPU, the periodic poll of the UART.
fn arm_timers(ctx: &mut VCpuContext, percpu: &PerCpu) -> Result<(), VmError> {
    let hv = ctx.hv;
    let p = &*hv.platform;
    let now = p.rdtsc();
    if let Some(vector) = ctx.vcpu.vlapic.expire_timer(now) {
        set_intr(hv, ctx.vcpu, vector, false);
    }

    let mut deadline = ctx.vcpu.vlapic.timer_deadline().unwrap_or(u64::MAX);
    if percpu.pcpu_id == CONSOLE_PCPU_ID {
        if console_due(hv, percpu, now) {
            percpu.request(PcpuFlags::CONSOLE_KICK);
        }
        deadline = deadline.min(percpu.tsc_deadline());
    }

    let value = match deadline {
        u64::MAX => u32::MAX as u64,
        d => (d.saturating_sub(now) >> preemption_timer_rate(p)).min(u32::MAX as u64),
    };
    ctx.vmcs.write(Field::GuestPreemptionTimerValue, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::INVALID_VMID,
        console::CONSOLE_SWITCH_KEY,
        tests::{wake_ap, Harness},
        vlapic::{APIC_OFFSET_IRR0, APIC_OFFSET_TIMER_LVT, LVT_TIMER_TSC_DEADLINE},
        vm::start_vm,
        vmx::{mock::ScriptedExit, vmcs::InstructionError},
    };

    #[test]
    fn bsp_launches_then_resumes() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let pa = vm.bsp().unwrap().arch().vmcs.pa();

        assert_eq!(run_once(&h.hv, 2), Schedule::Ran);
        assert_eq!(run_once(&h.hv, 2), Schedule::Ran);
        assert_eq!(h.vmx.entries(), [(pa, false), (pa, true)]);
        // Each unscripted exit is a one byte HLT. The RIP of the last one is
        // written back on the next entry.
        assert_eq!(h.vmx.field(pa, Field::GuestRip), 0x10_0001);
        assert_eq!(vm.bsp().unwrap().arch().nr_exits, 2);
        assert!(!vm.bsp().unwrap().is_running());
    }

    #[test]
    fn waiting_aps_and_empty_pcpus_idle() {
        let h = Harness::new();
        let vm = h.vm(1);
        assert_eq!(run_once(&h.hv, 2), Schedule::Idle);
        start_vm(&h.hv, &vm).unwrap();
        assert_eq!(run_once(&h.hv, 3), Schedule::Idle);
        assert!(h.vmx.entries().is_empty());
        assert_eq!(run_once(&h.hv, 9), Schedule::Offline);
    }

    #[test]
    fn failed_entry_takes_the_vm_down() {
        let h = Harness::new();
        let (vm0, vm1) = (h.vm(0), h.vm(1));
        start_vm(&h.hv, &vm0).unwrap();
        start_vm(&h.hv, &vm1).unwrap();
        let pa = vm1.bsp().unwrap().arch().vmcs.pa();
        h.vmx.script(pa, ScriptedExit::entry_fails(InstructionError::InvalidHostState));

        assert_eq!(run_once(&h.hv, 2), Schedule::Ran);
        assert!(vm1.is_paused());
        assert_eq!(run_once(&h.hv, 2), Schedule::Idle);
        assert!(vm1.is_poweroff());
        assert!(h.hv.vm(1).is_none());
        // The other partition keeps running.
        assert_eq!(run_once(&h.hv, 0), Schedule::Ran);
        assert!(vm0.is_started());
    }

    #[test]
    fn console_pcpu_polls_periodically() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        wake_ap(&h, &vm);
        let pa = vm.vcpu(1).unwrap().arch().vmcs.pa();

        assert_eq!(run_once(&h.hv, CONSOLE_PCPU_ID), Schedule::Ran);
        let percpu = h.hv.percpu(CONSOLE_PCPU_ID).unwrap();
        assert!(percpu.pending().contains(PcpuFlags::CONSOLE_KICK));
        let period = h.hv.timebase.us_to_ticks(CONSOLE_TIMER_PERIOD_MS * 1000);
        assert_eq!(
            h.vmx.field(pa, Field::GuestPreemptionTimerValue),
            period >> preemption_timer_rate(&*h.p)
        );

        h.p.push_rx(b"x");
        assert_eq!(run_once(&h.hv, CONSOLE_PCPU_ID), Schedule::Ran);
        assert!(!percpu.pending().contains(PcpuFlags::CONSOLE_KICK));
    }

    #[test]
    fn idle_console_pcpu_still_polls() {
        let h = Harness::new();
        let vm1 = h.vm(1);
        start_vm(&h.hv, &h.vm(0)).unwrap();
        start_vm(&h.hv, &vm1).unwrap();
        let period = h.hv.timebase.us_to_ticks(CONSOLE_TIMER_PERIOD_MS * 1000);

        // The AP of vm1 on the console pCPU still waits for its SIPI.
        h.p.push_rx(&[CONSOLE_SWITCH_KEY]);
        assert_eq!(run_once(&h.hv, CONSOLE_PCPU_ID), Schedule::Idle);
        assert_eq!(h.hv.console.console_vmid(), INVALID_VMID);

        // Nothing is bound to the console pCPU any more.
        crate::vm::shutdown_vm(&h.hv, &vm1).unwrap();
        h.p.push_rx(&[CONSOLE_SWITCH_KEY]);
        assert_eq!(run_once(&h.hv, CONSOLE_PCPU_ID), Schedule::Idle);
        assert_eq!(h.hv.console.console_vmid(), INVALID_VMID);
        h.p.advance_tsc(period);
        assert_eq!(run_once(&h.hv, CONSOLE_PCPU_ID), Schedule::Idle);
        assert_eq!(h.hv.console.console_vmid(), 0);
        assert!(h.vmx.entries().is_empty());
    }

    #[test]
    fn guest_deadline_fires_before_entry() {
        let h = Harness::new();
        let vm = h.vm(1);
        start_vm(&h.hv, &vm).unwrap();
        let bsp = vm.bsp().unwrap();
        bsp.vlapic.page().write(APIC_OFFSET_TIMER_LVT, LVT_TIMER_TSC_DEADLINE | 0xec);
        h.p.set_tsc(1_000);
        bsp.vlapic.set_tsc_deadline_msr(5_000);

        run_once(&h.hv, 2);
        assert_eq!(bsp.vlapic.timer_deadline(), Some(5_000));
        assert!(!bsp.vlapic.page().test_vec(APIC_OFFSET_IRR0, 0xec));

        h.p.advance_tsc(10_000);
        run_once(&h.hv, 2);
        assert_eq!(bsp.vlapic.timer_deadline(), None);
        assert!(bsp.vlapic.page().test_vec(APIC_OFFSET_IRR0, 0xec));
    }

    #[test]
    fn offline_request_ends_the_loop() {
        let h = Harness::new();
        let percpu = h.hv.percpu(1).unwrap();
        percpu.set_online(true);
        percpu.request(PcpuFlags::NEED_OFFLINE);
        schedule(&h.hv, 1);
        assert!(!percpu.is_online());
    }
}
