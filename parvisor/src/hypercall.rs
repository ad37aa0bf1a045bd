//! Hypercalls.
//!
//! A guest issues VMCALL from ring 0 with the hypercall id in `rax` and up
//! to two parameters in `rdi` and `rsi`. The result, zero or a negative
//! [`Errno`], is returned in `rax`.

use crate::{
    config::{VmId, MAX_PCPU, MAX_VCPUS_PER_VM, MAX_VM},
    probe::copy_to_gpa,
    vcpu::VCpuContext,
    virq::inject_gp,
    vm::request_shutdown,
    Errno, VmError,
};

const HC_ID: u64 = 0x80 << 24;

/// Write the interface version to the GPA in `rdi`.
pub const HC_GET_API_VERSION: u64 = HC_ID;
/// Write a [`PlatformInfo`] to the GPA in `rdi`.
pub const HC_GET_PLATFORM_INFO: u64 = HC_ID | 0x03;
/// Shut down the VM with the id in `rdi`.
pub const HC_SHUTDOWN_VM: u64 = HC_ID | 0x11;

pub const API_VERSION_MAJOR: u32 = 1;
pub const API_VERSION_MINOR: u32 = 0;

/// What HC_GET_PLATFORM_INFO reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Online pCPUs.
    pub cpu_num: u16,
    pub max_vms: u16,
    pub max_vcpus_per_vm: u16,
    pub max_pcpus: u16,
}

impl PlatformInfo {
    /// Guest layout: four little endian `u16`.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0; 8];
        for (i, v) in [self.cpu_num, self.max_vms, self.max_vcpus_per_vm, self.max_pcpus]
            .into_iter()
            .enumerate()
        {
            b[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        b
    }
}

/// VMCALL exit.
pub fn vmcall_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    if ctx.cpl()? != 0 {
        log::debug!(
            "vm{} vcpu{}: hypercall from cpl {}",
            ctx.vm.vm_id,
            ctx.vcpu.vcpu_id,
            ctx.cpl()?
        );
        inject_gp(ctx, 0);
        return Ok(());
    }
    let (id, param1) = {
        let gprs = ctx.gprs();
        (gprs.rax as u64, gprs.rdi as u64)
    };
    let ret = match dispatch(ctx, id, param1) {
        Ok(()) => 0,
        Err(e) => {
            log::debug!("vm{}: hypercall {:#x} failed: {:?}", ctx.vm.vm_id, id, e);
            e.as_neg()
        }
    };
    ctx.gprs().rax = ret as usize;
    Ok(())
}

fn dispatch(ctx: &mut VCpuContext, id: u64, param1: u64) -> Result<(), Errno> {
    match id {
        HC_GET_API_VERSION => {
            let mut b = [0; 8];
            b[..4].copy_from_slice(&API_VERSION_MAJOR.to_le_bytes());
            b[4..].copy_from_slice(&API_VERSION_MINOR.to_le_bytes());
            copy_to_gpa(ctx.hv, ctx.vm, &b, param1)?;
            Ok(())
        }
        HC_GET_PLATFORM_INFO => {
            let info = PlatformInfo {
                cpu_num: ctx.hv.online_mask().count_ones() as u16,
                max_vms: MAX_VM as u16,
                max_vcpus_per_vm: MAX_VCPUS_PER_VM as u16,
                max_pcpus: MAX_PCPU as u16,
            };
            copy_to_gpa(ctx.hv, ctx.vm, &info.to_bytes(), param1)?;
            Ok(())
        }
        HC_SHUTDOWN_VM => shutdown_vm(ctx, param1),
        _ => Err(Errno::EINVAL),
    }
}

fn shutdown_vm(ctx: &mut VCpuContext, param1: u64) -> Result<(), Errno> {
    let target = VmId::try_from(param1).ok();
    if target != Some(ctx.vm.vm_id) && !ctx.vm.is_highest_severity() {
        return Err(Errno::EACCES);
    }
    match target.and_then(|id| ctx.hv.vm(id)) {
        Some(vm) if !vm.is_poweroff() => {
            log::info!("vm{}: shutdown requested by vm{}", vm.vm_id, ctx.vm.vm_id);
            request_shutdown(ctx.hv, &vm);
            Ok(())
        }
        _ => Err(Errno::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{percpu::PcpuFlags, probe::copy_from_gpa, tests::Harness, vm::start_vm, vmx::vmcs::Field};

    fn call(ctx: &mut VCpuContext, id: u64, param1: u64) -> i64 {
        ctx.gprs().rax = id as usize;
        ctx.gprs().rdi = param1 as usize;
        vmcall_vmexit_handler(ctx).unwrap();
        ctx.gprs().rax as i64
    }

    #[test]
    fn version_and_platform_info() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            assert_eq!(call(ctx, HC_GET_API_VERSION, 0x8000), 0);
            let mut b = [0; 8];
            copy_from_gpa(ctx.hv, ctx.vm, &mut b, 0x8000).unwrap();
            assert_eq!(b, [1, 0, 0, 0, 0, 0, 0, 0]);

            assert_eq!(call(ctx, HC_GET_PLATFORM_INFO, 0x9000), 0);
            copy_from_gpa(ctx.hv, ctx.vm, &mut b, 0x9000).unwrap();
            assert_eq!(&b[2..], [2, 0, 4, 0, 4, 0]);

            // Beyond the 256 MiB of guest memory.
            assert_eq!(call(ctx, HC_GET_API_VERSION, 0x4000_0000), Errno::EFAULT.as_neg());
            assert_eq!(call(ctx, HC_ID | 0x7f, 0), Errno::EINVAL.as_neg());
        });
    }

    #[test]
    fn user_mode_gets_gp() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.vmcs.write(Field::GuestSsAccessRights, 3 << 5).unwrap();
            ctx.gprs().rax = HC_GET_API_VERSION as usize;
            vmcall_vmexit_handler(ctx).unwrap();
            assert_eq!(ctx.gprs().rax as u64, HC_GET_API_VERSION);
            assert_eq!(ctx.arch.exception.map(|e| e.vector), Some(13));
        });
    }

    #[test]
    fn shutdown_needs_severity() {
        let h = Harness::new();
        let (vm0, vm1) = (h.vm(0), h.vm(1));
        start_vm(&h.hv, &vm0).unwrap();
        start_vm(&h.hv, &vm1).unwrap();
        h.with_vcpu(&vm1, 0, |ctx| {
            assert_eq!(call(ctx, HC_SHUTDOWN_VM, 0), Errno::EACCES.as_neg());
            assert_eq!(call(ctx, HC_SHUTDOWN_VM, 1 << 20), Errno::EACCES.as_neg());
        });
        assert!(vm0.is_started());
        h.with_vcpu(&vm0, 0, |ctx| {
            assert_eq!(call(ctx, HC_SHUTDOWN_VM, 7), Errno::EINVAL.as_neg());
            assert_eq!(call(ctx, HC_SHUTDOWN_VM, 1), 0);
        });
        assert!(vm1.is_paused());
        let percpu = h.hv.percpu(2).unwrap();
        assert!(percpu.pending().contains(PcpuFlags::NEED_SHUTDOWN_VM));
        assert_eq!(percpu.shutdown_vm_id(), 1);
    }

    #[test]
    fn a_vm_may_shut_itself_down() {
        let h = Harness::new();
        let vm1 = h.vm(1);
        start_vm(&h.hv, &vm1).unwrap();
        h.with_vcpu(&vm1, 0, |ctx| assert_eq!(call(ctx, HC_SHUTDOWN_VM, 1), 0));
        assert!(vm1.is_paused());
    }
}
