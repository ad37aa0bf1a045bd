//! Fixtures shared by the unit tests and the end-to-end scenarios.
//!
//! A [`Harness`] is one machine: a mock platform with four pCPUs and the
//! RAM the VM table asks for, a mock VMX backend and a calibrated
//! hypervisor on top.


use crate::{
    config::{HvOptions, VmId, VM_CONFIGS},
    hv::Hypervisor,
    io::{emulate_io, PioRequest},
    vcpu::{StartupState, VCpu, VCpuArch, VCpuContext},
    vcpuid::CpuidCache,
    vlapic::{mmio_write, VLapic, APIC_OFFSET_ICR_HI, APIC_OFFSET_ICR_LOW, SOFTWARE_APICV},
    vm::{create_vm, Vm},
    vmsr::MsrBitmap,
    vmx::{
        mock::{vmx_capable, MockVmx},
        vmcs::{IoDirection, Vmcs},
    },
};
use abyss::{
    boot::e820::{E820Entry, E820Type, HostE820},
    dev::x86_64::apic::{ICR_DELIVERY_INIT, ICR_DELIVERY_STARTUP, ICR_LEVEL_ASSERT},
    mock::MockPlatform,
    platform::{CpuidResult, IoWidth},
    timebase::CPUID_LEAF_FREQUENCY,
};
use alloc::{boxed::Box, sync::Arc};

pub struct Harness {
    pub hv: Arc<Hypervisor>,
    pub p: Arc<MockPlatform>,
    pub vmx: Arc<MockVmx>,
}

/// The processor every harness runs on.
pub fn host_cpuid(p: &MockPlatform) {
    p.set_cpuid(0, 0, CpuidResult { eax: CPUID_LEAF_FREQUENCY, ..Default::default() });
    // VMX, x2APIC, TSC deadline and XSAVE; four logical processors.
    p.set_cpuid(
        1,
        0,
        CpuidResult {
            eax: 0x906ea,
            ebx: 4 << 16,
            ecx: 1 << 5 | 1 << 21 | 1 << 24 | 1 << 26,
            edx: 1,
        },
    );
    // x87, SSE and AVX state.
    p.set_cpuid(0xd, 0, CpuidResult { eax: 0x7, ..Default::default() });
    p.set_cpuid(CPUID_LEAF_FREQUENCY, 0, CpuidResult { eax: 2400, ..Default::default() });
}

impl Harness {
    /// A machine with every VM of the table created, none started.
    pub fn new() -> Self {
        let h = Self::bare();
        for config in VM_CONFIGS.iter() {
            create_vm(&h.hv, config).unwrap();
        }
        h
    }

    /// A machine without VMs.
    pub fn bare() -> Self {
        let p = Arc::new(MockPlatform::new());
        vmx_capable(&p);
        host_cpuid(&p);
        let vmx = Arc::new(MockVmx::new());
        let e820 = HostE820::new([
            E820Entry::new(0, 0x9f000, E820Type::Ram),
            E820Entry::new(0x10_0000, 0x3ff0_0000, E820Type::Ram),
            E820Entry::new(0x1_0000_0000, 0x3000_0000, E820Type::Ram),
        ]);
        let hv = Hypervisor::new(p.clone(), vmx.clone(), Some(p.clone()), HvOptions::default(), e820);
        hv.timebase.calibrate_tsc(&*p).unwrap();
        Self {
            hv: Arc::new(hv),
            p,
            vmx,
        }
    }

    pub fn vm(&self, vm_id: VmId) -> Arc<Vm> {
        self.hv.vm(vm_id).expect("vm is not installed")
    }

    /// Run `f` on vCPU `vcpu_id` of `vm` with its VMCS current.
    pub fn with_vcpu<R>(&self, vm: &Vm, vcpu_id: usize, f: impl FnOnce(&mut VCpuContext) -> R) -> R {
        let vcpu = vm.vcpu(vcpu_id).expect("no such vcpu");
        let mut arch = vcpu.arch();
        let vmcs = arch.vmcs.activate(&*self.hv.vmx).unwrap();
        let mut ctx = VCpuContext {
            hv: &self.hv,
            vm,
            vcpu,
            arch: &mut arch,
            vmcs,
        };
        f(&mut ctx)
    }

    fn pio(&self, vm: &Vm, port: u16, direction: IoDirection, value: u32) -> u32 {
        let mut req = PioRequest {
            port,
            width: IoWidth::Byte,
            direction,
            value,
        };
        emulate_io(&self.hv, vm, vm.bsp().unwrap(), &mut req);
        req.value
    }

    /// `out` of one byte from the BSP of `vm`.
    pub fn pio_out(&self, vm: &Vm, port: u16, value: u8) {
        self.pio(vm, port, IoDirection::Out, value as u32);
    }

    /// `in` of one byte on the BSP of `vm`.
    pub fn pio_in(&self, vm: &Vm, port: u16) -> u32 {
        self.pio(vm, port, IoDirection::In, 0)
    }
}

/// Wake vCPU 1 of a started `vm` the way its BSP does: INIT, then STARTUP
/// at 0x9f000.
pub fn wake_ap(h: &Harness, vm: &Vm) {
    let bsp = vm.bsp().expect("no bsp");
    mmio_write(&h.hv, vm, bsp, APIC_OFFSET_ICR_HI, 1 << 24);
    mmio_write(&h.hv, vm, bsp, APIC_OFFSET_ICR_LOW, ICR_LEVEL_ASSERT | ICR_DELIVERY_INIT);
    mmio_write(
        &h.hv,
        vm,
        bsp,
        APIC_OFFSET_ICR_LOW,
        ICR_LEVEL_ASSERT | ICR_DELIVERY_STARTUP | 0x9f,
    );
}

/// A vCPU that belongs to no VM.
pub fn standalone_vcpu() -> VCpu {
    let p = MockPlatform::new();
    host_cpuid(&p);
    let arch = VCpuArch::new(
        Box::new(Vmcs::new(1)),
        CpuidCache::new(&p, &VM_CONFIGS[0]),
        Box::new(MsrBitmap::new()),
        StartupState::WaitForSipi,
    );
    VCpu::new(0, 0, 0, VLapic::create(0, 0, &SOFTWARE_APICV), arch)
}
