//! # parvisor
//!
//! A partitioning hypervisor for x86-64.
//!
//! The machine is carved at build time into a fixed set of pre-launched VMs
//! (see [`config::VM_CONFIGS`]). Each VM owns a disjoint subset of pCPUs, a
//! disjoint window of host physical memory and its passthrough PCI functions.
//! Every pCPU runs exactly one vCPU for the lifetime of the system; the only
//! code that runs in the hypervisor is the exit handling of that vCPU.
//!
//! The hardware is reached only through two seams:
//! * [`abyss::platform::Platform`] for TSC, CPUID, port I/O, MSR, ICR and
//!   physical memory;
//! * [`vmx::Vmx`] for the VMX instructions.
//!
//! Everything else is plain Rust and is exercised on the host against the
//! mock implementations of both traits.
//!
//! All process-wide state lives in one [`hv::Hypervisor`] value created by
//! [`boot::init_primary_pcpu`] and passed by reference.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod console;
pub mod dev;
pub mod e820;
pub mod ept;
pub mod errno;
pub mod hv;
pub mod hypercall;
pub mod io;
pub mod irq;
pub mod percpu;
pub mod probe;
pub mod ptirq;
pub mod sched;
pub mod util;
pub mod vboot;
pub mod vcpu;
pub mod vcpuid;
pub mod vcr;
pub mod virq;
pub mod vlapic;
pub mod vm;
pub mod vmexit;
pub mod vmsr;
pub mod vmx;

#[cfg(test)]
mod tests;

pub use errno::Errno;
pub use hv::Hypervisor;

use config::ConfigError;
use ept::EptError;
use vmx::vmcs::{ExitReason, InstructionError};

/// Possible errorkind for Vmx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// Virtual-machine eXtension is not supported.
    VmxNotSupported,
    /// Ept is not supported.
    EptNotSupported,
    /// Current Cr0 value is invalid.
    InvalidCr0,
    /// Current Cr4 value is invalid.
    InvalidCr4,
    /// Vmx is disabled in bios.
    InvalidBiosConfig,
    /// Vmcs operation has an error.
    VmxOperationError(InstructionError),
}

/// Possible errorkind for Vm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Vm operation has error.
    VmxOperationError(InstructionError),
    /// Failed to handle vmexit.
    HandleVmexitFailed(ExitReason),
    /// Failed to decode instruction.
    FailedToDecodeInstruction,
    /// Vcpu related error.
    VCpuError(&'static str),
    /// Guest physical memory could not be mapped.
    Ept(EptError),
    /// The static configuration is unusable.
    Config(ConfigError),
    /// An operation failed with an error number.
    Errno(Errno),
}

impl From<InstructionError> for VmError {
    fn from(e: InstructionError) -> Self {
        Self::VmxOperationError(e)
    }
}

impl From<EptError> for VmError {
    fn from(e: EptError) -> Self {
        Self::Ept(e)
    }
}

impl From<ConfigError> for VmError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<Errno> for VmError {
    fn from(e: Errno) -> Self {
        Self::Errno(e)
    }
}
