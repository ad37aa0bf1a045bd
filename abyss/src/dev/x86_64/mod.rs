//! x86_64 specific devices.

pub mod apic;
pub mod timer;
