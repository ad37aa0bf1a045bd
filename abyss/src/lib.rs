//! The abyss of the hypervisor that operates hardwares.
//!
//! This crate contains the leaf operations that are irreducibly machine code
//! (`rdtsc`, `in`/`out`, `cpuid`, MSR and ICR access) behind the [`Platform`]
//! trait, together with the boot-time helpers that only need those leaves:
//! the multiboot2 memory map, the timebase and the kernel print sink.
//!
//! [`Platform`]: platform::Platform

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod boot;
pub mod dev;
pub mod interrupt;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod platform;
pub mod timebase;
pub mod x86_64;

pub use spin_lock;

/// Maximum number of CPU this hypervisor can support.
pub const MAX_CPU: usize = 4;
