//! Spinning synchronization primitives for the hypervisor.
//!
//! The hypervisor runs exactly one execution context per pCPU and never
//! sleeps, so every lock in the system is a busy-waiting lock.
#![cfg_attr(not(test), no_std)]

mod rwlock;
mod smplock;

pub use rwlock::*;
pub use smplock::*;
