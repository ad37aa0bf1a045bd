//! Small helpers shared by the hypervisor.

pub mod bitmap;
pub mod list;
pub mod string;
