//! Devices.

pub mod x86_64;

/// Error from a device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError(pub &'static str);

/// A byte sink the kernel prints to.
pub trait ConsoleSink: Send + Sync {
    /// Write `bytes` out. Must not block for long; called with a lock held.
    fn write_bytes(&self, bytes: &[u8]);
}

/// The physical console UART.
///
/// Driving the UART itself is outside of the hypervisor core; only the
/// byte-level interface is used.
pub trait ConsoleUart: ConsoleSink {
    /// Fetch one received byte, if any.
    fn getc(&self) -> Option<u8>;
}
