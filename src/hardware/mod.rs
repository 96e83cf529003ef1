//! Hardware access layer.
//!
//! The [`Hardware`] trait is the sole doorway to physical I/O: the GPIO chip
//! that drives the relay coils and the I²C buses the power/environmental
//! sensors hang off. Exactly one implementation owns the device handles at a
//! time; everything above this layer speaks in line numbers, register
//! addresses and byte buffers, never in device files.
//!
//! Operations look synchronous to the caller but are serialized per physical
//! resource internally: one in-flight access per GPIO line and per I²C bus.
//! Callers must not hold any cross-component lock across these calls.
//!
//! Implementations:
//! - [`rpi::RpiHardware`]: the real backend (`rppal`), behind the `raspi`
//!   feature.
//! - [`mock::MockHardware`]: in-memory backend used by tests and on hosts
//!   without the device tree.

pub mod mock;
#[cfg(feature = "raspi")]
pub mod rpi;
pub mod watchdog;

pub use mock::MockHardware;
pub use watchdog::Watchdog;

use async_trait::async_trait;
use thiserror::Error;

/// Result alias for hardware operations.
pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// Failures the hardware layer can surface. Transient bus errors and
/// timeouts are retryable at the caller's discretion; `Unavailable` means
/// the device node is missing and usually ends the process at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("Hardware unavailable: {0}")]
    Unavailable(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Hardware operation timed out: {0}")]
    Timeout(String),
}

/// Electrical level of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        matches!(self, Level::High)
    }

    /// The opposite level.
    pub fn toggled(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Physical I/O access. All methods serialize internally per line / per bus.
#[async_trait]
pub trait Hardware: Send + Sync {
    /// Claim `line` as an output, driving it to `initial`. Idempotent: a
    /// second call re-drives the line.
    async fn configure_output(&self, line: u8, initial: Level) -> HwResult<()>;

    /// Drive a previously configured output line.
    async fn write_line(&self, line: u8, level: Level) -> HwResult<()>;

    /// Read the current level of a line. Works for both claimed outputs
    /// (read-back) and unclaimed lines (input snapshot).
    async fn read_line(&self, line: u8) -> HwResult<Level>;

    /// Write `register` then read `len` bytes from the device at `addr`.
    async fn i2c_read(&self, addr: u16, register: u8, len: usize) -> HwResult<Vec<u8>>;

    /// Write `register` followed by `bytes` to the device at `addr`.
    async fn i2c_write(&self, addr: u16, register: u8, bytes: &[u8]) -> HwResult<()>;

    /// Read `len` bytes from `addr` without a preceding register write.
    /// Needed for devices that answer a command issued earlier (SHT30).
    async fn i2c_receive(&self, addr: u16, len: usize) -> HwResult<Vec<u8>>;
}
