//! # Relay Bus Transport Layer
//!
//! Delivery of full-state command bytes to the relay hardware over a
//! shared two-wire bus.
//!
//! The physical transport is an opaque open/write/close primitive behind
//! the [`BusDevice`] trait; the shipped implementation targets Linux I2C
//! character devices (`/dev/i2c-*`) through the `i2cdev` crate, matching
//! the MOD-IO board (bus address `0x58`, command register `0x10`).
//!
//! [`BusTransport`] owns the retry behavior and the exclusivity invariant:
//! each logical send is one atomic acquire-write-release transaction, and
//! a second logical send never interleaves with one in flight. The guard
//! covers the whole transaction including backoff sleeps, so a send that
//! is still retrying blocks later sends rather than racing them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_coupler::bus::{BusTransport, I2cRelayDevice, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = I2cRelayDevice::new("/dev/i2c-1", 0x58, 0x10);
//!     let transport = BusTransport::new(
//!         Box::new(device),
//!         RetryPolicy::bounded(5, Duration::from_millis(100)),
//!     );
//!
//!     // switch relay 0 on, all others off
//!     transport.send(0x01).await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;
use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::error::BusError;

/// Opaque bus device primitive: acquire, write one command byte, release
///
/// Implementations must treat `write` as fire-and-forget: the relay
/// hardware never acknowledges which state it holds, only receipt of the
/// byte. The transport layers retry and exclusivity on top of this.
pub trait BusDevice: Send {
    /// Acquire the device for one transaction
    fn open(&mut self) -> Result<(), BusError>;

    /// Write one full-state command byte
    fn write(&mut self, code: u8) -> Result<(), BusError>;

    /// Release the device
    fn close(&mut self) -> Result<(), BusError>;
}

/// MOD-IO relay board behind a Linux I2C character device
///
/// Follows the board's command framing: every write is the pair
/// `[command_register, code]` addressed to the board's fixed bus address.
/// The device node is opened per transaction and released afterwards.
pub struct I2cRelayDevice {
    path: String,
    bus_address: u16,
    command_register: u8,
    device: Option<LinuxI2CDevice>,
}

impl I2cRelayDevice {
    /// Create a device handle; nothing is opened until the first transaction
    pub fn new(path: &str, bus_address: u16, command_register: u8) -> Self {
        Self {
            path: path.to_string(),
            bus_address,
            command_register,
            device: None,
        }
    }

    /// Device node path
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl BusDevice for I2cRelayDevice {
    fn open(&mut self) -> Result<(), BusError> {
        let device = LinuxI2CDevice::new(&self.path, self.bus_address)
            .map_err(|e| BusError::device(format!("Failed to open {}: {}", self.path, e)))?;
        self.device = Some(device);
        Ok(())
    }

    fn write(&mut self, code: u8) -> Result<(), BusError> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| BusError::device("Device not open"))?;

        device
            .write(&[self.command_register, code])
            .map_err(|e| BusError::transient(format!("I2C write failed: {}", e)))
    }

    fn close(&mut self) -> Result<(), BusError> {
        // dropping the handle releases the file descriptor
        self.device = None;
        Ok(())
    }
}

/// Retry policy for bus transactions
///
/// The legacy behavior is an unbounded retry loop; a bounded policy with
/// backoff is the recommended configuration so a dead bus degrades the
/// coupler instead of wedging it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry until the write succeeds or the process terminates
    Unbounded {
        /// Base delay between attempts, multiplied by the attempt number
        backoff: Duration,
    },
    /// Give up with `BusError::Unavailable` after `max_attempts` attempts
    Bounded {
        max_attempts: u32,
        /// Base delay between attempts, multiplied by the attempt number
        backoff: Duration,
    },
}

impl RetryPolicy {
    /// Retry forever with the given base backoff
    pub fn unbounded(backoff: Duration) -> Self {
        Self::Unbounded { backoff }
    }

    /// Retry at most `max_attempts` times with the given base backoff
    pub fn bounded(max_attempts: u32, backoff: Duration) -> Self {
        Self::Bounded {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    fn backoff_after(&self, attempt: u32) -> Duration {
        let base = match self {
            Self::Unbounded { backoff } => *backoff,
            Self::Bounded { backoff, .. } => *backoff,
        };
        base * attempt
    }

    fn is_exhausted(&self, attempt: u32) -> bool {
        match self {
            Self::Unbounded { .. } => false,
            Self::Bounded { max_attempts, .. } => attempt >= *max_attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(5, Duration::from_millis(100))
    }
}

/// Bus transport statistics
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    /// Logical sends that completed successfully
    pub sends: u64,
    /// Physical write attempts, including failed ones
    pub attempts: u64,
    /// Failed physical attempts
    pub failures: u64,
    /// Logical sends abandoned after policy exhaustion
    pub exhausted: u64,
}

struct BusInner {
    device: Box<dyn BusDevice>,
    stats: BusStats,
}

/// Exclusive, retrying command-byte channel to the relay hardware
///
/// Holds the device behind an async mutex so the acquire-write-release
/// sequence of one logical send can never interleave with another, even
/// if the hosting process grows concurrent callers.
pub struct BusTransport {
    inner: Mutex<BusInner>,
    policy: RetryPolicy,
}

impl BusTransport {
    /// Create a transport over a device with the given retry policy
    pub fn new(device: Box<dyn BusDevice>, policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                device,
                stats: BusStats::default(),
            }),
            policy,
        }
    }

    /// The configured retry policy
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Deliver one full-state command byte
    ///
    /// Exactly one physical write happens per successful send; zero or
    /// more failed attempts may precede it. Callers must pass the *latest*
    /// bank encoding on every call so that whichever attempt the hardware
    /// finally accepts carries the freshest intent.
    ///
    /// Returns `BusError::Unavailable` only when a bounded policy is
    /// exhausted; with an unbounded policy this blocks until success.
    pub async fn send(&self, code: u8) -> Result<(), BusError> {
        let mut inner = self.inner.lock().await;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            inner.stats.attempts += 1;

            match Self::transact(inner.device.as_mut(), code) {
                Ok(()) => {
                    inner.stats.sends += 1;
                    debug!("Bus send 0x{:02X} succeeded on attempt {}", code, attempt);
                    return Ok(());
                }
                Err(error) => {
                    inner.stats.failures += 1;
                    warn!(
                        "Bus send 0x{:02X} attempt {} failed: {}",
                        code, attempt, error
                    );

                    if self.policy.is_exhausted(attempt) {
                        inner.stats.exhausted += 1;
                        return Err(BusError::Unavailable { attempts: attempt });
                    }

                    let delay = self.policy.backoff_after(attempt);
                    if !delay.is_zero() {
                        // deliberately keeps the transaction lock across the
                        // backoff: the retry is part of the same logical send
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Get transport statistics
    pub async fn stats(&self) -> BusStats {
        self.inner.lock().await.stats.clone()
    }

    /// One atomic acquire-write-release cycle
    fn transact(device: &mut dyn BusDevice, code: u8) -> Result<(), BusError> {
        device.open()?;
        let result = device.write(code);
        // release even when the write failed; the close error only
        // matters if the write itself went through
        let closed = device.close();
        result.and(closed)
    }
}
