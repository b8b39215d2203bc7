//! # Relay Coupler Error Handling
//!
//! Error types for the whole coupler: protocol-side validation failures,
//! data-store range violations, and hardware bus delivery failures.
//!
//! The taxonomy mirrors the write path. Validation errors
//! ([`CouplerError::AddressOutOfRange`], [`CouplerError::InvalidRelayIndex`],
//! [`CouplerError::UnsupportedWriteShape`]) reject a write before any state
//! or hardware is touched. Bus errors ([`BusError`]) happen after the
//! in-memory relay bank has already accepted the new state; they never
//! corrupt it.
//!
//! ## Recoverability
//!
//! ```rust
//! use relay_coupler::{CouplerError, CouplerResult};
//!
//! fn handle(result: CouplerResult<()>) {
//!     match result {
//!         Ok(()) => {}
//!         Err(error) if error.is_recoverable() => {
//!             // transient bus condition, the next write retries independently
//!         }
//!         Err(error) => {
//!             // validation or configuration problem, retrying cannot help
//!             eprintln!("rejected: {error}");
//!         }
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for coupler operations
pub type CouplerResult<T> = Result<T, CouplerError>;

/// Hardware bus delivery errors
///
/// The relay hardware is write-only: a failed transaction tells us nothing
/// about which command byte, if any, the device currently holds. The
/// transport therefore treats every failure the same way: retry with the
/// *latest* encoding per the configured [`RetryPolicy`](crate::bus::RetryPolicy).
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// A single bus attempt failed (device busy, I/O error); retried per policy
    #[error("Transient bus error: {message}")]
    Transient { message: String },

    /// Bounded retry policy exhausted without a successful write
    #[error("Bus unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    /// The bus device could not be opened or closed
    #[error("Bus device error: {message}")]
    Device { message: String },
}

impl BusError {
    /// Create a transient error from any attempt-level failure
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Create a device open/close error
    pub fn device<S: Into<String>>(message: S) -> Self {
        Self::Device { message: message.into() }
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err.to_string())
    }
}

/// Coupler error types
///
/// Covers the protocol surface (frame and function validation), the relay
/// addressing layer, the data-store mirror, and, via [`BusError`], the
/// hardware side.
#[derive(Error, Debug, Clone)]
pub enum CouplerError {
    /// I/O related errors (network sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Modbus protocol violation
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Unsupported or malformed function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Protocol address has no entry in the address map, or a data-store
    /// access falls outside the configured block
    #[error("Address out of range: {address}")]
    AddressOutOfRange { address: u16 },

    /// Relay index outside the configured bank
    #[error("Invalid relay index: {index} (bank holds {count} relays)")]
    InvalidRelayIndex { index: usize, count: usize },

    /// Write event shape the bridge does not handle (multi-value writes,
    /// non-write function codes)
    #[error("Unsupported write shape: {message}")]
    UnsupportedWriteShape { message: String },

    /// Invalid data value (bad coil constant, malformed payload)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Frame parsing errors (MBAP header, PDU length)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Hardware bus failure, carried up from the transport
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CouplerError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an address out of range error
    pub fn address_out_of_range(address: u16) -> Self {
        Self::AddressOutOfRange { address }
    }

    /// Create an invalid relay index error
    pub fn invalid_relay_index(index: usize, count: usize) -> Self {
        Self::InvalidRelayIndex { index, count }
    }

    /// Create an unsupported write shape error
    pub fn unsupported_write_shape<S: Into<String>>(message: S) -> Self {
        Self::UnsupportedWriteShape { message: message.into() }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// Transient transport conditions may clear; validation and
    /// configuration failures are permanent for a given request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::Bus(_)
        )
    }

    /// Check if the error is a write-validation rejection
    ///
    /// Rejections never reach the relay bank or the hardware layer.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AddressOutOfRange { .. }
                | Self::InvalidRelayIndex { .. }
                | Self::UnsupportedWriteShape { .. }
                | Self::InvalidData { .. }
                | Self::InvalidFunction { .. }
        )
    }

    /// Check if the error originated on the hardware bus
    pub fn is_bus_error(&self) -> bool {
        matches!(self, Self::Bus(_))
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for CouplerError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
impl From<tokio::time::error::Elapsed> for CouplerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for CouplerError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for CouplerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = CouplerError::address_out_of_range(99);
        assert!(err.is_rejection());
        assert!(!err.is_recoverable());

        let err = CouplerError::from(BusError::transient("device busy"));
        assert!(err.is_bus_error());
        assert!(err.is_recoverable());
        assert!(!err.is_rejection());

        let err = CouplerError::invalid_relay_index(8, 4);
        assert!(err.is_rejection());
    }

    #[test]
    fn test_error_display() {
        let err = CouplerError::invalid_relay_index(5, 4);
        let msg = format!("{}", err);
        assert!(msg.contains("5"));
        assert!(msg.contains("4 relays"));

        let err = BusError::Unavailable { attempts: 3 };
        assert!(format!("{}", err).contains("3 attempts"));
    }
}
