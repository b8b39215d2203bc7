/// Coupler configuration
///
/// One flat configuration structure covering the protocol server, the
/// bus device, and the relay addressing, loadable from JSON or YAML.
/// Every field has a default matching the observed deployment: Modbus
/// TCP on port 502, MOD-IO behind `/dev/i2c-1` at bus address `0x58`
/// with command register `0x10`, four relays addressed zero-based.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::address_map::AddressMap;
use crate::bridge::DegradedPolicy;
use crate::bus::RetryPolicy;
use crate::error::{CouplerError, CouplerResult};
use crate::relay_bank::DEFAULT_RELAY_COUNT;

/// Address map configuration: contiguous window or explicit table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AddressMapConfig {
    /// Relay `i` addressed at `base + i`
    Window { base: u16 },
    /// Explicit `(protocol_address, relay_index)` pairs
    Table { entries: Vec<(u16, usize)> },
}

impl Default for AddressMapConfig {
    fn default() -> Self {
        Self::Window { base: 0 }
    }
}

/// Retry configuration for the bus transport
///
/// `max_attempts: null` selects the legacy unbounded loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            backoff_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Build the transport retry policy
    pub fn to_policy(&self) -> RetryPolicy {
        let backoff = Duration::from_millis(self.backoff_ms);
        match self.max_attempts {
            Some(max) => RetryPolicy::bounded(max, backoff),
            None => RetryPolicy::unbounded(backoff),
        }
    }
}

/// Server identity strings, reported in logs at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub vendor_name: String,
    pub product_code: String,
    pub product_name: String,
    pub revision: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            vendor_name: "Nexedi".to_string(),
            product_code: "Lime2.PLC".to_string(),
            product_name: "Relay Coupler".to_string(),
            revision: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Complete coupler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CouplerConfig {
    /// Modbus TCP bind address
    pub bind_address: String,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Per-request read timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Bus device node path
    pub device_path: String,
    /// I2C bus address of the relay board
    pub bus_address: u16,
    /// Command register carrying the relay state byte
    pub command_register: u8,
    /// Populated relay slots (1-8)
    pub relay_count: usize,
    /// Size of each sequential data-store block
    pub data_block_size: usize,
    /// Protocol address to relay index mapping
    pub address_map: AddressMapConfig,
    /// Bus retry behavior
    pub retry: RetryConfig,
    /// In-memory state policy when transmission fails
    pub degraded_policy: DegradedPolicy,
    /// Identity strings
    pub identity: IdentityConfig,
}

impl Default for CouplerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:502".to_string(),
            max_connections: 32,
            request_timeout_ms: 30_000,
            device_path: "/dev/i2c-1".to_string(),
            bus_address: 0x58,
            command_register: 0x10,
            relay_count: DEFAULT_RELAY_COUNT,
            data_block_size: crate::data_store::DEFAULT_BLOCK_SIZE,
            address_map: AddressMapConfig::default(),
            retry: RetryConfig::default(),
            degraded_policy: DegradedPolicy::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl CouplerConfig {
    /// Load configuration from a JSON or YAML file, by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> CouplerResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CouplerError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> CouplerResult<()> {
        self.bind_socket_addr()?;
        // the address map constructor checks relay range and injectivity
        self.build_address_map()?;

        if let AddressMapConfig::Window { base } = self.address_map {
            if base as usize + self.relay_count > self.data_block_size {
                return Err(CouplerError::configuration(format!(
                    "Address window {}+{} does not fit the data block size {}",
                    base, self.relay_count, self.data_block_size
                )));
            }
        }
        Ok(())
    }

    /// Parsed bind address
    pub fn bind_socket_addr(&self) -> CouplerResult<SocketAddr> {
        self.bind_address
            .parse()
            .map_err(|e| CouplerError::configuration(format!("Invalid bind address: {}", e)))
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Build the address map from configuration
    pub fn build_address_map(&self) -> CouplerResult<AddressMap> {
        match &self.address_map {
            AddressMapConfig::Window { base } => AddressMap::window(*base, self.relay_count),
            AddressMapConfig::Table { entries } => {
                AddressMap::from_entries(entries, self.relay_count)
            }
        }
    }
}
