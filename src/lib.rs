//! # Relay Coupler - Modbus TCP to Relay Bank Bridge
//!
//! A coupler between a Modbus TCP server and a stateless, write-only
//! relay board (MOD-IO class) reachable over a shared I2C bus. Clients
//! switch relays one coil or register at a time; the hardware only
//! accepts a single command byte encoding the state of *all* relays at
//! once and cannot be read back. The coupler keeps the authoritative
//! relay state in memory, re-encodes the full bank on every mutation,
//! and delivers it over the bus with explicit retry and exclusivity
//! guarantees.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Modbus Client  │  write coil/register, read back
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │  ModbusTcpServer│───►│    DataStore    │  reads served here
//! └─────────────────┘    └─────────────────┘
//!          │ writes                ▲ mirror
//! ┌─────────────────┐    ┌─────────────────┐
//! │   RelayBridge   │───►│    RelayBank    │  authoritative state
//! └─────────────────┘    └─────────────────┘
//!          │ full-state command byte
//! ┌─────────────────┐    ┌─────────────────┐
//! │   BusTransport  │───►│  I2cRelayDevice │  /dev/i2c-1 @ 0x58
//! └─────────────────┘    └─────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - The command byte is always a full, consistent snapshot of the bank;
//!   partial-state commands are never sent.
//! - One logical send is one atomic acquire-write-release transaction;
//!   sends never interleave on the shared bus.
//! - Retries always carry the latest bank encoding, never a stale one
//!   (the hardware cannot tell us which byte it last adopted).
//! - Validation failures never reach the hardware; bus failures never
//!   corrupt the in-memory register.
//! - Startup and shutdown force every relay OFF and transmit once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_coupler::{
//!     BusTransport, CouplerConfig, DataStore, I2cRelayDevice, ModbusServer,
//!     ModbusTcpServer, ModbusTcpServerConfig, RelayBank, RelayBridge,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CouplerConfig::default();
//!
//!     let bank = Arc::new(RelayBank::with_relay_count(config.relay_count)?);
//!     let store = Arc::new(DataStore::with_block_size(config.data_block_size));
//!     let device = I2cRelayDevice::new(
//!         &config.device_path,
//!         config.bus_address,
//!         config.command_register,
//!     );
//!     let transport = Arc::new(BusTransport::new(
//!         Box::new(device),
//!         config.retry.to_policy(),
//!     ));
//!     let bridge = Arc::new(RelayBridge::new(
//!         bank,
//!         transport,
//!         config.build_address_map()?,
//!         store.clone(),
//!         config.degraded_policy,
//!     ));
//!
//!     // all relays OFF before accepting writes
//!     bridge.startup().await?;
//!
//!     let mut server = ModbusTcpServer::with_config(ModbusTcpServerConfig {
//!         bind_address: config.bind_socket_addr()?,
//!         data_store: Some(store),
//!         write_observer: Some(bridge.clone()),
//!         ..Default::default()
//!     })?;
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Authoritative relay state register and command-byte codec
pub mod relay_bank;

/// Hardware bus transport with retry policy and transaction exclusivity
pub mod bus;

/// Protocol address to relay index mapping
pub mod address_map;

/// Write-path orchestration between the protocol server and the bus
pub mod bridge;

/// Thread-safe Modbus data store for server reads and the relay mirror
pub mod data_store;

/// Modbus TCP server implementation
pub mod server;

/// Configuration loading and validation
pub mod config;

// Re-export main types for convenience
pub use error::{BusError, CouplerError, CouplerResult};
pub use protocol::{ModbusException, ModbusFunction};
pub use relay_bank::{RelayBank, DEFAULT_RELAY_COUNT, MAX_RELAYS};
pub use bus::{BusDevice, BusStats, BusTransport, I2cRelayDevice, RetryPolicy};
pub use address_map::AddressMap;
pub use bridge::{BridgeStats, DegradedPolicy, RelayBridge, WriteObserver, WriteOutcome};
pub use data_store::{DataStore, DataStoreStats};
pub use server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use config::{AddressMapConfig, CouplerConfig, IdentityConfig, RetryConfig};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default MOD-IO bus address
pub const DEFAULT_BUS_ADDRESS: u16 = 0x58;

/// Default MOD-IO relay command register
pub const DEFAULT_COMMAND_REGISTER: u8 = 0x10;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
