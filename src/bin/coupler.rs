//! Relay coupler daemon
//!
//! Binds a Modbus TCP server, bridges every coil and register write to
//! the relay board over I2C, and serves reads from the mirrored data
//! store. Takes an optional configuration file path (JSON or YAML) as
//! the first argument; without one, the built-in defaults match the
//! deployed hardware.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};

use relay_coupler::{
    BusTransport, CouplerConfig, DataStore, I2cRelayDevice, ModbusServer, ModbusTcpServer,
    ModbusTcpServerConfig, RelayBank, RelayBridge,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            CouplerConfig::from_file(&path)
                .with_context(|| format!("Failed to load configuration from {}", path))?
        }
        None => CouplerConfig::default(),
    };

    info!(
        "{} {} ({} {})",
        config.identity.product_name,
        config.identity.revision,
        config.identity.vendor_name,
        config.identity.product_code
    );
    info!(
        "Relay board: {} @ 0x{:02x}, register 0x{:02x}, {} relays",
        config.device_path, config.bus_address, config.command_register, config.relay_count
    );

    let bank = Arc::new(RelayBank::with_relay_count(config.relay_count)?);
    let store = Arc::new(DataStore::with_block_size(config.data_block_size));
    let device = I2cRelayDevice::new(
        &config.device_path,
        config.bus_address,
        config.command_register,
    );
    let transport = Arc::new(BusTransport::new(
        Box::new(device),
        config.retry.to_policy(),
    ));
    let bridge = Arc::new(RelayBridge::new(
        bank,
        transport.clone(),
        config.build_address_map()?,
        store.clone(),
        config.degraded_policy,
    ));

    // Known baseline before accepting client writes. If the board is not
    // reachable yet the server still comes up and the bridge reports
    // degraded until a write gets through.
    if let Err(e) = bridge.startup().await {
        warn!("Startup transmission failed, continuing degraded: {}", e);
    }

    let mut server = ModbusTcpServer::with_config(ModbusTcpServerConfig {
        bind_address: config.bind_socket_addr()?,
        max_connections: config.max_connections,
        request_timeout: config.request_timeout(),
        data_store: Some(store),
        write_observer: Some(bridge.clone()),
    })?;
    server.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if let Err(e) = server.stop().await {
        error!("Server stop failed: {}", e);
    }

    // Relays OFF on the way out, matching the startup baseline
    bridge.shutdown().await;

    let server_stats = server.get_stats().await;
    let bridge_stats = bridge.get_stats();
    let bus_stats = transport.stats().await;
    info!(
        "Served {} requests from {} connections over {}s",
        server_stats.total_requests, server_stats.connections_count, server_stats.uptime_seconds
    );
    info!(
        "Writes: {} accepted, {} rejected, {} degraded, {} rolled back",
        bridge_stats.accepted, bridge_stats.rejected, bridge_stats.degraded, bridge_stats.rolled_back
    );
    info!(
        "Bus: {} sends, {} attempts, {} failures, {} exhausted",
        bus_stats.sends, bus_stats.attempts, bus_stats.failures, bus_stats.exhausted
    );

    Ok(())
}
