//! # Relay Bridge
//!
//! The write-path orchestrator that ties the Modbus surface to the relay
//! hardware. Every decoded write event flows through one pass of the
//! state machine:
//!
//! ```text
//! Resolving   -> address map lookup, value coercion   (reject on failure)
//! Mutating    -> relay bank mutation, new encoding    (in memory only)
//! Transmitting-> bus transport send                   (retry per policy)
//! Mirroring   -> data store update at the address     (read-back source)
//! ```
//!
//! Rejected writes touch nothing. A transmit failure after bounded
//! retries lands in the degraded path, where [`DegradedPolicy`] decides
//! whether the in-memory intent is kept (default; the next retry carries
//! it) or rolled back so the write fails end-to-end.
//!
//! The bridge is registered with the protocol server as a
//! [`WriteObserver`] rather than subclassing anything on the server side;
//! the server invokes it once per inbound write, synchronously from its
//! connection task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use async_trait::async_trait;
use log::{error, info, warn};

use crate::address_map::AddressMap;
use crate::bus::BusTransport;
use crate::data_store::DataStore;
use crate::error::{CouplerError, CouplerResult};
use crate::protocol::ModbusFunction;
use crate::relay_bank::RelayBank;

/// Observer invoked by the protocol server for every inbound write
///
/// `values` carries the decoded payload: one element per written
/// coil/register, coils already decoded to 0/1.
#[async_trait]
pub trait WriteObserver: Send + Sync {
    async fn on_write(
        &self,
        function: ModbusFunction,
        address: u16,
        values: &[u16],
    ) -> CouplerResult<WriteOutcome>;
}

/// Terminal state of one write-path pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Relay bank mutated, hardware updated, mirror updated
    Accepted,
    /// Relay bank (and mirror) hold the intent but hardware delivery
    /// failed after the bounded retry budget
    Degraded,
}

/// What to do with the in-memory state when transmission fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Keep the mutation; the next send carries the freshest intent.
    /// The write is reported accepted and a degraded health flag raised.
    #[default]
    KeepState,
    /// Restore the pre-mutation state and fail the write end-to-end
    RollBack,
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub accepted: u64,
    pub rejected: u64,
    pub degraded: u64,
    pub rolled_back: u64,
}

/// Write-path orchestrator between the Modbus server and the relay bus
pub struct RelayBridge {
    bank: Arc<RelayBank>,
    transport: Arc<BusTransport>,
    map: AddressMap,
    store: Arc<DataStore>,
    degraded_policy: DegradedPolicy,
    degraded: AtomicBool,
    stats: StdMutex<BridgeStats>,
}

impl RelayBridge {
    /// Create a bridge over explicitly owned collaborators
    pub fn new(
        bank: Arc<RelayBank>,
        transport: Arc<BusTransport>,
        map: AddressMap,
        store: Arc<DataStore>,
        degraded_policy: DegradedPolicy,
    ) -> Self {
        Self {
            bank,
            transport,
            map,
            store,
            degraded_policy,
            degraded: AtomicBool::new(false),
            stats: StdMutex::new(BridgeStats::default()),
        }
    }

    /// The relay bank this bridge mutates
    pub fn bank(&self) -> &Arc<RelayBank> {
        &self.bank
    }

    /// True while the last hardware transmission failed
    ///
    /// Cleared by the next fully successful send.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Get bridge statistics
    pub fn get_stats(&self) -> BridgeStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Force every relay OFF and transmit once
    ///
    /// Called before the server accepts writes. A failure here leaves the
    /// bridge degraded but the bank already holds the all-OFF intent, so
    /// the first successful transmission restores a known hardware state.
    pub async fn startup(&self) -> CouplerResult<()> {
        info!("Forcing all relays OFF at startup");
        self.transmit_all(false).await
    }

    /// Force every relay OFF and transmit once, best effort
    ///
    /// Shutdown failure is logged, never fatal; the process must still
    /// exit.
    pub async fn shutdown(&self) {
        info!("Forcing all relays OFF at shutdown");
        if let Err(e) = self.transmit_all(false).await {
            error!("Shutdown all-OFF transmission failed: {}", e);
        }
    }

    /// Switch every relay at once (maintenance surface)
    pub async fn set_all(&self, on: bool) -> CouplerResult<()> {
        self.transmit_all(on).await
    }

    async fn transmit_all(&self, on: bool) -> CouplerResult<()> {
        let code = self.bank.set_all(on);
        match self.transport.send(code).await {
            Ok(()) => {
                self.degraded.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.degraded.store(true, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Extract the single meaningful value from a write event
    ///
    /// Only single-value writes map onto one relay; batch writes would
    /// need their own coalescing rules and are rejected.
    fn single_value(function: ModbusFunction, values: &[u16]) -> CouplerResult<u16> {
        if !function.is_write_function() {
            return Err(CouplerError::unsupported_write_shape(format!(
                "{} is not a write",
                function
            )));
        }
        match values {
            [value] => Ok(*value),
            _ => Err(CouplerError::unsupported_write_shape(format!(
                "Expected exactly one value, got {}",
                values.len()
            ))),
        }
    }

    fn record<F: FnOnce(&mut BridgeStats)>(&self, f: F) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

#[async_trait]
impl WriteObserver for RelayBridge {
    async fn on_write(
        &self,
        function: ModbusFunction,
        address: u16,
        values: &[u16],
    ) -> CouplerResult<WriteOutcome> {
        // Resolving: validation failures reject the write with nothing
        // mutated, on hardware or in memory
        let resolved = Self::single_value(function, values)
            .and_then(|value| self.map.resolve(address).map(|relay| (relay, value)));
        let (relay, value) = match resolved {
            Ok(pair) => pair,
            Err(e) => {
                self.record(|s| s.rejected += 1);
                warn!("Write to address {} rejected: {}", address, e);
                return Err(e);
            }
        };

        // Mutating: 0 is OFF, anything else is ON. The prior state of
        // this one relay is captured atomically with the mutation so a
        // roll-back never touches bits owned by concurrent writers.
        let on = value != 0;
        let (prior, code) = match self.bank.swap_relay(relay, on) {
            Ok(pair) => pair,
            Err(e) => {
                self.record(|s| s.rejected += 1);
                warn!("Write to relay {} rejected: {}", relay, e);
                return Err(e);
            }
        };
        info!(
            "{} address {} -> relay {} {}, bank encoding 0x{:02X}",
            function,
            address,
            relay,
            if on { "ON" } else { "OFF" },
            code
        );

        // Transmitting
        match self.transport.send(code).await {
            Ok(()) => {
                // Mirroring: read-back now reflects the accepted value
                self.store.mirror_relay_value(address, on)?;
                self.degraded.store(false, Ordering::Relaxed);
                self.record(|s| s.accepted += 1);
                Ok(WriteOutcome::Accepted)
            }
            Err(bus_error) => match self.degraded_policy {
                DegradedPolicy::KeepState => {
                    // the bank keeps the freshest intent; the next send
                    // (retry or new write) will carry it to the hardware
                    self.store.mirror_relay_value(address, on)?;
                    self.degraded.store(true, Ordering::Relaxed);
                    self.record(|s| s.degraded += 1);
                    warn!(
                        "Relay {} write degraded, keeping in-memory state: {}",
                        relay, bus_error
                    );
                    Ok(WriteOutcome::Degraded)
                }
                DegradedPolicy::RollBack => {
                    // undo this write's bit only; relays accepted by
                    // concurrent writers since the capture must survive
                    if let Err(restore_err) = self.bank.set_relay(relay, prior) {
                        error!("Roll-back of relay {} failed: {}", relay, restore_err);
                    }
                    self.degraded.store(true, Ordering::Relaxed);
                    self.record(|s| s.rolled_back += 1);
                    warn!(
                        "Relay {} write rolled back after bus failure: {}",
                        relay, bus_error
                    );
                    Err(bus_error.into())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusDevice, RetryPolicy};
    use crate::error::BusError;
    use std::sync::Mutex as SyncMutex;
    use std::time::Duration;

    /// Device that fails the first `failures` writes and logs the rest
    struct ScriptedDevice {
        failures: u32,
        writes: Arc<SyncMutex<Vec<u8>>>,
    }

    impl BusDevice for ScriptedDevice {
        fn open(&mut self) -> Result<(), BusError> {
            Ok(())
        }
        fn write(&mut self, code: u8) -> Result<(), BusError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(BusError::transient("scripted failure"));
            }
            self.writes.lock().unwrap().push(code);
            Ok(())
        }
        fn close(&mut self) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn make_bridge(
        failures: u32,
        max_attempts: u32,
        policy: DegradedPolicy,
    ) -> (RelayBridge, Arc<SyncMutex<Vec<u8>>>) {
        let writes = Arc::new(SyncMutex::new(Vec::new()));
        let device = ScriptedDevice {
            failures,
            writes: writes.clone(),
        };
        let transport = Arc::new(BusTransport::new(
            Box::new(device),
            RetryPolicy::bounded(max_attempts, Duration::ZERO),
        ));
        let bridge = RelayBridge::new(
            Arc::new(RelayBank::new()),
            transport,
            AddressMap::window(0, 4).unwrap(),
            Arc::new(DataStore::new()),
            policy,
        );
        (bridge, writes)
    }

    #[tokio::test]
    async fn test_accepted_write_end_to_end() {
        let (bridge, writes) = make_bridge(0, 3, DegradedPolicy::KeepState);

        let outcome = bridge
            .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Accepted);
        assert_eq!(bridge.bank().get(0).unwrap(), true);
        assert_eq!(*writes.lock().unwrap(), vec![0x01]);
        assert!(!bridge.is_degraded());
        assert_eq!(bridge.get_stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_rejected_write_touches_nothing() {
        let (bridge, writes) = make_bridge(0, 3, DegradedPolicy::KeepState);

        let err = bridge
            .on_write(ModbusFunction::WriteSingleCoil, 99, &[1])
            .await
            .unwrap_err();

        assert!(matches!(err, CouplerError::AddressOutOfRange { address: 99 }));
        assert_eq!(bridge.bank().encode(), 0x00);
        assert!(writes.lock().unwrap().is_empty());
        assert_eq!(bridge.get_stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_multi_value_write_rejected() {
        let (bridge, writes) = make_bridge(0, 3, DegradedPolicy::KeepState);

        let err = bridge
            .on_write(ModbusFunction::WriteMultipleRegisters, 0, &[1, 0])
            .await
            .unwrap_err();

        assert!(matches!(err, CouplerError::UnsupportedWriteShape { .. }));
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_function_rejected() {
        let (bridge, _) = make_bridge(0, 3, DegradedPolicy::KeepState);

        let err = bridge
            .on_write(ModbusFunction::ReadCoils, 0, &[1])
            .await
            .unwrap_err();
        assert!(matches!(err, CouplerError::UnsupportedWriteShape { .. }));
    }

    #[tokio::test]
    async fn test_degraded_keeps_state() {
        let (bridge, writes) = make_bridge(10, 3, DegradedPolicy::KeepState);

        let outcome = bridge
            .on_write(ModbusFunction::WriteSingleCoil, 2, &[1])
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Degraded);
        // the register, not the hardware, is the source of truth
        assert_eq!(bridge.bank().get(2).unwrap(), true);
        assert!(writes.lock().unwrap().is_empty());
        assert!(bridge.is_degraded());
        assert_eq!(bridge.get_stats().degraded, 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_state() {
        let (bridge, writes) = make_bridge(0, 3, DegradedPolicy::RollBack);

        // first write succeeds and sets relay 1
        bridge
            .on_write(ModbusFunction::WriteSingleCoil, 1, &[1])
            .await
            .unwrap();
        assert_eq!(*writes.lock().unwrap(), vec![0x02]);

        // rebuild with a dead bus but the same bank state
        let (dead, _) = make_bridge(10, 3, DegradedPolicy::RollBack);
        dead.bank().restore(0x02);

        let err = dead
            .on_write(ModbusFunction::WriteSingleCoil, 3, &[1])
            .await
            .unwrap_err();
        assert!(err.is_bus_error());
        assert_eq!(dead.bank().encode(), 0x02);
        assert!(dead.is_degraded());
        assert_eq!(dead.get_stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_rollback_spares_concurrent_write() {
        // one connection task per client means two writes can overlap:
        // a failing roll-back must not erase a relay another client's
        // accepted write switched while the first held the bus
        let writes = Arc::new(SyncMutex::new(Vec::new()));
        let device = ScriptedDevice {
            failures: 3,
            writes: writes.clone(),
        };
        let transport = Arc::new(BusTransport::new(
            Box::new(device),
            RetryPolicy::bounded(3, Duration::from_millis(25)),
        ));
        let bridge = Arc::new(RelayBridge::new(
            Arc::new(RelayBank::new()),
            transport,
            AddressMap::window(0, 4).unwrap(),
            Arc::new(DataStore::new()),
            DegradedPolicy::RollBack,
        ));

        let failing = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
                    .await
            })
        };
        // let the first write enter its retry cycle, then switch another
        // relay while the bus is still held
        tokio::time::sleep(Duration::from_millis(10)).await;
        let concurrent = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_write(ModbusFunction::WriteSingleCoil, 1, &[1])
                    .await
            })
        };

        assert!(failing.await.unwrap().is_err());
        assert_eq!(concurrent.await.unwrap().unwrap(), WriteOutcome::Accepted);

        // the roll-back undid relay 0 only; relay 1 keeps its accepted state
        assert_eq!(bridge.bank().get(0).unwrap(), false);
        assert_eq!(bridge.bank().get(1).unwrap(), true);
        assert_eq!(*writes.lock().unwrap(), vec![0b11]);
        assert_eq!(bridge.get_stats().rolled_back, 1);
        assert_eq!(bridge.get_stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_bank_bound_rejection_counts() {
        // a map wider than the bank: address 5 resolves, relay 5 does not
        let writes = Arc::new(SyncMutex::new(Vec::new()));
        let device = ScriptedDevice {
            failures: 0,
            writes: writes.clone(),
        };
        let transport = Arc::new(BusTransport::new(
            Box::new(device),
            RetryPolicy::bounded(3, Duration::ZERO),
        ));
        let bridge = RelayBridge::new(
            Arc::new(RelayBank::new()),
            transport,
            AddressMap::window(0, 8).unwrap(),
            Arc::new(DataStore::new()),
            DegradedPolicy::KeepState,
        );

        let err = bridge
            .on_write(ModbusFunction::WriteSingleCoil, 5, &[1])
            .await
            .unwrap_err();

        assert!(matches!(err, CouplerError::InvalidRelayIndex { index: 5, count: 4 }));
        assert!(writes.lock().unwrap().is_empty());
        assert_eq!(bridge.get_stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_retry_carries_latest_encoding() {
        // two failures then success within one logical send: the byte the
        // hardware finally receives is the post-mutation encoding
        let (bridge, writes) = make_bridge(2, 3, DegradedPolicy::KeepState);

        let outcome = bridge
            .on_write(ModbusFunction::WriteSingleRegister, 1, &[1])
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Accepted);
        assert_eq!(*writes.lock().unwrap(), vec![0x02]);
    }

    #[tokio::test]
    async fn test_success_clears_degraded_flag() {
        let (bridge, _) = make_bridge(3, 3, DegradedPolicy::KeepState);

        bridge
            .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
            .await
            .unwrap();
        assert!(bridge.is_degraded());

        // bus has recovered; the next write succeeds and clears the flag
        bridge
            .on_write(ModbusFunction::WriteSingleCoil, 0, &[0])
            .await
            .unwrap();
        assert!(!bridge.is_degraded());
    }

    #[tokio::test]
    async fn test_startup_transmits_all_off() {
        let (bridge, writes) = make_bridge(0, 3, DegradedPolicy::KeepState);

        bridge.bank().set_all(true);
        bridge.startup().await.unwrap();

        assert_eq!(bridge.bank().encode(), 0x00);
        assert_eq!(*writes.lock().unwrap(), vec![0x00]);
    }

    #[tokio::test]
    async fn test_shutdown_failure_is_not_fatal() {
        let (bridge, _) = make_bridge(10, 3, DegradedPolicy::KeepState);
        // must not panic or propagate
        bridge.shutdown().await;
        assert_eq!(bridge.bank().encode(), 0x00);
        assert!(bridge.is_degraded());
    }
}
