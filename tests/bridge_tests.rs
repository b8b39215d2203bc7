//! Integration tests for the relay coupler
//!
//! These tests run the bridge, bank, transport, and data store together
//! against a scripted bus device, covering the write path end to end
//! without relay hardware.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_coupler::*;

/// Scripted bus device for testing without actual I2C hardware
///
/// Records every command byte it accepts and fails the first
/// `failures_remaining` write attempts with a transient error.
#[derive(Debug, Default)]
struct MockBusState {
    written: Vec<u8>,
    failures_remaining: u32,
    open_calls: u32,
    close_calls: u32,
}

#[derive(Debug, Clone)]
struct MockBusDevice {
    state: Arc<Mutex<MockBusState>>,
}

impl MockBusDevice {
    fn new(failures: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockBusState {
                failures_remaining: failures,
                ..Default::default()
            })),
        }
    }

    fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    fn open_calls(&self) -> u32 {
        self.state.lock().unwrap().open_calls
    }

    fn close_calls(&self) -> u32 {
        self.state.lock().unwrap().close_calls
    }
}

impl BusDevice for MockBusDevice {
    fn open(&mut self) -> Result<(), BusError> {
        self.state.lock().unwrap().open_calls += 1;
        Ok(())
    }

    fn write(&mut self, code: u8) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(BusError::transient("scripted write failure"));
        }
        state.written.push(code);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BusError> {
        self.state.lock().unwrap().close_calls += 1;
        Ok(())
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::bounded(3, Duration::from_millis(1))
}

fn build_bridge(
    device: MockBusDevice,
    policy: DegradedPolicy,
) -> (Arc<RelayBridge>, Arc<DataStore>) {
    let bank = Arc::new(RelayBank::with_relay_count(4).unwrap());
    let store = Arc::new(DataStore::new());
    let transport = Arc::new(BusTransport::new(Box::new(device), fast_retry()));
    let map = AddressMap::window(0, 4).unwrap();
    let bridge = Arc::new(RelayBridge::new(
        bank,
        transport,
        map,
        store.clone(),
        policy,
    ));
    (bridge, store)
}

/// Startup must transmit the all-OFF command byte before anything else
#[tokio::test]
async fn test_startup_transmits_all_off() {
    let device = MockBusDevice::new(0);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    bridge.startup().await.unwrap();

    assert_eq!(device.written(), vec![0x00]);
    assert!(!bridge.is_degraded());
}

/// A coil write reaches the hardware as a full-state byte and reads back
#[tokio::test]
async fn test_write_reaches_hardware_and_mirrors() {
    let device = MockBusDevice::new(0);
    let (bridge, store) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    let outcome = bridge
        .on_write(ModbusFunction::WriteSingleCoil, 2, &[1])
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Accepted);
    assert_eq!(device.written(), vec![0b0000_0100]);

    // read-back from both tables reflects the accepted value
    assert_eq!(store.read_01(2, 1).unwrap(), vec![true]);
    assert_eq!(store.read_03(2, 1).unwrap(), vec![1]);
    assert_eq!(bridge.bank().get(2).unwrap(), true);
}

/// Sequential writes accumulate into the bank encoding
#[tokio::test]
async fn test_sequential_writes_accumulate() {
    let device = MockBusDevice::new(0);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
        .await
        .unwrap();
    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 1, &[1])
        .await
        .unwrap();
    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[0])
        .await
        .unwrap();

    assert_eq!(device.written(), vec![0b01, 0b11, 0b10]);
}

/// A holding register write switches the relay like a coil write
#[tokio::test]
async fn test_register_write_switches_relay() {
    let device = MockBusDevice::new(0);
    let (bridge, store) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    // any non-zero register value means ON
    bridge
        .on_write(ModbusFunction::WriteSingleRegister, 3, &[42])
        .await
        .unwrap();

    assert_eq!(device.written(), vec![0b1000]);
    assert_eq!(store.read_01(3, 1).unwrap(), vec![true]);
}

/// Writes outside the mapped window are rejected before the bus is touched
#[tokio::test]
async fn test_unmapped_address_rejected() {
    let device = MockBusDevice::new(0);
    let (bridge, store) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    let result = bridge
        .on_write(ModbusFunction::WriteSingleCoil, 9, &[1])
        .await;

    assert!(result.is_err());
    assert!(device.written().is_empty());
    assert_eq!(device.open_calls(), 0);
    assert_eq!(store.read_01(0, 4).unwrap(), vec![false; 4]);
    assert_eq!(bridge.get_stats().rejected, 1);
}

/// Batch writes carrying more than one value are rejected
#[tokio::test]
async fn test_batch_write_rejected() {
    let device = MockBusDevice::new(0);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    let result = bridge
        .on_write(ModbusFunction::WriteMultipleCoils, 0, &[1, 0, 1])
        .await;

    assert!(result.is_err());
    assert!(device.written().is_empty());

    // a batch of exactly one value is a single write
    let outcome = bridge
        .on_write(ModbusFunction::WriteMultipleCoils, 0, &[1])
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Accepted);
    assert_eq!(device.written(), vec![0b01]);
}

/// Two transient failures then success: the write lands on the third attempt
#[tokio::test]
async fn test_retry_until_success() {
    let device = MockBusDevice::new(2);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    let outcome = bridge
        .on_write(ModbusFunction::WriteSingleCoil, 1, &[1])
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Accepted);
    // one byte landed, after three open/close transaction cycles
    assert_eq!(device.written(), vec![0b10]);
    assert_eq!(device.open_calls(), 3);
    assert_eq!(device.close_calls(), 3);
    assert!(!bridge.is_degraded());
}

/// Exhausted retries with KeepState: degraded outcome, state kept
#[tokio::test]
async fn test_exhaustion_keeps_state() {
    let device = MockBusDevice::new(10);
    let (bridge, store) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    let outcome = bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Degraded);
    assert!(bridge.is_degraded());
    assert!(device.written().is_empty());

    // the bank holds the freshest intent and the mirror agrees
    assert_eq!(bridge.bank().encode(), 0b01);
    assert_eq!(store.read_01(0, 1).unwrap(), vec![true]);

    // the next successful write carries the kept intent forward
    {
        let mut state = device.state.lock().unwrap();
        state.failures_remaining = 0;
    }
    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 1, &[1])
        .await
        .unwrap();
    assert_eq!(device.written(), vec![0b11]);
    assert!(!bridge.is_degraded());
}

/// Exhausted retries with RollBack: error returned, state restored
#[tokio::test]
async fn test_exhaustion_rolls_back() {
    let device = MockBusDevice::new(10);
    let (bridge, store) = build_bridge(device.clone(), DegradedPolicy::RollBack);

    let result = bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
        .await;

    assert!(result.is_err());
    assert!(bridge.is_degraded());
    assert_eq!(bridge.bank().encode(), 0x00);
    assert_eq!(store.read_01(0, 1).unwrap(), vec![false]);
    assert_eq!(bridge.get_stats().rolled_back, 1);
}

/// Shutdown forces all relays OFF even after writes switched them on
#[tokio::test]
async fn test_shutdown_transmits_all_off() {
    let device = MockBusDevice::new(0);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
        .await
        .unwrap();
    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 3, &[1])
        .await
        .unwrap();
    bridge.shutdown().await;

    assert_eq!(device.written(), vec![0b0001, 0b1001, 0x00]);
    assert_eq!(bridge.bank().encode(), 0x00);
}

/// The maintenance all-ON command encodes only the populated slots
#[tokio::test]
async fn test_set_all_on() {
    let device = MockBusDevice::new(0);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    bridge.set_all(true).await.unwrap();
    assert_eq!(device.written(), vec![0b0000_1111]);

    bridge.set_all(false).await.unwrap();
    assert_eq!(device.written(), vec![0b0000_1111, 0x00]);
}

/// An explicit address table routes writes to remapped relay indices
#[tokio::test]
async fn test_table_address_map() {
    let device = MockBusDevice::new(0);
    let bank = Arc::new(RelayBank::with_relay_count(4).unwrap());
    let store = Arc::new(DataStore::new());
    let transport = Arc::new(BusTransport::new(Box::new(device.clone()), fast_retry()));
    let map = AddressMap::from_entries(&[(5, 0), (6, 1), (7, 2), (8, 3)], 4).unwrap();
    let bridge = RelayBridge::new(bank, transport, map, store.clone(), DegradedPolicy::KeepState);

    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 7, &[1])
        .await
        .unwrap();

    assert_eq!(device.written(), vec![0b0100]);
    // the mirror lives at the protocol address, not the relay index
    assert_eq!(store.read_01(7, 1).unwrap(), vec![true]);
    assert_eq!(store.read_01(2, 1).unwrap(), vec![false]);

    // addresses below the table are unmapped
    assert!(bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
        .await
        .is_err());
}

/// Concurrent writes all land; the final byte reflects every accepted write
#[tokio::test]
async fn test_concurrent_writes_serialize_on_bus() {
    let device = MockBusDevice::new(0);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    let mut handles = Vec::new();
    for relay in 0..4u16 {
        let bridge = bridge.clone();
        handles.push(tokio::spawn(async move {
            bridge
                .on_write(ModbusFunction::WriteSingleCoil, relay, &[1])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let written = device.written();
    assert_eq!(written.len(), 4);
    // every transmitted byte is a full snapshot; the last one has all
    // four relays ON regardless of interleaving
    assert_eq!(*written.last().unwrap(), 0b0000_1111);
    assert_eq!(bridge.bank().encode(), 0b0000_1111);
}

/// Retry always carries the latest encoding, never the byte that failed
#[tokio::test]
async fn test_retry_carries_latest_intent() {
    // the transport re-sends the code it was given; latest-intent-wins
    // holds because the bridge serializes mutation and send per write,
    // and each new write encodes the full current bank
    let device = MockBusDevice::new(1);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
        .await
        .unwrap();

    // first attempt failed, second landed the same full-state byte
    assert_eq!(device.written(), vec![0b01]);
    assert_eq!(device.open_calls(), 2);
}

/// Bridge statistics reflect accepted and rejected writes
#[tokio::test]
async fn test_stats_track_outcomes() {
    let device = MockBusDevice::new(0);
    let (bridge, _) = build_bridge(device.clone(), DegradedPolicy::KeepState);

    bridge
        .on_write(ModbusFunction::WriteSingleCoil, 0, &[1])
        .await
        .unwrap();
    let _ = bridge
        .on_write(ModbusFunction::WriteSingleCoil, 9, &[1])
        .await;

    let stats = bridge.get_stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.degraded, 0);
    assert_eq!(stats.rolled_back, 0);
}
