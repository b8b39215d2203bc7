/// Relay bank state register
///
/// The MOD-IO relay board is stateless and write-only: one command byte
/// carries the desired state of every relay at once, and there is no way
/// to read the state back. This module owns the authoritative in-memory
/// copy of that state so that switching a single relay never clobbers the
/// others.
///
/// The command byte layout follows the board documentation: bit `i` is
/// relay `i` (LSB first), bits above the configured relay count stay zero.
/// The format carries up to 8 relays even though the observed hardware
/// populates 4.

use std::sync::RwLock;
use log::debug;

use crate::error::{CouplerError, CouplerResult};

/// Maximum number of relays the command byte can encode
pub const MAX_RELAYS: usize = 8;

/// Default relay count of the observed MOD-IO hardware
pub const DEFAULT_RELAY_COUNT: usize = 4;

/// Thread-safe register of relay on/off state
///
/// Shared as `Arc<RelayBank>`; all mutation goes through [`set_relay`]
/// and [`set_all`], and every mutation returns the full post-mutation
/// command byte so the caller always transmits a consistent snapshot.
///
/// [`set_relay`]: RelayBank::set_relay
/// [`set_all`]: RelayBank::set_all
#[derive(Debug)]
pub struct RelayBank {
    /// Bitmask of relay state, bit i = relay i
    state: RwLock<u8>,
    /// Number of populated relay slots (1..=8)
    relay_count: usize,
}

impl RelayBank {
    /// Create a bank with the default relay count, all relays OFF
    pub fn new() -> Self {
        Self::with_relay_count(DEFAULT_RELAY_COUNT)
            .expect("default relay count is valid")
    }

    /// Create a bank with a specific relay count, all relays OFF
    pub fn with_relay_count(relay_count: usize) -> CouplerResult<Self> {
        if relay_count == 0 || relay_count > MAX_RELAYS {
            return Err(CouplerError::configuration(format!(
                "Relay count must be 1-{}, got {}",
                MAX_RELAYS, relay_count
            )));
        }

        Ok(Self {
            state: RwLock::new(0),
            relay_count,
        })
    }

    /// Number of populated relay slots
    pub fn relay_count(&self) -> usize {
        self.relay_count
    }

    /// Set one relay and return the full command byte after the mutation
    ///
    /// Pure with respect to hardware: no I/O happens here. Fails with
    /// `InvalidRelayIndex` if `index` is outside the bank; the state is
    /// untouched in that case.
    pub fn set_relay(&self, index: usize, on: bool) -> CouplerResult<u8> {
        if index >= self.relay_count {
            return Err(CouplerError::invalid_relay_index(index, self.relay_count));
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| CouplerError::internal("Failed to lock relay state"))?;

        if on {
            *state |= 1 << index;
        } else {
            *state &= !(1 << index);
        }

        debug!("Relay {} -> {}, bank encoding 0x{:02X}", index, if on { "ON" } else { "OFF" }, *state);
        Ok(*state)
    }

    /// Set one relay, returning its prior state and the new command byte
    ///
    /// Capture and mutation happen under one lock, so the caller can undo
    /// exactly this change later even when other writers have mutated
    /// different relays in between.
    pub fn swap_relay(&self, index: usize, on: bool) -> CouplerResult<(bool, u8)> {
        if index >= self.relay_count {
            return Err(CouplerError::invalid_relay_index(index, self.relay_count));
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| CouplerError::internal("Failed to lock relay state"))?;

        let prior = *state & (1 << index) != 0;
        if on {
            *state |= 1 << index;
        } else {
            *state &= !(1 << index);
        }

        Ok((prior, *state))
    }

    /// Set every relay to the same state and return the command byte
    ///
    /// Used for the forced all-OFF startup/shutdown sequence and the
    /// all-ON maintenance command.
    pub fn set_all(&self, on: bool) -> u8 {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = if on { self.full_mask() } else { 0 };
        debug!("All relays -> {}, bank encoding 0x{:02X}", if on { "ON" } else { "OFF" }, *state);
        *state
    }

    /// Encode the current state as the hardware command byte
    ///
    /// Deterministic function of the current state; the same state always
    /// encodes to the same byte.
    pub fn encode(&self) -> u8 {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Decode a command byte into per-relay state
    ///
    /// Inverse of [`encode`](RelayBank::encode) over the populated slots.
    pub fn decode(&self, code: u8) -> Vec<bool> {
        (0..self.relay_count).map(|i| code & (1 << i) != 0).collect()
    }

    /// Read one relay's state
    pub fn get(&self, index: usize) -> CouplerResult<bool> {
        if index >= self.relay_count {
            return Err(CouplerError::invalid_relay_index(index, self.relay_count));
        }
        Ok(self.encode() & (1 << index) != 0)
    }

    /// Snapshot of every populated slot
    pub fn snapshot(&self) -> Vec<bool> {
        self.decode(self.encode())
    }

    /// Overwrite the whole bank with a previously captured encoding
    ///
    /// Bits above the populated slots are masked off.
    pub fn restore(&self, code: u8) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = code & self.full_mask();
    }

    fn full_mask(&self) -> u8 {
        if self.relay_count == MAX_RELAYS {
            0xFF
        } else {
            (1u8 << self.relay_count) - 1
        }
    }
}

impl Default for RelayBank {
    fn default() -> Self {
        Self::new()
    }
}
