/// Modbus data store for server-side reads and the relay mirror
///
/// Thread-safe storage for the four Modbus tables: coils, discrete
/// inputs, holding registers, and input registers. Each table is a
/// fixed-size sequential block starting at address 0 and initialised to
/// zero, sized by configuration (the deployed coupler uses small blocks,
/// ten entries each).
///
/// The bridge mirrors every accepted relay write into this store, so
/// clients reading back a coil or register they just wrote observe the
/// value the relay bank accepted. Reads are served from here directly;
/// the hardware is never consulted.

use std::sync::RwLock;

use crate::error::{CouplerError, CouplerResult};

/// Default block size per table, matching the deployed layout
pub const DEFAULT_BLOCK_SIZE: usize = 10;

/// A fixed-size sequential block of values starting at address 0
#[derive(Debug)]
struct SequentialBlock<T: Copy + Default> {
    values: RwLock<Vec<T>>,
}

impl<T: Copy + Default> SequentialBlock<T> {
    fn new(size: usize) -> Self {
        Self {
            values: RwLock::new(vec![T::default(); size]),
        }
    }

    fn read(&self, address: u16, quantity: u16) -> CouplerResult<Vec<T>> {
        let values = self
            .values
            .read()
            .map_err(|_| CouplerError::internal("Failed to lock data block"))?;

        let start = address as usize;
        let end = start + quantity as usize;
        if quantity == 0 || end > values.len() {
            return Err(CouplerError::address_out_of_range(address));
        }

        Ok(values[start..end].to_vec())
    }

    fn write(&self, address: u16, data: &[T]) -> CouplerResult<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| CouplerError::internal("Failed to lock data block"))?;

        let start = address as usize;
        let end = start + data.len();
        if data.is_empty() || end > values.len() {
            return Err(CouplerError::address_out_of_range(address));
        }

        values[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }
}

/// Thread-safe Modbus data store
///
/// All addressing is 0-based. Accessors follow function-code naming:
/// `read_01` reads coils, `write_05` writes a single coil, and so on.
#[derive(Debug)]
pub struct DataStore {
    coils: SequentialBlock<bool>,
    discrete_inputs: SequentialBlock<bool>,
    holding_registers: SequentialBlock<u16>,
    input_registers: SequentialBlock<u16>,
}

impl DataStore {
    /// Create a store with the default block size for every table
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Create a store with a specific block size for every table
    pub fn with_block_size(size: usize) -> Self {
        Self {
            coils: SequentialBlock::new(size),
            discrete_inputs: SequentialBlock::new(size),
            holding_registers: SequentialBlock::new(size),
            input_registers: SequentialBlock::new(size),
        }
    }

    /// Read coils (function code 0x01)
    pub fn read_01(&self, address: u16, quantity: u16) -> CouplerResult<Vec<bool>> {
        self.coils.read(address, quantity)
    }

    /// Read discrete inputs (function code 0x02)
    pub fn read_02(&self, address: u16, quantity: u16) -> CouplerResult<Vec<bool>> {
        self.discrete_inputs.read(address, quantity)
    }

    /// Read holding registers (function code 0x03)
    pub fn read_03(&self, address: u16, quantity: u16) -> CouplerResult<Vec<u16>> {
        self.holding_registers.read(address, quantity)
    }

    /// Read input registers (function code 0x04)
    pub fn read_04(&self, address: u16, quantity: u16) -> CouplerResult<Vec<u16>> {
        self.input_registers.read(address, quantity)
    }

    /// Write single coil (function code 0x05)
    pub fn write_05(&self, address: u16, value: bool) -> CouplerResult<()> {
        self.coils.write(address, &[value])
    }

    /// Write single holding register (function code 0x06)
    pub fn write_06(&self, address: u16, value: u16) -> CouplerResult<()> {
        self.holding_registers.write(address, &[value])
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_0f(&self, address: u16, values: &[bool]) -> CouplerResult<()> {
        self.coils.write(address, values)
    }

    /// Write multiple holding registers (function code 0x10)
    pub fn write_10(&self, address: u16, values: &[u16]) -> CouplerResult<()> {
        self.holding_registers.write(address, values)
    }

    /// Set a discrete input (out-of-band, for diagnostics)
    pub fn set_discrete_input(&self, address: u16, value: bool) -> CouplerResult<()> {
        self.discrete_inputs.write(address, &[value])
    }

    /// Set an input register (out-of-band, for diagnostics)
    pub fn set_input_register(&self, address: u16, value: u16) -> CouplerResult<()> {
        self.input_registers.write(address, &[value])
    }

    /// Mirror an accepted relay value at its protocol address
    ///
    /// Writes both the coil and the holding register view, so the value
    /// reads back consistently whichever table the client uses.
    pub fn mirror_relay_value(&self, address: u16, on: bool) -> CouplerResult<()> {
        self.write_05(address, on)?;
        self.write_06(address, on as u16)
    }

    /// Get data store statistics
    pub fn get_stats(&self) -> DataStoreStats {
        DataStoreStats {
            coils_size: self.coils.len(),
            discrete_inputs_size: self.discrete_inputs.len(),
            holding_registers_size: self.holding_registers.len(),
            input_registers_size: self.input_registers.len(),
        }
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Data store statistics
#[derive(Debug, Clone)]
pub struct DataStoreStats {
    pub coils_size: usize,
    pub discrete_inputs_size: usize,
    pub holding_registers_size: usize,
    pub input_registers_size: usize,
}
