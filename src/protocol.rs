/// Modbus protocol definitions and data structures
///
/// Server-side subset of the Modbus application protocol: function codes,
/// exception codes, coil constants, and the bit packing used for coil
/// read responses.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{CouplerError, CouplerResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Wire constant for coil ON in write single coil requests
pub const COIL_ON: u16 = 0xFF00;

/// Wire constant for coil OFF in write single coil requests
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> CouplerResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(CouplerError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
        )
    }

    /// Check if this function addresses coils (bit-valued storage)
    pub fn is_coil_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteMultipleCoils
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
}

impl ModbusException {
    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Map a coupler error to the exception code the client should see
    ///
    /// Validation rejections map to the address/value exceptions; bus
    /// failures surface as a server device failure. Anything else is a
    /// device failure too, since the client cannot act on it.
    pub fn from_error(error: &CouplerError) -> Self {
        match error {
            CouplerError::InvalidFunction { .. } => ModbusException::IllegalFunction,
            CouplerError::AddressOutOfRange { .. } => ModbusException::IllegalDataAddress,
            CouplerError::InvalidRelayIndex { .. } => ModbusException::IllegalDataAddress,
            CouplerError::UnsupportedWriteShape { .. } => ModbusException::IllegalDataValue,
            CouplerError::InvalidData { .. } => ModbusException::IllegalDataValue,
            _ => ModbusException::ServerDeviceFailure,
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::ServerDeviceFailure => "Server Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Server Device Busy",
        };
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), name)
    }
}

/// Decode a write single coil value constant
///
/// The specification only allows 0x0000 and 0xFF00; anything else is an
/// illegal data value.
pub fn decode_coil_value(value: u16) -> CouplerResult<bool> {
    match value {
        COIL_OFF => Ok(false),
        COIL_ON => Ok(true),
        _ => Err(CouplerError::invalid_data(format!(
            "Invalid coil value: 0x{:04X}",
            value
        ))),
    }
}

/// Pack a bool slice into the byte layout of coil read responses
///
/// Bit 0 of the first byte is the first coil; trailing bits are zero.
pub fn pack_coils(coils: &[bool]) -> Vec<u8> {
    let byte_count = (coils.len() + 7) / 8;
    let mut packed = vec![0u8; byte_count];

    for (i, &coil) in coils.iter().enumerate() {
        if coil {
            packed[i / 8] |= 1 << (i % 8);
        }
    }

    packed
}

/// Unpack coil bytes from a write multiple coils request
pub fn unpack_coils(data: &[u8], quantity: u16) -> Vec<bool> {
    let mut coils = Vec::with_capacity(quantity as usize);

    for i in 0..quantity as usize {
        let byte_index = i / 8;
        let bit_index = i % 8;
        let value = byte_index < data.len() && (data[byte_index] & (1 << bit_index)) != 0;
        coils.push(value);
    }

    coils
}
