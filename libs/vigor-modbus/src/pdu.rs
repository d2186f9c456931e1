//! Modbus PDU data structure and request/response marshaling
//!
//! Use a fixed-size stack array to avoid heap allocation on the hot path.
//! Only the three function codes the Vigor register map needs are modeled:
//! FC03 (read holding), FC04 (read input) and FC06 (write single register).

use tracing::debug;

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_SINGLE_REGISTER,
    MAX_PDU_SIZE, MODBUS_MAX_READ_REGISTERS,
};
use crate::error::{Result, VigorError};

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    /// Fixed-size buffer (stack)
    data: [u8; MAX_PDU_SIZE],
    /// Actual data length
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(VigorError::frame(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(VigorError::frame("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        let [hi, lo] = value.to_be_bytes();
        self.push(hi)?;
        self.push(lo)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// Bytes after the function code
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.len > 1 {
            &self.data[1..self.len]
        } else {
            &[]
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    /// Exception code carried by an exception response
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
            FC_READ_INPUT_REGISTERS => "Read Input Registers",
            FC_WRITE_SINGLE_REGISTER => "Write Single Register",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical register operation, independent of framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// FC04
    ReadInputRegisters { start: u16, count: u16 },
    /// FC03
    ReadHoldingRegisters { start: u16, count: u16 },
    /// FC06
    WriteSingleRegister { address: u16, value: u16 },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            Request::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            Request::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Request::WriteSingleRegister { .. })
    }

    /// First register touched by this request
    pub fn address(&self) -> u16 {
        match *self {
            Request::ReadInputRegisters { start, .. }
            | Request::ReadHoldingRegisters { start, .. } => start,
            Request::WriteSingleRegister { address, .. } => address,
        }
    }

    /// Build the request PDU
    pub fn to_pdu(&self) -> Result<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        pdu.push(self.function_code())?;
        match *self {
            Request::ReadInputRegisters { start, count }
            | Request::ReadHoldingRegisters { start, count } => {
                if count == 0 || count > MODBUS_MAX_READ_REGISTERS {
                    return Err(VigorError::frame(format!(
                        "Invalid register count {} (1..={})",
                        count, MODBUS_MAX_READ_REGISTERS
                    )));
                }
                pdu.push_u16(start)?;
                pdu.push_u16(count)?;
            },
            Request::WriteSingleRegister { address, value } => {
                pdu.push_u16(address)?;
                pdu.push_u16(value)?;
            },
        }

        debug!(
            "PDU built: FC={:02X} ({}), len={}",
            self.function_code(),
            ModbusPdu::function_code_description(self.function_code()),
            pdu.len()
        );
        Ok(pdu)
    }

    /// Interpret a response PDU against this request
    ///
    /// Exception responses become `DeviceException`; anything structurally
    /// inconsistent with the request becomes a `Frame` error.
    pub fn parse_response(&self, pdu: &ModbusPdu) -> Result<Response> {
        let fc = pdu
            .function_code()
            .ok_or_else(|| VigorError::frame("Empty response PDU"))?;

        if pdu.is_exception() {
            let code = pdu
                .exception_code()
                .ok_or_else(|| VigorError::frame("Exception response without code"))?;
            return Err(VigorError::DeviceException {
                function_code: fc & !EXCEPTION_FLAG,
                code,
            });
        }

        if fc != self.function_code() {
            return Err(VigorError::frame(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                self.function_code(),
                fc
            )));
        }

        let payload = pdu.payload();
        match *self {
            Request::ReadInputRegisters { count, .. }
            | Request::ReadHoldingRegisters { count, .. } => {
                let byte_count = *payload
                    .first()
                    .ok_or_else(|| VigorError::frame("Missing byte count"))?
                    as usize;
                if byte_count != count as usize * 2 || payload.len() != 1 + byte_count {
                    return Err(VigorError::frame(format!(
                        "Register payload mismatch: byte_count={}, payload={}B, expected {} registers",
                        byte_count,
                        payload.len(),
                        count
                    )));
                }
                let registers = payload[1..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(Response::Registers(registers))
            },
            Request::WriteSingleRegister { address, value } => {
                if payload.len() != 4 {
                    return Err(VigorError::frame(format!(
                        "Write echo length {} (expected 4)",
                        payload.len()
                    )));
                }
                let echoed_address = u16::from_be_bytes([payload[0], payload[1]]);
                let echoed_value = u16::from_be_bytes([payload[2], payload[3]]);
                if echoed_address != address || echoed_value != value {
                    return Err(VigorError::frame(format!(
                        "Write echo mismatch: sent {}={}, echoed {}={}",
                        address, value, echoed_address, echoed_value
                    )));
                }
                Ok(Response::WriteAck { address, value })
            },
        }
    }
}

/// Decoded response to a `Request`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    WriteAck { address: u16, value: u16 },
}

impl Response {
    pub fn into_registers(self) -> Result<Vec<u16>> {
        match self {
            Response::Registers(registers) => Ok(registers),
            Response::WriteAck { .. } => Err(VigorError::frame(
                "Expected register data, got write acknowledgment",
            )),
        }
    }
}
