//! Frame codecs
//!
//! Two interchangeable framings carry the same PDUs:
//! - RTU: `unit_id` + PDU + CRC-16/Modbus (little-endian). Used on serial
//!   lines and through bridges that tunnel raw serial bytes (ser2net).
//! - MBAP: transaction id + protocol id + length + `unit_id` + PDU, no CRC.
//!   Used through protocol-converting bridges (mbusd).
//!
//! A codec remembers the outstanding request so it can reject responses that
//! belong to a different unit or transaction.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_RTU_FRAME_LEN};
use crate::error::{Result, VigorError};
use crate::pdu::ModbusPdu;

/// Framing performed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Raw RTU frames, CRC included (serial line or tunneling bridge)
    #[default]
    #[serde(alias = "ser2net", alias = "tunnel")]
    Rtu,
    /// Modbus-TCP frames with MBAP header (converting bridge)
    #[serde(alias = "mbusd", alias = "tcp")]
    Mbap,
}

impl FramingMode {
    /// Build a fresh codec for this framing
    pub fn codec(self) -> Box<dyn FrameCodec> {
        match self {
            FramingMode::Rtu => Box::new(RtuCodec::new()),
            FramingMode::Mbap => Box::new(MbapCodec::new()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FramingMode::Rtu => "rtu",
            FramingMode::Mbap => "mbap",
        }
    }

    /// The other framing, used to hint at a bridge-type mismatch
    pub fn alternate(self) -> Self {
        match self {
            FramingMode::Rtu => FramingMode::Mbap,
            FramingMode::Mbap => FramingMode::Rtu,
        }
    }
}

impl std::fmt::Display for FramingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode requests and decode responses for one framing
pub trait FrameCodec: Send + std::fmt::Debug {
    fn mode(&self) -> FramingMode;

    /// Wrap a request PDU for the wire and remember it as outstanding
    fn encode_request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8>;

    /// Unwrap a response frame for the outstanding request
    fn decode_response(&mut self, frame: &[u8]) -> Result<ModbusPdu>;
}

/// RTU codec
#[derive(Debug, Default)]
pub struct RtuCodec {
    expected_unit: Option<u8>,
}

impl RtuCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCodec for RtuCodec {
    fn mode(&self) -> FramingMode {
        FramingMode::Rtu
    }

    fn encode_request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
        self.expected_unit = Some(unit_id);
        build_rtu_frame(unit_id, pdu.as_slice())
    }

    fn decode_response(&mut self, frame: &[u8]) -> Result<ModbusPdu> {
        let (unit_id, pdu) = parse_rtu_frame(frame)?;

        if let Some(expected) = self.expected_unit {
            if unit_id != expected {
                return Err(VigorError::frame(format!(
                    "Unit mismatch: expected {}, got {}",
                    expected, unit_id
                )));
            }
        }
        Ok(pdu)
    }
}

/// MBAP codec
#[derive(Debug)]
pub struct MbapCodec {
    next_transaction_id: u16,
    outstanding: Option<(u16, u8)>,
}

impl MbapCodec {
    pub fn new() -> Self {
        Self {
            next_transaction_id: 1,
            outstanding: None,
        }
    }

    /// Get next transaction ID, wrapping from 0xFFFF to 0x0000
    fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }
}

impl Default for MbapCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for MbapCodec {
    fn mode(&self) -> FramingMode {
        FramingMode::Mbap
    }

    fn encode_request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
        let transaction_id = self.next_transaction_id();
        self.outstanding = Some((transaction_id, unit_id));
        build_mbap_frame(transaction_id, unit_id, pdu.as_slice())
    }

    fn decode_response(&mut self, frame: &[u8]) -> Result<ModbusPdu> {
        let (transaction_id, unit_id, pdu) = parse_mbap_frame(frame)?;

        if let Some((expected_tid, expected_unit)) = self.outstanding {
            if transaction_id != expected_tid {
                return Err(VigorError::TransactionMismatch {
                    expected: expected_tid,
                    actual: transaction_id,
                });
            }
            if unit_id != expected_unit {
                return Err(VigorError::frame(format!(
                    "Unit mismatch: expected {}, got {}",
                    expected_unit, unit_id
                )));
            }
        }
        Ok(pdu)
    }
}

/// Build RTU frame (`unit_id` + PDU + CRC)
pub fn build_rtu_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);

    let crc = calculate_crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    debug!(
        "Building RTU frame: unit_id={}, PDU_len={}, CRC={:04X}",
        unit_id,
        pdu.len(),
        crc
    );
    frame
}

/// Parse RTU frame into unit id and PDU, validating the CRC
pub fn parse_rtu_frame(data: &[u8]) -> Result<(u8, ModbusPdu)> {
    if data.len() < MIN_RTU_FRAME_LEN {
        return Err(VigorError::frame(format!(
            "RTU frame too short: {} bytes",
            data.len()
        )));
    }

    let frame_len = data.len();
    let received_crc = u16::from_le_bytes([data[frame_len - 2], data[frame_len - 1]]);
    let calculated_crc = calculate_crc16(&data[..frame_len - 2]);
    if received_crc != calculated_crc {
        return Err(VigorError::Checksum {
            expected: calculated_crc,
            actual: received_crc,
        });
    }

    let unit_id = data[0];
    let pdu = ModbusPdu::from_slice(&data[1..frame_len - 2])?;
    debug!("RTU frame: unit_id={}, PDU_len={}", unit_id, pdu.len());
    Ok((unit_id, pdu))
}

/// Build MBAP frame (header + `unit_id` + PDU)
pub fn build_mbap_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;

    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);

    debug!(
        "Building MBAP frame: trans_id={:04X}, unit_id={}, PDU_len={}",
        transaction_id,
        unit_id,
        pdu.len()
    );
    frame
}

/// Parse MBAP frame into transaction id, unit id and PDU
pub fn parse_mbap_frame(data: &[u8]) -> Result<(u16, u8, ModbusPdu)> {
    if data.len() < MBAP_HEADER_LEN + 2 {
        return Err(VigorError::frame(format!(
            "MBAP frame too short: {} bytes",
            data.len()
        )));
    }

    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    let protocol_id = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;

    if protocol_id != 0 {
        return Err(VigorError::frame(format!(
            "Invalid protocol ID: expected 0, got {}",
            protocol_id
        )));
    }

    if length < 2 || length > MAX_MBAP_LENGTH || data.len() != MBAP_HEADER_LEN + length {
        return Err(VigorError::frame(format!(
            "Invalid MBAP length: header says {}, frame has {} bytes",
            length,
            data.len()
        )));
    }

    let unit_id = data[MBAP_HEADER_LEN];
    let pdu = ModbusPdu::from_slice(&data[MBAP_HEADER_LEN + 1..])?;
    debug!(
        "MBAP frame: trans_id={:04X}, unit_id={}, PDU_len={}",
        transaction_id,
        unit_id,
        pdu.len()
    );
    Ok((transaction_id, unit_id, pdu))
}

/// Calculate Modbus RTU CRC16 (poly 0xA001, init 0xFFFF)
pub fn calculate_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
