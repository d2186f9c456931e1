//! Modbus and Vigor device constants
//!
//! Frame-size constants follow the Modbus specification; timing defaults
//! follow what has been tested against Vigor units over RS-485 bridges.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length up to and including the length field
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Smallest valid RTU frame: unit(1) + FC(1) + exception code(1) + CRC(2)
pub const MIN_RTU_FRAME_LEN: usize = 5;

/// Maximum number of registers for FC03/FC04
/// 1 (FC) + 1 (byte count) + N * 2 <= 253 → N <= 125
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// High bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Device Defaults
// ============================================================================

/// Factory slave address of Vigor units
pub const DEFAULT_UNIT_ID: u8 = 20;
pub const DEFAULT_BAUD_RATE: u32 = 19200;
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Spacing enforced before every frame (tested against Vigor units)
pub const DEFAULT_INTER_FRAME_GAP: Duration = Duration::from_millis(150);

/// Spacing between consecutive writes
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_millis(150);

/// Write spacing recommended by the device documentation
pub const DEVICE_RECOMMENDED_WRITE_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_FAILURES_BEFORE_BACKOFF: u32 = 3;
pub const DEFAULT_DIVERGENCE_CYCLES: u32 = 1;
pub const DEFAULT_MAX_BLOCK_GAP: u16 = 1;
