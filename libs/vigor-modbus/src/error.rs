//! Engine Error Types
//!
//! One error enum covers the whole engine. Variants fall into four groups:
//! link failures (fatal to the connection), per-request frame failures
//! (retried), device-reported exceptions (surfaced, never retried) and
//! caller-input validation (rejected before any bus traffic).

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, VigorError>;

/// Engine errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VigorError {
    /// Transport cannot be opened or has died; the connection must be reopened
    #[error("Link error: {0}")]
    Link(String),

    /// I/O failure while moving bytes
    #[error("IO error: {0}")]
    Io(String),

    /// No complete response within the request deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected frame
    #[error("Frame error: {0}")]
    Frame(String),

    /// RTU CRC mismatch
    #[error("Checksum error: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    /// MBAP transaction id echoed by the bridge does not match the request
    #[error("Transaction mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Exception response reported by the device
    #[error("Device exception 0x{code:02X} ({}) for FC{function_code:02X}", describe_exception(.code))]
    DeviceException { function_code: u8, code: u8 },

    /// Semantic value outside the field's declared bounds
    #[error("Value {value} out of range for {field}: {min}..={max}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Semantic value not on the field's step grid
    #[error("Value {value} for {field} is not a multiple of step {step}")]
    InvalidStep { field: String, value: f64, step: f64 },

    /// Startup validation read failed
    #[error("Connection test failed: {0}")]
    ConnectionTestFailed(String),

    /// Engine has been closed
    #[error("Engine closed")]
    EngineClosed,

    /// Queued write replaced by a later write to the same address
    #[error("Write to register {0} superseded by a later write")]
    Superseded(u16),

    /// Field name not present in the register map
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// Field cannot be written (input range or read-only holding register)
    #[error("Field not writable: {0}")]
    NotWritable(String),

    /// Value has the wrong shape for the field (e.g. unknown enum label)
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for VigorError {
    fn from(err: std::io::Error) -> Self {
        VigorError::Io(err.to_string())
    }
}

impl VigorError {
    pub fn link(msg: impl Into<String>) -> Self {
        VigorError::Link(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        VigorError::Io(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        VigorError::Timeout(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        VigorError::Frame(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        VigorError::Config(msg.into())
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        VigorError::InvalidValue(msg.into())
    }

    /// Single-request failures that are worth sending the same frame again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VigorError::Timeout(_)
                | VigorError::Frame(_)
                | VigorError::Checksum { .. }
                | VigorError::TransactionMismatch { .. }
        )
    }

    /// Check if this error means the connection is dead
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, VigorError::Link(_) | VigorError::Io(_))
    }
}

fn describe_exception(code: &u8) -> &'static str {
    exception_description(*code)
}

/// Get exception description
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
