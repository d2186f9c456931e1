//! Engine configuration
//!
//! Supplied once at startup and immutable for the lifetime of an engine.
//! A reconfiguration tears the engine down and starts a new one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF_INTERVAL, DEFAULT_BAUD_RATE, DEFAULT_CONNECTION_TEST_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DIVERGENCE_CYCLES, DEFAULT_FAILURES_BEFORE_BACKOFF,
    DEFAULT_INTER_FRAME_GAP, DEFAULT_MAX_BLOCK_GAP, DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_TCP_PORT, DEFAULT_UNIT_ID, DEFAULT_WRITE_INTERVAL,
};
use crate::error::{Result, VigorError};
use crate::frame::FramingMode;

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub link: LinkConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Bound on the startup validation read (milliseconds)
    #[serde(default = "default_connection_test_timeout_ms")]
    pub connection_test_timeout_ms: u64,
}

impl EngineConfig {
    pub fn new(link: LinkConfig) -> Self {
        Self {
            link,
            bus: BusConfig::default(),
            sync: SyncConfig::default(),
            connection_test_timeout_ms: default_connection_test_timeout_ms(),
        }
    }

    pub fn connection_test_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_test_timeout_ms)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.bus.validate()?;
        self.sync.validate()?;
        if self.connection_test_timeout_ms == 0 {
            return Err(VigorError::config("connection_test_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Physical connection plus framing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub framing: FramingMode,
    /// Modbus slave / unit address of the ventilation unit
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl LinkConfig {
    /// TCP bridge with the given framing and default unit id
    pub fn tcp(host: impl Into<String>, port: u16, framing: FramingMode) -> Self {
        Self {
            connection: ConnectionConfig::Tcp(TcpConfig {
                host: host.into(),
                port,
            }),
            framing,
            unit_id: default_unit_id(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    /// Local serial port with the default 19200-8E1 settings
    pub fn serial(port: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::Serial(SerialConfig {
                port: port.into(),
                baud_rate: default_baud_rate(),
                parity: Parity::default(),
                data_bits: default_data_bits(),
                stop_bits: None,
            }),
            framing: FramingMode::Rtu,
            unit_id: default_unit_id(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Short human-readable endpoint description for logs
    pub fn endpoint(&self) -> String {
        match &self.connection {
            ConnectionConfig::Serial(serial) => format!(
                "{} @{} {}{}{}",
                serial.port,
                serial.baud_rate,
                serial.data_bits,
                serial.parity.as_char(),
                serial.effective_stop_bits()
            ),
            ConnectionConfig::Tcp(tcp) => format!("{}:{} ({})", tcp.host, tcp.port, self.framing),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=247).contains(&self.unit_id) {
            return Err(VigorError::config(format!(
                "unit_id must be in 1..=247, got {}",
                self.unit_id
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(VigorError::config("connect_timeout_ms must be > 0"));
        }
        match &self.connection {
            ConnectionConfig::Serial(serial) => {
                if self.framing == FramingMode::Mbap {
                    return Err(VigorError::config(
                        "MBAP framing is only available over TCP bridges",
                    ));
                }
                serial.validate()
            },
            ConnectionConfig::Tcp(tcp) => {
                if tcp.host.trim().is_empty() {
                    return Err(VigorError::config("tcp host must not be empty"));
                }
                if tcp.port == 0 {
                    return Err(VigorError::config("tcp port must be > 0"));
                }
                Ok(())
            },
        }
    }
}

/// Connection kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Serial(SerialConfig),
    Tcp(TcpConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Defaults to 1, or 2 when parity is `none`
    #[serde(default)]
    pub stop_bits: Option<u8>,
}

impl SerialConfig {
    pub fn effective_stop_bits(&self) -> u8 {
        self.stop_bits.unwrap_or(match self.parity {
            Parity::None => 2,
            Parity::Even | Parity::Odd => 1,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(VigorError::config("serial port must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(VigorError::config("baud_rate must be > 0"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(VigorError::config(format!(
                "data_bits must be in 5..=8, got {}",
                self.data_bits
            )));
        }
        if !matches!(self.effective_stop_bits(), 1 | 2) {
            return Err(VigorError::config(format!(
                "stop_bits must be 1 or 2, got {}",
                self.effective_stop_bits()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    #[default]
    Even,
    Odd,
}

impl Parity {
    fn as_char(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

/// Bus pacing, timeouts and retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Minimum spacing before every frame, from the previous frame's completion
    #[serde(default = "default_inter_frame_gap_ms")]
    pub inter_frame_gap_ms: u64,
    /// Minimum spacing between writes, from the previous write's completion
    #[serde(default = "default_write_interval_ms")]
    pub write_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inter_frame_gap_ms: default_inter_frame_gap_ms(),
            write_interval_ms: default_write_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl BusConfig {
    pub fn inter_frame_gap(&self) -> Duration {
        Duration::from_millis(self.inter_frame_gap_ms)
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(VigorError::config("request_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Poll cadence and reconciliation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval used after repeated failed cycles
    #[serde(default = "default_backoff_interval_ms")]
    pub backoff_interval_ms: u64,
    #[serde(default = "default_failures_before_backoff")]
    pub failures_before_backoff: u32,
    /// Poll cycles a readback may diverge from a pending write before it counts
    #[serde(default = "default_divergence_cycles")]
    pub divergence_cycles: u32,
    /// Snapshot entries older than this many poll intervals read as stale
    #[serde(default = "default_freshness_intervals")]
    pub freshness_intervals: u32,
    /// Unmapped registers tolerated inside one poll block
    #[serde(default = "default_max_block_gap")]
    pub max_block_gap: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            backoff_interval_ms: default_backoff_interval_ms(),
            failures_before_backoff: default_failures_before_backoff(),
            divergence_cycles: default_divergence_cycles(),
            freshness_intervals: default_freshness_intervals(),
            max_block_gap: default_max_block_gap(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_interval_ms)
    }

    /// Age beyond which a snapshot entry is reported stale
    pub fn freshness_threshold(&self) -> Duration {
        self.poll_interval()
            .saturating_mul(self.freshness_intervals.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(VigorError::config("poll_interval_ms must be > 0"));
        }
        if self.backoff_interval_ms < self.poll_interval_ms {
            return Err(VigorError::config(
                "backoff_interval_ms must not be shorter than poll_interval_ms",
            ));
        }
        if self.failures_before_backoff == 0 {
            return Err(VigorError::config("failures_before_backoff must be > 0"));
        }
        if self.divergence_cycles == 0 {
            return Err(VigorError::config("divergence_cycles must be > 0"));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_connection_test_timeout_ms() -> u64 {
    DEFAULT_CONNECTION_TEST_TIMEOUT.as_millis() as u64
}
fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}
fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_data_bits() -> u8 {
    8
}
fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}
fn default_inter_frame_gap_ms() -> u64 {
    DEFAULT_INTER_FRAME_GAP.as_millis() as u64
}
fn default_write_interval_ms() -> u64 {
    DEFAULT_WRITE_INTERVAL.as_millis() as u64
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}
fn default_backoff_interval_ms() -> u64 {
    DEFAULT_BACKOFF_INTERVAL.as_millis() as u64
}
fn default_failures_before_backoff() -> u32 {
    DEFAULT_FAILURES_BEFORE_BACKOFF
}
fn default_divergence_cycles() -> u32 {
    DEFAULT_DIVERGENCE_CYCLES
}
fn default_freshness_intervals() -> u32 {
    3
}
fn default_max_block_gap() -> u16 {
    DEFAULT_MAX_BLOCK_GAP
}
