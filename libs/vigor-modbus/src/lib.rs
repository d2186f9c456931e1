//! vigor-modbus - Modbus register synchronization for Brink/Ubbink Vigor ventilation units
//!
//! Keeps a local snapshot of the unit's registers in sync with the device over
//! one RS-485 line, either directly or through a TCP bridge, and turns caller
//! commands into paced, validated register writes.
//!
//! # Key Components
//!
//! - **Link / Connector**: serial port or TCP socket, opened from a [`LinkConfig`]
//! - **FrameCodec**: RTU (CRC-16) or MBAP (transaction id) framing
//! - **Bus scheduler**: the single owner of the link; paces and retries requests
//! - **Register map**: every mapped field with its decode and validation rules
//! - **Sync controller**: poll loop, snapshot publication, command reassertion
//! - **Engine**: the facade consumers hold
//!
//! # Example
//!
//! ```rust,no_run
//! use vigor_modbus::{Engine, EngineConfig, FramingMode, LinkConfig};
//!
//! # async fn run() -> vigor_modbus::Result<()> {
//! let link = LinkConfig::tcp("192.168.1.40", 502, FramingMode::Rtu);
//! let engine = Engine::start(EngineConfig::new(link)).await?;
//!
//! engine.refresh().await?;
//! if let Some(reading) = engine.read("outside_temperature")? {
//!     println!("outside: {}", reading.current());
//! }
//! engine.set_custom_flow_rate(200).await?;
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod constants;
pub mod controller;
pub mod engine;
pub mod error;
pub mod frame;
pub mod pdu;
pub mod registers;
pub mod scheduler;
pub mod simulator;
pub mod snapshot;

// Re-exports
pub use config::{
    BusConfig, ConnectionConfig, EngineConfig, LinkConfig, Parity, SerialConfig, SyncConfig,
    TcpConfig,
};
pub use connection::{Connector, Link, ModbusConnection};
pub use controller::FieldState;
pub use engine::{Engine, EngineState, EngineStatus, WriteAck};
pub use error::{Result, VigorError};
pub use frame::{FrameCodec, FramingMode, MbapCodec, RtuCodec};
pub use pdu::{ModbusPdu, Request, Response};
pub use registers::{AirflowMode, BypassMode, Field, RangeClass, RegisterAddress, SemanticValue};
pub use scheduler::{BusHandle, BusStats};
pub use simulator::{SimConnector, SimulatedDevice, SimulatedLink};
pub use snapshot::{DeviceSnapshot, FieldReading, SnapshotStore};
