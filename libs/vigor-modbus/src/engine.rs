//! Engine facade
//!
//! One engine owns one connection, one bus scheduler, one poll loop and one
//! snapshot. Consumers hold a cloned [`Engine`] and address the device by
//! field name only.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::connection::Connector;
use crate::controller::{FieldState, RefreshRequest, SyncController, SyncStats, WriteLedger};
use crate::error::{Result, VigorError};
use crate::registers::{
    self, AirflowMode, BypassMode, ControlMode, Field, RangeClass, SemanticValue, StandbyState,
    SwitchPosition, AIRFLOW_MODE, BASIC_REGISTER, DESIRED_FLOW_RATE, MODBUS_CONTROL, STANDBY,
    SWITCH_POSITION,
};
use crate::scheduler::{self, BusHandle};
use crate::snapshot::{DeviceSnapshot, FieldReading, SnapshotStore};

const REFRESH_QUEUE: usize = 8;

/// Accepted write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub field: &'static str,
    pub address: u16,
    pub raw: u16,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Running,
    /// Link lost; waiting for `reconnect()`
    LinkDown,
    Closed,
}

/// Point-in-time engine health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub consecutive_failures: u32,
    pub backed_off: bool,
    pub frames_sent: u64,
    pub retries: u64,
    pub superseded: u64,
    pub reassertions: u64,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    bus: BusHandle,
    store: Arc<SnapshotStore>,
    ledger: Arc<Mutex<WriteLedger>>,
    stats: Arc<SyncStats>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a running engine; cheap to clone
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Connect using the configured link and verify the device answers
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let connector: Arc<dyn Connector> = Arc::new(config.link.clone());
        Self::start_with(connector, config).await
    }

    /// Like [`Engine::start`], opening links through `connector`
    pub async fn start_with(connector: Arc<dyn Connector>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = config.link.endpoint();
        let framing = config.link.framing;
        info!(
            "Starting engine: {} ({} framing), unit {}",
            endpoint, framing, config.link.unit_id
        );

        let link = connector.open().await?;
        let cancel = CancellationToken::new();
        let (bus, worker) = scheduler::bus(
            link,
            framing.codec(),
            config.link.unit_id,
            config.bus.clone(),
            cancel.clone(),
        );
        let worker_task = tokio::spawn(worker.run());

        let probe = RangeClass::Input.read_request(BASIC_REGISTER, 1);
        let outcome = timeout(config.connection_test_timeout(), bus.submit(probe)).await;
        let failure = match outcome {
            Ok(Ok(_)) => None,
            // a device exception still proves the framing is right
            Ok(Err(e @ VigorError::DeviceException { .. })) => {
                warn!("Connection test answered with {}", e);
                None
            },
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no response within {}ms",
                config.connection_test_timeout_ms
            )),
        };
        if let Some(reason) = failure {
            cancel.cancel();
            let _ = worker_task.await;
            error!("Connection test against {} failed: {}", endpoint, reason);
            return Err(VigorError::ConnectionTestFailed(format!(
                "no valid {} frame from unit {} at {}: {}. Check the bridge type; \
                 a bridge performing {} framing needs framing: {}",
                framing,
                config.link.unit_id,
                endpoint,
                reason,
                framing.alternate(),
                framing.alternate().as_str()
            )));
        }

        let store = Arc::new(SnapshotStore::new());
        let ledger = Arc::new(Mutex::new(WriteLedger::new()));
        let stats = Arc::new(SyncStats::default());
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE);
        let controller = SyncController::new(
            bus.clone(),
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&stats),
            config.sync.clone(),
            refresh_rx,
            cancel.clone(),
        );
        let controller_task = tokio::spawn(controller.run());

        info!("Engine running against {}", endpoint);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                connector,
                bus,
                store,
                ledger,
                stats,
                refresh_tx,
                cancel,
                tasks: Mutex::new(vec![worker_task, controller_task]),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Snapshot as of the last completed poll cycle
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.inner.store.load()
    }

    /// Current reading of `name`; `None` until its registers have been polled
    pub fn read(&self, name: &str) -> Result<Option<FieldReading>> {
        if name == AIRFLOW_MODE {
            return Ok(self.airflow_reading(&self.snapshot()));
        }
        let field = registers::field(name)?;
        if !field.polled {
            return Ok(None);
        }
        Ok(self.reading(&self.snapshot(), field))
    }

    /// Every field that has a value, plus the derived airflow mode
    pub fn readings(&self) -> Vec<FieldReading> {
        let snapshot = self.snapshot();
        let mut readings: Vec<FieldReading> = registers::fields()
            .iter()
            .filter(|f| f.polled)
            .filter_map(|f| self.reading(&snapshot, f))
            .collect();
        readings.extend(self.airflow_reading(&snapshot));
        readings
    }

    /// Derived airflow mode, if 8000/8001 are known
    pub fn airflow_mode(&self) -> Option<AirflowMode> {
        let snapshot = self.snapshot();
        Some(AirflowMode::derive(
            snapshot.raw(registers::field(MODBUS_CONTROL).ok()?.address)?,
            snapshot.raw(registers::field(SWITCH_POSITION).ok()?.address)?,
        ))
    }

    fn reading(&self, snapshot: &DeviceSnapshot, field: &Field) -> Option<FieldReading> {
        snapshot.reading(
            field,
            Instant::now(),
            self.inner.config.sync.freshness_threshold(),
        )
    }

    fn airflow_reading(&self, snapshot: &DeviceSnapshot) -> Option<FieldReading> {
        let control = self.reading(snapshot, registers::field(MODBUS_CONTROL).ok()?)?;
        let switch = self.reading(snapshot, registers::field(SWITCH_POSITION).ok()?)?;
        let (SemanticValue::Enum { raw: control_raw, .. }, SemanticValue::Enum { raw: switch_raw, .. }) =
            (&control.value, &switch.value)
        else {
            return None;
        };
        Some(FieldReading {
            field: AIRFLOW_MODE,
            value: SemanticValue::Text(AirflowMode::derive(*control_raw, *switch_raw).to_string()),
            unit: None,
            stale: control.stale || switch.stale,
            updated_at: control.updated_at.min(switch.updated_at),
        })
    }

    /// Synchronization state of a writable field
    pub fn field_state(&self, name: &str) -> Result<FieldState> {
        let field = registers::field(name)?;
        Ok(self
            .inner
            .ledger
            .lock()
            .state(field.address, &self.snapshot()))
    }

    /// Validate, encode and write one field
    ///
    /// Resolves once the device acknowledged the write, or with the error
    /// that stopped it (validation, `Superseded`, bus failure).
    pub async fn submit_write(
        &self,
        name: &str,
        value: impl Into<SemanticValue>,
    ) -> Result<WriteAck> {
        let value = value.into();
        if name == AIRFLOW_MODE {
            let mode = match &value {
                SemanticValue::Text(label) => AirflowMode::from_label(label),
                _ => None,
            }
            .ok_or_else(|| VigorError::invalid_value(format!("{AIRFLOW_MODE}: {value}")))?;
            return self.set_airflow_mode(mode).await;
        }

        let field = registers::field(name)?;
        if !field.is_writable() {
            return Err(VigorError::NotWritable(name.to_string()));
        }
        let raw = field.encode(&value)?;
        self.write_raw(field, raw).await
    }

    /// Fire a stateless command (filter reset, appliance reset)
    pub async fn trigger_action(&self, name: &str) -> Result<()> {
        let field = registers::field(name)?;
        if !field.is_action() {
            return Err(VigorError::invalid_value(format!("{name} is not an action")));
        }
        let value = field.encode(&SemanticValue::Unavailable)?;
        let request = field.register().write_request(value)?;
        info!("Action {}", name);
        self.inner.bus.submit(request).await.map(|_| ())
    }

    /// Wall unit, or one of the four presets
    pub async fn set_airflow_mode(&self, mode: AirflowMode) -> Result<WriteAck> {
        match mode {
            AirflowMode::WallUnit => {
                self.write_enum(MODBUS_CONTROL, ControlMode::Off.raw())
                    .await
            },
            AirflowMode::Preset(SwitchPosition::Unrecognized(raw)) => Err(
                VigorError::invalid_value(format!("unknown switch position {raw}")),
            ),
            AirflowMode::Preset(position) => {
                self.write_enum(MODBUS_CONTROL, ControlMode::Switch.raw())
                    .await?;
                self.write_enum(SWITCH_POSITION, position.raw()).await
            },
            AirflowMode::Custom => Err(VigorError::invalid_value(
                "custom airflow is set through a flow rate",
            )),
            AirflowMode::Unrecognized(raw) => Err(VigorError::invalid_value(format!(
                "unknown airflow mode {raw}"
            ))),
        }
    }

    /// Switch to flow-rate control at `rate` m3/h
    pub async fn set_custom_flow_rate(&self, rate: u16) -> Result<WriteAck> {
        let flow = registers::field(DESIRED_FLOW_RATE)?;
        let raw = flow.encode(&SemanticValue::from(rate))?;
        self.write_enum(MODBUS_CONTROL, ControlMode::FlowRate.raw())
            .await?;
        self.write_raw(flow, raw).await
    }

    pub async fn set_standby(&self, standby: bool) -> Result<WriteAck> {
        let state = if standby {
            StandbyState::Standby
        } else {
            StandbyState::Normal
        };
        self.write_enum(STANDBY, state.raw()).await
    }

    pub async fn set_bypass_mode(&self, mode: BypassMode) -> Result<WriteAck> {
        self.write_enum("bypass_mode", mode.raw()).await
    }

    async fn write_enum(&self, name: &str, raw: u16) -> Result<WriteAck> {
        let field = registers::field(name)?;
        let raw = field.encode(&SemanticValue::Integer(i64::from(raw)))?;
        self.write_raw(field, raw).await
    }

    async fn write_raw(&self, field: &'static Field, raw: u16) -> Result<WriteAck> {
        let request = field.register().write_request(raw)?;
        let seq = self.inner.ledger.lock().begin(field.address, raw);
        debug!("Write {}={} (seq {})", field.name, raw, seq);

        let result = self.inner.bus.submit(request).await;
        let mut ledger = self.inner.ledger.lock();
        match result {
            Ok(_) => {
                ledger.acknowledge(field.address, seq);
                Ok(WriteAck {
                    field: field.name,
                    address: field.address,
                    raw,
                    seq,
                })
            },
            Err(e) => {
                ledger.abandon(field.address, seq);
                Err(e)
            },
        }
    }

    /// Run a poll cycle now and wait for it
    pub async fn refresh(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .refresh_tx
            .send(tx)
            .await
            .map_err(|_| VigorError::EngineClosed)?;
        rx.await.unwrap_or(Err(VigorError::EngineClosed))
    }

    /// Open a new link and hand it to the bus
    ///
    /// The snapshot starts over empty; commanded values are kept so a reset
    /// command range is reasserted on the next cycle.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(VigorError::EngineClosed);
        }
        info!("Reconnecting to {}", self.inner.config.link.endpoint());
        let link = self.inner.connector.open().await?;
        self.inner.bus.replace_link(link)?;
        self.inner.store.reset();
        info!("Link replaced");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.inner.bus.is_closed()
    }

    pub fn status(&self) -> EngineStatus {
        let state = if self.is_closed() {
            EngineState::Closed
        } else if !self.inner.bus.is_link_up() {
            EngineState::LinkDown
        } else {
            EngineState::Running
        };
        let bus = self.inner.bus.stats();
        let sync = &self.inner.stats;
        EngineStatus {
            state,
            cycles: sync.cycles.load(Ordering::Relaxed),
            failed_cycles: sync.failed_cycles.load(Ordering::Relaxed),
            consecutive_failures: sync.consecutive_failures.load(Ordering::Relaxed),
            backed_off: sync.backed_off.load(Ordering::Relaxed),
            frames_sent: bus.frames_sent.load(Ordering::Relaxed),
            retries: bus.retries.load(Ordering::Relaxed),
            superseded: bus.superseded.load(Ordering::Relaxed),
            reassertions: sync.reassertions.load(Ordering::Relaxed),
        }
    }

    /// Stop polling, fail queued requests with `EngineClosed`, release the link
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        self.inner.store.reset();
        info!("Engine closed");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::frame::FramingMode;
    use crate::simulator::SimulatedDevice;
    use tracing_test::traced_test;

    async fn engine(device: &SimulatedDevice) -> Engine {
        let config = EngineConfig::new(LinkConfig::tcp("sim", 502, device.framing()));
        Engine::start_with(Arc::new(device.connector()), config)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_fills_snapshot() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        let engine = engine(&device).await;
        engine.refresh().await.unwrap();

        let reading = engine.read("active_function").unwrap().unwrap();
        assert_eq!(reading.value.to_string(), "Manual");
        assert_eq!(
            engine.read("dwelling_temperature").unwrap().unwrap().value,
            SemanticValue::Unavailable
        );
        assert_eq!(engine.airflow_mode(), Some(AirflowMode::WallUnit));
        assert_eq!(engine.field_state(STANDBY).unwrap(), FieldState::Synced);
        assert_eq!(engine.status().state, EngineState::Running);
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_readonly_fields() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        let engine = engine(&device).await;
        assert!(matches!(
            engine.read("turbo"),
            Err(VigorError::UnknownField(_))
        ));
        assert!(matches!(
            engine.submit_write("outside_temperature", 20.0).await,
            Err(VigorError::NotWritable(_))
        ));
        assert!(matches!(
            engine.submit_write("filter_reset", 1u16).await,
            Err(VigorError::NotWritable(_))
        ));
        assert!(device.write_log().is_empty());
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_airflow_preset_writes_control_then_position() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        let engine = engine(&device).await;

        engine
            .submit_write(AIRFLOW_MODE, "High")
            .await
            .unwrap();
        assert_eq!(device.write_log(), vec![(8000, 1), (8001, 3)]);

        engine.refresh().await.unwrap();
        assert_eq!(
            engine.airflow_mode(),
            Some(AirflowMode::Preset(SwitchPosition::High))
        );
        assert!(engine.set_airflow_mode(AirflowMode::Custom).await.is_err());
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_writes_sentinel() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        device.set_input(4100, 1);
        let engine = engine(&device).await;

        engine.trigger_action("filter_reset").await.unwrap();
        assert_eq!(device.writes_to(8010), vec![1]);
        assert_eq!(device.input(4100), Some(0));
        assert!(engine.trigger_action(STANDBY).await.is_err());
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_backoff_and_recovery() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        let engine = engine(&device).await;
        engine.refresh().await.unwrap();

        device.drop_connections();
        for _ in 0..3 {
            assert!(engine.refresh().await.is_err());
        }
        let status = engine.status();
        assert_eq!(status.state, EngineState::LinkDown);
        assert_eq!(status.consecutive_failures, 3);
        assert!(engine.snapshot().is_empty());
        assert!(status.backed_off);
        assert!(logs_contain("slowing polls"));

        engine.reconnect().await.unwrap();
        engine.refresh().await.unwrap();
        let status = engine.status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(!status.backed_off);
        assert!(logs_contain("Communication restored"));
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        let engine = engine(&device).await;
        engine.refresh().await.unwrap();
        assert!(!engine.snapshot().is_empty());

        engine.close().await;
        engine.close().await;
        assert_eq!(engine.status().state, EngineState::Closed);
        assert!(engine.snapshot().is_empty());
        assert_eq!(engine.refresh().await, Err(VigorError::EngineClosed));
        assert_eq!(
            engine.set_standby(true).await,
            Err(VigorError::EngineClosed)
        );
    }
}
