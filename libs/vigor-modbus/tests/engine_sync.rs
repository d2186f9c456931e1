//! Engine Synchronization Tests
//!
//! End-to-end runs of the engine against the in-memory simulator:
//! - Startup connection test and framing mismatch
//! - Write validation and composite commands
//! - Command reassertion after power loss and reconnect
//! - Superseded writes and shutdown

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vigor_modbus::{
    AirflowMode, Engine, EngineConfig, EngineState, FieldState, FramingMode, LinkConfig,
    SemanticValue, SimulatedDevice, VigorError,
};

fn config_for(framing: FramingMode) -> EngineConfig {
    EngineConfig::new(LinkConfig::tcp("vigor-bridge", 502, framing))
}

async fn start(device: &SimulatedDevice) -> Engine {
    Engine::start_with(Arc::new(device.connector()), config_for(device.framing()))
        .await
        .unwrap()
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_framing_mismatch_fails_connection_test() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let result =
        Engine::start_with(Arc::new(device.connector()), config_for(FramingMode::Mbap)).await;

    match result {
        Err(VigorError::ConnectionTestFailed(message)) => {
            assert!(message.contains("mbap"), "{message}");
            assert!(message.contains("framing: rtu"), "{message}");
        },
        other => panic!("expected ConnectionTestFailed, got {other:?}"),
    }
    assert!(device.request_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_unit_id_fails_connection_test() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    device.set_unit_id(1);
    let result = Engine::start_with(Arc::new(device.connector()), config_for(FramingMode::Rtu)).await;
    assert!(matches!(result, Err(VigorError::ConnectionTestFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_refused_bridge_is_link_error() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    device.refuse_connections(true);
    let result = Engine::start_with(Arc::new(device.connector()), config_for(FramingMode::Rtu)).await;
    assert!(matches!(result, Err(VigorError::Link(_))));
}

#[tokio::test(start_paused = true)]
async fn test_mbap_over_serial_rejected() {
    let mut link = LinkConfig::serial("/dev/ttyUSB0");
    link.framing = FramingMode::Mbap;
    let device = SimulatedDevice::new(FramingMode::Mbap);
    let result = Engine::start_with(Arc::new(device.connector()), EngineConfig::new(link)).await;
    assert!(matches!(result, Err(VigorError::Config(_))));
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_flow_rate_validation_before_bus_traffic() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;

    assert!(matches!(
        engine.set_custom_flow_rate(403).await,
        Err(VigorError::InvalidStep { .. })
    ));
    assert!(matches!(
        engine.set_custom_flow_rate(500).await,
        Err(VigorError::OutOfRange { .. })
    ));
    assert!(matches!(
        engine.submit_write("desired_flow_rate", 45u16).await,
        Err(VigorError::OutOfRange { .. })
    ));
    assert!(device.write_log().is_empty());

    let ack = engine.set_custom_flow_rate(200).await.unwrap();
    assert_eq!(ack.address, 8002);
    assert_eq!(ack.raw, 200);
    assert_eq!(device.write_log(), vec![(8000, 2), (8002, 200)]);

    engine.refresh().await.unwrap();
    assert_eq!(engine.airflow_mode(), Some(AirflowMode::Custom));
    assert_eq!(
        engine.read("desired_flow_rate").unwrap().unwrap().value,
        SemanticValue::Integer(200)
    );
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_bypass_threshold_scaling() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;

    engine
        .submit_write("bypass_temp_dwelling", 22.5)
        .await
        .unwrap();
    assert_eq!(device.holding(6101), Some(225));
    assert!(matches!(
        engine.submit_write("bypass_temp_dwelling", 22.3).await,
        Err(VigorError::InvalidStep { .. })
    ));
    assert!(matches!(
        engine.submit_write("bypass_mode", "Sideways").await,
        Err(VigorError::InvalidValue(_))
    ));
    engine.submit_write("bypass_mode", "Open").await.unwrap();
    assert_eq!(device.holding(6100), Some(2));
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_queued_write_superseded_by_later_write() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;

    let (first, second) = tokio::join!(
        engine.submit_write("desired_flow_rate", 100u16),
        engine.submit_write("desired_flow_rate", 150u16),
    );
    assert_eq!(first, Err(VigorError::Superseded(8002)));
    assert_eq!(second.unwrap().raw, 150);
    assert_eq!(device.writes_to(8002), vec![150]);
    assert_eq!(engine.status().superseded, 1);

    engine.refresh().await.unwrap();
    assert_eq!(
        engine.field_state("desired_flow_rate").unwrap(),
        FieldState::Synced
    );
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_persistent_timeout_reaches_caller() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;
    device.set_response_delay(std::time::Duration::from_secs(10));

    // every attempt outlives the 3 s request timeout
    let result = engine.set_standby(true).await;
    assert!(matches!(result, Err(VigorError::Timeout(_))));
    assert_eq!(engine.status().state, EngineState::Running);

    device.set_response_delay(std::time::Duration::ZERO);
    engine.set_standby(true).await.unwrap();
    assert_eq!(device.holding(8003), Some(1));
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_fails_cycle_on_basic_block() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;
    engine.refresh().await.unwrap();

    device.set_response_delay(Duration::from_secs(10));
    let sent_before = device.frame_times().len();
    let started = Instant::now();
    assert!(matches!(engine.refresh().await, Err(VigorError::Timeout(_))));

    // one request plus two retries, nothing after the basic block
    assert_eq!(device.frame_times().len() - sent_before, 3);
    assert!(started.elapsed() < Duration::from_secs(12));
    assert_eq!(engine.status().failed_cycles, 1);

    // the bus is free again for callers
    device.set_response_delay(Duration::ZERO);
    engine.set_standby(true).await.unwrap();
    assert_eq!(device.holding(8003), Some(1));
    engine.close().await;
}

// ============================================================================
// Reassertion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_command_reasserted_once_after_power_loss_and_reconnect() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;

    engine.set_custom_flow_rate(200).await.unwrap();
    engine.refresh().await.unwrap();
    assert_eq!(engine.snapshot().raw(8000), Some(2));

    // power loss resets the command range and kills the bridge connection
    device.power_cycle();
    device.drop_connections();
    assert!(engine.refresh().await.is_err());
    assert_eq!(engine.status().state, EngineState::LinkDown);
    assert!(matches!(
        engine.set_standby(false).await,
        Err(VigorError::Link(_))
    ));

    engine.reconnect().await.unwrap();
    assert!(engine.snapshot().is_empty());
    assert_eq!(engine.status().state, EngineState::Running);

    engine.refresh().await.unwrap();
    assert_eq!(device.writes_to(8000), vec![2, 2]);
    assert_eq!(device.writes_to(8002), vec![200, 200]);
    assert_eq!(engine.status().reassertions, 2);

    // the device resets again before the reassert was ever read back: no storm
    device.power_cycle();
    for _ in 0..3 {
        engine.refresh().await.unwrap();
    }
    assert_eq!(device.writes_to(8000), vec![2, 2]);
    assert_eq!(engine.status().reassertions, 2);
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_caller_write_during_cycle_beats_reassert() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;

    engine.set_custom_flow_rate(200).await.unwrap();
    engine.refresh().await.unwrap();
    device.power_cycle();

    let command_reads = |device: &SimulatedDevice| {
        device
            .request_log()
            .iter()
            .filter(|entry| **entry == (0x03, 8000))
            .count()
    };
    let reads_before = command_reads(&device);
    let poller = engine.clone();
    let cycle = tokio::spawn(async move { poller.refresh().await });

    // wait until the cycle has read the reset command block
    while command_reads(&device) == reads_before {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let ack = engine
        .submit_write("desired_flow_rate", 300u16)
        .await
        .unwrap();
    assert_eq!(ack.raw, 300);
    cycle.await.unwrap().unwrap();

    for _ in 0..2 {
        engine.refresh().await.unwrap();
    }
    assert_eq!(device.holding(8002), Some(300));
    assert_eq!(device.writes_to(8002).last(), Some(&300));
    assert_eq!(
        engine.read("desired_flow_rate").unwrap().unwrap().value,
        SemanticValue::Integer(300)
    );
    assert_eq!(
        engine.field_state("desired_flow_rate").unwrap(),
        FieldState::Synced
    );
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_configuration_change_on_device_adopted() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;

    engine.submit_write("bypass_mode", "Closed").await.unwrap();
    engine.refresh().await.unwrap();

    // changed at the wall unit
    device.set_holding(6100, 0);
    engine.refresh().await.unwrap();
    engine.refresh().await.unwrap();

    assert_eq!(device.writes_to(6100), vec![1]);
    assert_eq!(
        engine.read("bypass_mode").unwrap().unwrap().value.to_string(),
        "Automatic"
    );
    engine.close().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_fails_later_calls() {
    let device = SimulatedDevice::new(FramingMode::Rtu);
    let engine = start(&device).await;
    let clone = engine.clone();

    engine.close().await;
    assert_eq!(clone.status().state, EngineState::Closed);
    assert_eq!(
        clone.submit_write("standby", "Normal").await,
        Err(VigorError::EngineClosed)
    );
    assert_eq!(clone.trigger_action("appliance_reset").await, Err(VigorError::EngineClosed));
    assert_eq!(clone.reconnect().await, Err(VigorError::EngineClosed));
}
