//! TCP Bridge Loopback Tests
//!
//! Runs the engine over real sockets against the simulator served on
//! 127.0.0.1, once as a raw RTU tunnel and once as an MBAP-converting bridge.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use tokio_util::sync::CancellationToken;
use vigor_modbus::{
    Engine, EngineConfig, FramingMode, LinkConfig, SemanticValue, SimulatedDevice, VigorError,
};

async fn serve(framing: FramingMode) -> (SimulatedDevice, EngineConfig, CancellationToken) {
    let device = SimulatedDevice::new(framing);
    let cancel = CancellationToken::new();
    let (addr, _task) = device.serve_tcp(cancel.clone()).await.unwrap();

    let mut config = EngineConfig::new(LinkConfig::tcp("127.0.0.1", addr.port(), framing));
    config.bus.inter_frame_gap_ms = 5;
    config.bus.write_interval_ms = 5;
    config.bus.request_timeout_ms = 500;
    config.connection_test_timeout_ms = 2000;
    (device, config, cancel)
}

async fn read_write_roundtrip(framing: FramingMode) {
    let (device, config, cancel) = serve(framing).await;
    let engine = Engine::start(config).await.unwrap();

    engine.refresh().await.unwrap();
    assert_eq!(
        engine.read("active_function").unwrap().unwrap().value.to_string(),
        "Manual"
    );
    assert_eq!(
        engine.read("co2_sensor_1").unwrap().unwrap().value,
        SemanticValue::Integer(612)
    );

    engine.submit_write("standby", "Standby").await.unwrap();
    assert_eq!(device.holding(8003), Some(1));
    engine.refresh().await.unwrap();
    assert_eq!(
        engine.read("standby").unwrap().unwrap().value.to_string(),
        "Standby"
    );

    engine.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_rtu_tunnel_bridge() {
    read_write_roundtrip(FramingMode::Rtu).await;
}

#[tokio::test]
async fn test_mbap_converting_bridge() {
    read_write_roundtrip(FramingMode::Mbap).await;
}

#[tokio::test]
async fn test_wrong_bridge_type_detected() {
    let (_device, mut config, cancel) = serve(FramingMode::Mbap).await;
    config.link.framing = FramingMode::Rtu;

    let result = Engine::start(config).await;
    assert!(
        matches!(result, Err(VigorError::ConnectionTestFailed(_))),
        "{result:?}"
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_closed_port_is_link_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = EngineConfig::new(LinkConfig::tcp("127.0.0.1", port, FramingMode::Rtu));
    let result = Engine::start(config).await;
    assert!(matches!(result, Err(VigorError::Link(_))), "{result:?}");
}
