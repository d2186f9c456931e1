//! Vigor device simulator for testing
//!
//! An in-memory ventilation unit that answers FC03/FC04/FC06 requests in
//! either RTU or MBAP framing, plus fault injection (corrupted responses,
//! silent device, dropped connections, power loss). It can be reached through
//! an in-process [`SimulatedLink`] or over a TCP loopback listener.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connection::{Connector, Link};
use crate::constants::{
    DEFAULT_UNIT_ID, EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_MAX_READ_REGISTERS,
};
use crate::error::{Result, VigorError};
use crate::frame::{
    build_mbap_frame, build_rtu_frame, parse_mbap_frame, parse_rtu_frame, FramingMode,
};
use crate::registers::RangeClass;

/// Input registers of an idle unit in manual mode
const INPUT_DEFAULTS: &[(u16, u16)] = &[
    (4000, 3),
    (4001, 12),
    (4004, 1),
    (4010, 0x2019),
    (4011, 0x0712),
    (4012, 0x3456),
    (4020, 4),
    (4021, 1),
    (4022, 2),
    (4023, 125),
    (4024, 118),
    (4030, 4),
    (4031, 150),
    (4032, 148),
    (4033, 170),
    (4034, 1350),
    (4036, 205),
    (4037, 452),
    (4040, 4),
    (4041, 150),
    (4042, 147),
    (4043, 168),
    (4044, 1320),
    (4046, 215),
    (4047, 520),
    (4050, 4),
    (4060, 1),
    (4080, 2),
    (4081, 85),
    (4082, 9999),
    (4083, 1200),
    (4101, 1),
    (4114, 12345),
    (4115, 2100),
    (4200, 4),
    (4201, 612),
];

const HOLDING_DEFAULTS: &[(u16, u16)] = &[
    (6000, 50),
    (6001, 100),
    (6002, 150),
    (6003, 250),
    (6100, 0),
    (6101, 240),
    (6102, 120),
    (6120, 180),
];

/// Power-on content of the volatile command range
const COMMAND_DEFAULTS: &[(u16, u16)] = &[(8000, 0), (8001, 0), (8002, 0), (8003, 2)];

const FILTER_STATUS: u16 = 4100;
const FILTER_RESET: u16 = 8010;
const APPLIANCE_RESET: u16 = 8011;

#[derive(Debug)]
struct DeviceState {
    framing: FramingMode,
    unit_id: u8,
    input: BTreeMap<u16, u16>,
    holding: BTreeMap<u16, u16>,
    frame_times: Vec<Instant>,
    request_log: Vec<(u8, u16)>,
    write_log: Vec<(u16, u16)>,
    corrupt_next: u32,
    drop_next: u32,
    response_delay: Duration,
    refuse_connections: bool,
    generation: u64,
    connections: CancellationToken,
}

impl DeviceState {
    fn reset_commands(&mut self) {
        for address in 8000..=8011 {
            self.holding.insert(address, 0);
        }
        for (address, value) in COMMAND_DEFAULTS {
            self.holding.insert(*address, *value);
        }
    }

    /// Execute a request PDU, returning the response PDU
    fn execute(&mut self, pdu: &[u8]) -> Vec<u8> {
        let Some(&fc) = pdu.first() else {
            return vec![EXCEPTION_FLAG, 0x01];
        };
        if pdu.len() != 5 {
            return exception(fc, 0x03);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let operand = u16::from_be_bytes([pdu[3], pdu[4]]);
        self.request_log.push((fc, address));

        match fc {
            FC_READ_INPUT_REGISTERS | FC_READ_HOLDING_REGISTERS => {
                if operand == 0 || operand > MODBUS_MAX_READ_REGISTERS {
                    return exception(fc, 0x03);
                }
                let Some(end) = address.checked_add(operand - 1) else {
                    return exception(fc, 0x02);
                };
                let readable = |a: u16| match RangeClass::of(a) {
                    Some(RangeClass::Input) => fc == FC_READ_INPUT_REGISTERS,
                    Some(_) => fc == FC_READ_HOLDING_REGISTERS,
                    None => false,
                };
                if !(address..=end).all(readable) {
                    return exception(fc, 0x02);
                }

                let table = if fc == FC_READ_INPUT_REGISTERS {
                    &self.input
                } else {
                    &self.holding
                };
                let mut response = Vec::with_capacity(2 + operand as usize * 2);
                response.push(fc);
                response.push((operand * 2) as u8);
                for a in address..=end {
                    let value = table.get(&a).copied().unwrap_or(0);
                    response.extend_from_slice(&value.to_be_bytes());
                }
                response
            },
            FC_WRITE_SINGLE_REGISTER => {
                if !RangeClass::of(address).is_some_and(RangeClass::is_writable) {
                    return exception(fc, 0x02);
                }
                self.write_log.push((address, operand));
                self.holding.insert(address, operand);
                match address {
                    FILTER_RESET if operand == 1 => {
                        self.input.insert(FILTER_STATUS, 0);
                        self.holding.insert(FILTER_RESET, 0);
                    },
                    APPLIANCE_RESET if operand == 1 => {
                        self.holding.insert(APPLIANCE_RESET, 0);
                    },
                    _ => {},
                }
                pdu.to_vec()
            },
            other => exception(other, 0x01),
        }
    }
}

fn exception(fc: u8, code: u8) -> Vec<u8> {
    vec![fc | EXCEPTION_FLAG, code]
}

/// Shared handle to one simulated unit
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// Device reachable through a bridge performing `framing`
    pub fn new(framing: FramingMode) -> Self {
        let mut state = DeviceState {
            framing,
            unit_id: DEFAULT_UNIT_ID,
            input: INPUT_DEFAULTS.iter().copied().collect(),
            holding: HOLDING_DEFAULTS.iter().copied().collect(),
            frame_times: Vec::new(),
            request_log: Vec::new(),
            write_log: Vec::new(),
            corrupt_next: 0,
            drop_next: 0,
            response_delay: Duration::ZERO,
            refuse_connections: false,
            generation: 0,
            connections: CancellationToken::new(),
        };
        state.reset_commands();
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn framing(&self) -> FramingMode {
        self.state.lock().framing
    }

    pub fn set_unit_id(&self, unit_id: u8) {
        self.state.lock().unit_id = unit_id;
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.state.lock().input.insert(address, value);
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.state.lock().holding.insert(address, value);
    }

    pub fn input(&self, address: u16) -> Option<u16> {
        self.state.lock().input.get(&address).copied()
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.state.lock().holding.get(&address).copied()
    }

    /// Power loss: the command range reverts to its power-on values
    pub fn power_cycle(&self) {
        info!("Simulated power cycle");
        self.state.lock().reset_commands();
    }

    /// Send time of every frame that reached the device
    pub fn frame_times(&self) -> Vec<Instant> {
        self.state.lock().frame_times.clone()
    }

    /// `(function code, start address)` of every decoded request
    pub fn request_log(&self) -> Vec<(u8, u16)> {
        self.state.lock().request_log.clone()
    }

    /// `(address, value)` of every accepted write
    pub fn write_log(&self) -> Vec<(u16, u16)> {
        self.state.lock().write_log.clone()
    }

    /// Writes of `address`, in order
    pub fn writes_to(&self, address: u16) -> Vec<u16> {
        self.state
            .lock()
            .write_log
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Damage the next `n` responses (CRC for RTU, transaction id for MBAP)
    pub fn corrupt_next_responses(&self, n: u32) {
        self.state.lock().corrupt_next = n;
    }

    /// Stay silent for the next `n` requests
    pub fn drop_next_responses(&self, n: u32) {
        self.state.lock().drop_next = n;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// Make new connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Break every open connection
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.connections.cancel();
        state.connections = CancellationToken::new();
        info!("Simulated link drop");
    }

    /// In-process link to this device
    pub fn link(&self) -> SimulatedLink {
        SimulatedLink {
            device: self.clone(),
            generation: self.state.lock().generation,
            pending: VecDeque::new(),
        }
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            device: self.clone(),
        }
    }

    /// Process one request frame as the bridge would; `None` means no reply
    pub fn handle_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.frame_times.push(Instant::now());

        let framing = state.framing;
        let (transaction_id, unit_id, pdu) = match framing {
            FramingMode::Rtu => match parse_rtu_frame(frame) {
                Ok((unit_id, pdu)) => (None, unit_id, pdu),
                Err(e) => {
                    debug!("Simulator ignoring frame: {}", e);
                    return None;
                },
            },
            FramingMode::Mbap => match parse_mbap_frame(frame) {
                Ok((tid, unit_id, pdu)) => (Some(tid), unit_id, pdu),
                Err(e) => {
                    debug!("Simulator ignoring frame: {}", e);
                    return None;
                },
            },
        };
        if unit_id != state.unit_id {
            return None;
        }

        let response = state.execute(pdu.as_slice());
        if state.drop_next > 0 {
            state.drop_next -= 1;
            return None;
        }

        let corrupt = state.corrupt_next > 0;
        if corrupt {
            state.corrupt_next -= 1;
        }
        let mut reply = match transaction_id {
            Some(tid) => {
                let tid = if corrupt { tid.wrapping_add(0x100) } else { tid };
                build_mbap_frame(tid, unit_id, &response)
            },
            None => build_rtu_frame(unit_id, &response),
        };
        if corrupt && transaction_id.is_none() {
            if let Some(last) = reply.last_mut() {
                *last ^= 0xFF;
            }
        }
        Some(reply)
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn connections_token(&self) -> CancellationToken {
        self.state.lock().connections.clone()
    }

    /// Serve this device on a loopback TCP port until `cancel` fires
    pub async fn serve_tcp(
        &self,
        cancel: CancellationToken,
    ) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        info!("Vigor simulator listening on {} ({})", local_addr, self.framing());

        let device = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        if device.state.lock().refuse_connections {
                            debug!("Refusing connection from {}", peer);
                            continue;
                        }
                        debug!("New connection from {}", peer);
                        let device = device.clone();
                        let dropped = device.connections_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = dropped.cancelled() => {},
                                result = device.handle_connection(stream) => {
                                    if let Err(e) = result {
                                        debug!("Connection ended: {}", e);
                                    }
                                },
                            }
                        });
                    },
                    Err(e) => {
                        error!("Accept error: {}", e);
                        break;
                    },
                }
            }
        });
        Ok((local_addr, task))
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let framing = self.framing();
        loop {
            let frame = match framing {
                // every FC03/FC04/FC06 request is 8 bytes in RTU framing
                FramingMode::Rtu => {
                    let mut frame = vec![0u8; 8];
                    stream.read_exact(&mut frame).await?;
                    frame
                },
                FramingMode::Mbap => {
                    let mut header = [0u8; MBAP_HEADER_LEN];
                    stream.read_exact(&mut header).await?;
                    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                    if length == 0 || length > MAX_MBAP_LENGTH {
                        continue;
                    }
                    let mut frame = vec![0u8; MBAP_HEADER_LEN + length];
                    frame[..MBAP_HEADER_LEN].copy_from_slice(&header);
                    stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
                    frame
                },
            };

            let delay = self.state.lock().response_delay;
            if let Some(reply) = self.handle_frame(&frame) {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                stream.write_all(&reply).await?;
            }
        }
    }
}

/// In-process link; responses are queued by `send` and handed out by `receive`
#[derive(Debug)]
pub struct SimulatedLink {
    device: SimulatedDevice,
    generation: u64,
    pending: VecDeque<Vec<u8>>,
}

#[async_trait]
impl Link for SimulatedLink {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if self.device.generation() != self.generation {
            return Err(VigorError::io("Connection reset by peer"));
        }
        if let Some(reply) = self.device.handle_frame(frame) {
            self.pending.push_back(reply);
        }
        Ok(())
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        let delay = self.device.state.lock().response_delay;
        match self.pending.pop_front() {
            Some(frame) if delay < deadline => {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                Ok(frame)
            },
            late => {
                // a late reply stays buffered until the next discard
                if let Some(frame) = late {
                    self.pending.push_front(frame);
                }
                sleep(deadline).await;
                Err(VigorError::timeout(format!(
                    "No response within {}ms",
                    deadline.as_millis()
                )))
            },
        }
    }

    async fn discard_pending(&mut self) {
        self.pending.clear();
    }
}

/// Opens [`SimulatedLink`]s to one device
#[derive(Debug, Clone)]
pub struct SimConnector {
    device: SimulatedDevice,
}

#[async_trait]
impl Connector for SimConnector {
    async fn open(&self) -> Result<Box<dyn Link>> {
        if self.device.state.lock().refuse_connections {
            return Err(VigorError::link("Connection refused by simulated bridge"));
        }
        Ok(Box::new(self.device.link()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rtu_read_and_write() {
        let device = SimulatedDevice::new(FramingMode::Rtu);

        let request = build_rtu_frame(20, &[0x04, 0x0F, 0xB4, 0x00, 0x01]);
        let reply = device.handle_frame(&request).unwrap();
        let (_, pdu) = parse_rtu_frame(&reply).unwrap();
        assert_eq!(pdu.as_slice(), &[0x04, 0x02, 0x00, 0x04]);

        let request = build_rtu_frame(20, &[0x06, 0x1F, 0x42, 0x00, 0xC8]);
        let reply = device.handle_frame(&request).unwrap();
        assert_eq!(reply, request);
        assert_eq!(device.holding(8002), Some(200));
        assert_eq!(device.write_log(), vec![(8002, 200)]);
    }

    #[tokio::test]
    async fn test_wrong_unit_and_bad_crc_are_silent() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        let request = build_rtu_frame(21, &[0x04, 0x0F, 0xB4, 0x00, 0x01]);
        assert!(device.handle_frame(&request).is_none());

        let mut request = build_rtu_frame(20, &[0x04, 0x0F, 0xB4, 0x00, 0x01]);
        request[7] ^= 0xFF;
        assert!(device.handle_frame(&request).is_none());
    }

    #[tokio::test]
    async fn test_mbap_device_ignores_rtu_frames() {
        let device = SimulatedDevice::new(FramingMode::Mbap);
        let request = build_rtu_frame(20, &[0x04, 0x0F, 0xB4, 0x00, 0x01]);
        assert!(device.handle_frame(&request).is_none());

        let request = build_mbap_frame(5, 20, &[0x04, 0x0F, 0xB4, 0x00, 0x01]);
        let reply = device.handle_frame(&request).unwrap();
        let (tid, _, _) = parse_mbap_frame(&reply).unwrap();
        assert_eq!(tid, 5);
    }

    #[tokio::test]
    async fn test_exceptions() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        // input register written
        let request = build_rtu_frame(20, &[0x06, 0x0F, 0xB4, 0x00, 0x01]);
        let (_, pdu) = parse_rtu_frame(&device.handle_frame(&request).unwrap()).unwrap();
        assert_eq!(pdu.as_slice(), &[0x86, 0x02]);

        // holding register read with FC04
        let request = build_rtu_frame(20, &[0x04, 0x1F, 0x40, 0x00, 0x01]);
        let (_, pdu) = parse_rtu_frame(&device.handle_frame(&request).unwrap()).unwrap();
        assert_eq!(pdu.as_slice(), &[0x84, 0x02]);
    }

    #[tokio::test]
    async fn test_power_cycle_resets_command_range() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        device.set_holding(8000, 2);
        device.set_holding(8002, 250);
        device.set_holding(6100, 2);
        device.power_cycle();
        assert_eq!(device.holding(8000), Some(0));
        assert_eq!(device.holding(8002), Some(0));
        assert_eq!(device.holding(8003), Some(2));
        assert_eq!(device.holding(6100), Some(2));
    }

    #[tokio::test]
    async fn test_filter_reset_action() {
        let device = SimulatedDevice::new(FramingMode::Rtu);
        device.set_input(4100, 1);
        let request = build_rtu_frame(20, &[0x06, 0x1F, 0x4A, 0x00, 0x01]);
        device.handle_frame(&request).unwrap();
        assert_eq!(device.input(4100), Some(0));
        assert_eq!(device.holding(8010), Some(0));
    }
}
