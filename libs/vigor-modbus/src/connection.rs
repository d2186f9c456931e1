//! Link transport
//!
//! Owns the only byte-level access to the medium. A link moves whole frames:
//! `receive` reads exactly one response frame, using the framing mode to know
//! where the frame ends. Any I/O failure leaves the link dead; recovery is a
//! full reopen through a [`Connector`].

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, LinkConfig, Parity, SerialConfig};
use crate::constants::{
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_SINGLE_REGISTER,
    MAX_MBAP_LENGTH, MBAP_HEADER_LEN,
};
use crate::error::{Result, VigorError};
use crate::frame::FramingMode;

/// Byte transport carrying one frame at a time
#[async_trait]
pub trait Link: Send + std::fmt::Debug {
    /// Transmit a complete request frame
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Receive one complete response frame within `deadline`
    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>>;

    /// Drop unread bytes left over from an earlier timed-out exchange
    async fn discard_pending(&mut self);
}

/// Opens links; used at startup and for explicit reconnects
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn open(&self) -> Result<Box<dyn Link>>;
}

#[async_trait]
impl Connector for LinkConfig {
    async fn open(&self) -> Result<Box<dyn Link>> {
        let connection = ModbusConnection::open(self).await?;
        Ok(Box::new(connection))
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Serial(SerialStream),
}

/// Real transport: a TCP socket to a bridge or a local serial port
#[derive(Debug)]
pub struct ModbusConnection {
    stream: Stream,
    framing: FramingMode,
}

impl ModbusConnection {
    /// Open the connection described by `config`
    pub async fn open(config: &LinkConfig) -> Result<Self> {
        let stream = match &config.connection {
            ConnectionConfig::Tcp(tcp) => {
                Self::connect_tcp(&tcp.host, tcp.port, config.connect_timeout()).await?
            },
            ConnectionConfig::Serial(serial) => Self::connect_serial(serial)?,
        };
        Ok(Self {
            stream,
            framing: config.framing,
        })
    }

    async fn connect_tcp(host: &str, port: u16, timeout_duration: Duration) -> Result<Stream> {
        let addr = format!("{host}:{port}");
        debug!("TCP connecting: {}", addr);

        match timeout(timeout_duration, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                Ok(Stream::Tcp(stream))
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                Err(VigorError::link(format!("Failed to connect to {addr}: {e}")))
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(VigorError::link(format!("Connection to {addr} timed out")))
            },
        }
    }

    fn connect_serial(config: &SerialConfig) -> Result<Stream> {
        debug!("RTU: {} @{}baud", config.port, config.baud_rate);

        let parity = match config.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let stop_bits = match config.effective_stop_bits() {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        match tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
        {
            Ok(port) => {
                info!("RTU opened: {}", config.port);
                Ok(Stream::Serial(port))
            },
            Err(e) => {
                error!("RTU err: {} - {}", config.port, e);
                Err(VigorError::link(format!(
                    "Failed to open serial port {}: {e}",
                    config.port
                )))
            },
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = match &mut self.stream {
            Stream::Tcp(stream) => stream.read_exact(buf).await,
            Stream::Serial(port) => port.read_exact(buf).await,
        };
        read.map(|_| ()).map_err(|e| {
            error!("RX: {}", e);
            VigorError::io(format!("Read error: {e}"))
        })
    }

    /// Read one MBAP frame: header, then as many bytes as the length field says
    async fn read_mbap_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        self.read_exact(&mut header).await?;

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length == 0 || length > MAX_MBAP_LENGTH {
            error!("MBAP invalid len: {}", length);
            return Err(VigorError::frame(format!("Invalid MBAP length: {length}")));
        }

        let mut frame = vec![0u8; MBAP_HEADER_LEN + length];
        frame[..MBAP_HEADER_LEN].copy_from_slice(&header);
        self.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
        Ok(frame)
    }

    /// Read one RTU frame; its length follows from the function code
    async fn read_rtu_frame(&mut self) -> Result<Vec<u8>> {
        let mut head = [0u8; 3];
        self.read_exact(&mut head).await?;

        let remaining = rtu_remaining_len(head[1], head[2])?;
        let mut frame = Vec::with_capacity(3 + remaining);
        frame.extend_from_slice(&head);
        frame.resize(3 + remaining, 0);
        self.read_exact(&mut frame[3..]).await?;
        Ok(frame)
    }
}

/// Bytes still to read after `unit_id`, function code and the third byte
pub(crate) fn rtu_remaining_len(function_code: u8, third: u8) -> Result<usize> {
    if function_code & 0x80 != 0 {
        // exception code already read, CRC left
        return Ok(2);
    }
    match function_code {
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => Ok(third as usize + 2),
        // address lo + value(2) + CRC(2)
        FC_WRITE_SINGLE_REGISTER => Ok(5),
        other => Err(VigorError::frame(format!(
            "Unexpected function code in response: {other:02X}"
        ))),
    }
}

#[async_trait]
impl Link for ModbusConnection {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        match &mut self.stream {
            Stream::Tcp(stream) => {
                stream.write_all(frame).await.map_err(|e| {
                    error!("TCP TX: {}", e);
                    VigorError::io(format!("TCP send error: {e}"))
                })?;
                debug!("TCP TX: {}B", frame.len());
            },
            Stream::Serial(port) => {
                port.write_all(frame).await.map_err(|e| {
                    error!("RTU TX: {}", e);
                    VigorError::io(format!("Serial send error: {e}"))
                })?;
                port.flush().await.map_err(|e| {
                    error!("RTU flush: {}", e);
                    VigorError::io(format!("Serial flush error: {e}"))
                })?;
                debug!("RTU TX: {}B", frame.len());
            },
        }
        Ok(())
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        let read = async {
            match self.framing {
                FramingMode::Mbap => self.read_mbap_frame().await,
                FramingMode::Rtu => self.read_rtu_frame().await,
            }
        };
        match timeout(deadline, read).await {
            Ok(Ok(frame)) => {
                debug!("RX: {}B", frame.len());
                Ok(frame)
            },
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!("RX timeout");
                Err(VigorError::timeout(format!(
                    "No response within {}ms",
                    deadline.as_millis()
                )))
            },
        }
    }

    async fn discard_pending(&mut self) {
        match &mut self.stream {
            Stream::Tcp(stream) => {
                let mut scratch = [0u8; 256];
                let mut dropped = 0usize;
                loop {
                    match stream.try_read(&mut scratch) {
                        Ok(0) => break,
                        Ok(n) => dropped += n,
                        Err(_) => break,
                    }
                }
                if dropped > 0 {
                    debug!("Discarded {}B stale input", dropped);
                }
            },
            Stream::Serial(port) => {
                if let Err(e) = port.clear(tokio_serial::ClearBuffer::Input) {
                    debug!("RTU clear: {}", e);
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::frame::{build_mbap_frame, build_rtu_frame};
    use tokio::net::TcpListener;

    #[test]
    fn test_rtu_remaining_len() {
        assert_eq!(rtu_remaining_len(0x04, 4).unwrap(), 6);
        assert_eq!(rtu_remaining_len(0x06, 0x1F).unwrap(), 5);
        assert_eq!(rtu_remaining_len(0x84, 0x02).unwrap(), 2);
        assert!(rtu_remaining_len(0x10, 0).is_err());
    }

    async fn loopback(framing: FramingMode, reply: Vec<u8>) -> ModbusConnection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&reply).await.unwrap();
            // keep the socket open until the client is done
            let _ = socket.read(&mut buf).await;
        });

        ModbusConnection::open(&LinkConfig::tcp("127.0.0.1", port, framing))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_rtu_frame_boundary() {
        let reply = build_rtu_frame(20, &[0x04, 0x04, 0x00, 0x01, 0x00, 0x02]);
        let mut conn = loopback(FramingMode::Rtu, reply.clone()).await;
        conn.send(&[0x01]).await.unwrap();
        let frame = conn.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(frame, reply);
    }

    #[tokio::test]
    async fn test_tcp_mbap_frame_boundary() {
        let reply = build_mbap_frame(9, 20, &[0x06, 0x1F, 0x42, 0x00, 0xC8]);
        let mut conn = loopback(FramingMode::Mbap, reply.clone()).await;
        conn.send(&[0x01]).await.unwrap();
        let frame = conn.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(frame, reply);
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let mut conn = loopback(FramingMode::Rtu, Vec::new()).await;
        conn.send(&[0x01]).await.unwrap();
        let err = conn.receive(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, VigorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_link_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = ModbusConnection::open(&LinkConfig::tcp("127.0.0.1", port, FramingMode::Rtu))
            .await
            .unwrap_err();
        assert!(matches!(err, VigorError::Link(_)));
    }
}
