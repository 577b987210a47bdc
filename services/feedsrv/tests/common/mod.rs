//! Test harness: a running engine and a fake feeder speaking the wire protocol

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use feedsrv::protocol::codec::{self, Action};
use feedsrv::protocol::{DeviceIdentifier, QuantityValue, TimeOffset, TimeValue};
use feedsrv::{EngineConfig, InMemoryFeederDatabase, ProtocolEngine};

pub const FEEDER_ID: &str = "ABC123456789";

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub engine: ProtocolEngine,
    pub database: Arc<InMemoryFeederDatabase>,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    handle: JoinHandle<feedsrv::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(EngineConfig::default()).await
    }

    pub async fn start_with(config: EngineConfig) -> Self {
        let config = EngineConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..config
        };
        let database = Arc::new(InMemoryFeederDatabase::new());
        let engine = ProtocolEngine::new(config, database.clone());
        let bound = engine.bind().await.unwrap();
        let addr = bound.local_addr();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(bound.run(shutdown.clone()));
        Self {
            engine,
            database,
            addr,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub fn feeder_id() -> DeviceIdentifier {
    DeviceIdentifier::new(FEEDER_ID).unwrap()
}

pub fn grams(amount: u16) -> QuantityValue {
    QuantityValue::new(amount).unwrap()
}

/// Poll `check` until it holds or [`WAIT`] elapses
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Client side of a feeder
pub struct FakeDevice {
    pub identifier: DeviceIdentifier,
    stream: TcpStream,
}

impl FakeDevice {
    pub async fn connect(addr: SocketAddr, identifier: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            identifier: DeviceIdentifier::new(identifier).unwrap(),
            stream,
        }
    }

    /// Connect, identify and consume the time broadcast
    pub async fn connect_identified(addr: SocketAddr, identifier: &str) -> Self {
        let mut device = Self::connect(addr, identifier).await;
        let reply = device.identify().await;
        assert_eq!(&reply[..4], &[0x9D, 0xA1, 0x06, 0x01]);
        device
    }

    /// Send the identification frame and return the server's reply
    pub async fn identify(&mut self) -> Bytes {
        let frame = codec::identification_frame(&self.identifier);
        self.send_raw(&frame).await;
        self.read_command().await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn manual_meal(&mut self, quantity: QuantityValue) {
        let frame = codec::manual_meal_frame(&self.identifier, quantity);
        self.send_raw(&frame).await;
    }

    pub async fn empty_alert(&mut self, time: TimeValue, quantity: QuantityValue) {
        let frame = codec::empty_feeder_frame(&self.identifier, time, quantity, TimeOffset::DEFAULT);
        self.send_raw(&frame).await;
    }

    pub async fn acknowledge(&mut self, action: Action) {
        let frame = codec::acknowledgement_frame(&self.identifier, action);
        self.send_raw(&frame).await;
    }

    /// Read one server→device frame
    pub async fn read_command(&mut self) -> Bytes {
        tokio::time::timeout(WAIT, self.try_read_command())
            .await
            .expect("no command from server")
            .expect("connection closed")
    }

    /// `None` once the socket is closed
    async fn try_read_command(&mut self) -> Option<Bytes> {
        let mut frame = vec![0u8; 4];
        self.stream.read_exact(&mut frame).await.ok()?;
        assert_eq!(&frame[..2], &[0x9D, 0xA1], "bad server frame {:02x?}", frame);

        let rest = match frame[2] {
            0x06 => 2,
            0x2D => {
                let count = self.stream.read_u8().await.ok()?;
                frame.push(count);
                usize::from(count) * 4
            },
            other => panic!("unexpected server frame type {:#04x}", other),
        };
        let start = frame.len();
        frame.resize(start + rest, 0);
        self.stream.read_exact(&mut frame[start..]).await.ok()?;
        Some(Bytes::from(frame))
    }

    /// True once the server has closed the socket
    pub async fn is_closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            tokio::time::timeout(WAIT, self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    /// Acknowledge every command from now on, like the bench emulator
    ///
    /// The task returns the commands it saw once the server closes the socket.
    pub fn spawn_auto_ack(mut self) -> JoinHandle<Vec<Bytes>> {
        tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(frame) = self.try_read_command().await {
                if let Some(action) = Action::from_opcode(frame[3]) {
                    self.acknowledge(action).await;
                }
                received.push(frame);
            }
            received
        })
    }
}
