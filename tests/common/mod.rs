// Scripted ADB daemon for integration tests

#![allow(dead_code)]

use adbd_client::config::DispatcherConfig;
use adbd_client::crypto::AdbPrivateKey;
use adbd_client::protocol::constants::VERSION;
use adbd_client::protocol::features::DELAYED_ACK;
use adbd_client::protocol::{read_message, write_message, AdbMessage, Banner, Command, HandshakeResult};
use adbd_client::{AdbSocket, DaemonTransport};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Duration};

pub const DEVICE_BANNER: &str =
    "device::ro.product.name=sdk;ro.product.model=Emulator;features=shell_v2,cmd";

pub const DELAYED_ACK_BANNER: &str =
    "device::ro.product.name=sdk;ro.product.model=Emulator;features=shell_v2,cmd,delayed_ack";

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const PIPE_SIZE: usize = 4 * 1024 * 1024;

pub fn fixture_key(name: &str) -> AdbPrivateKey {
    AdbPrivateKey::from_der(include_bytes!("../fixtures/adbkey.der"))
        .unwrap()
        .with_name(name)
}

/// Device end of an in-memory connection
pub struct MockDevice {
    stream: DuplexStream,
}

impl MockDevice {
    /// Returns the client end and the device.
    pub fn pair() -> (DuplexStream, MockDevice) {
        let (client, device) = tokio::io::duplex(PIPE_SIZE);
        (client, MockDevice { stream: device })
    }

    pub async fn send(&mut self, message: AdbMessage) {
        write_message(&mut self.stream, &message).await.unwrap();
    }

    /// Write raw bytes, for packets split across reads.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> AdbMessage {
        timeout(RECV_TIMEOUT, read_message(&mut self.stream, PIPE_SIZE))
            .await
            .expect("timed out waiting for a packet")
            .expect("failed to read packet")
            .expect("client closed the connection")
    }

    /// Receive a packet and check its command.
    pub async fn expect(&mut self, command: Command) -> AdbMessage {
        let message = self.recv().await;
        assert_eq!(message.command, command, "unexpected packet {}", message);
        message
    }

    /// No packet arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(result) = timeout(wait, read_message(&mut self.stream, PIPE_SIZE)).await {
            panic!("expected silence, got {:?}", result);
        }
    }

    /// Read packets until the client closes its write side; returns them.
    pub async fn drain_until_eof(&mut self) -> Vec<AdbMessage> {
        let mut packets = Vec::new();
        loop {
            match timeout(RECV_TIMEOUT, read_message(&mut self.stream, PIPE_SIZE))
                .await
                .expect("timed out waiting for EOF")
            {
                Ok(Some(message)) => packets.push(message),
                Ok(None) | Err(_) => return packets,
            }
        }
    }
}

pub fn handshake_result(
    version: u32,
    max_payload_size: u32,
    device_banner: &str,
    initial_delayed_ack_bytes: u32,
) -> HandshakeResult {
    let mut features = vec!["shell_v2".to_string(), "cmd".to_string()];
    if initial_delayed_ack_bytes > 0 {
        features.push(DELAYED_ACK.to_string());
    }
    HandshakeResult {
        version,
        max_payload_size,
        banner: Banner::parse(device_banner),
        features,
        initial_delayed_ack_bytes,
    }
}

/// A post-handshake transport with classic flow control.
pub fn classic_transport(max_payload_size: u32) -> (DaemonTransport, MockDevice) {
    transport_with(
        handshake_result(VERSION, max_payload_size, DEVICE_BANNER, 0),
        DispatcherConfig::default(),
    )
}

/// A post-handshake transport with delayed acks and the given receive budget.
pub fn delayed_transport(max_payload_size: u32, budget: u32) -> (DaemonTransport, MockDevice) {
    transport_with(
        handshake_result(VERSION, max_payload_size, DELAYED_ACK_BANNER, budget),
        DispatcherConfig::default(),
    )
}

pub fn transport_with(
    handshake: HandshakeResult,
    config: DispatcherConfig,
) -> (DaemonTransport, MockDevice) {
    let (client, device) = MockDevice::pair();
    let transport = DaemonTransport::from_handshake(client, handshake, &config).unwrap();
    (transport, device)
}

/// Open `service`, answering as device socket `remote_id`. `ack` is the
/// send budget granted in delayed-ack mode.
pub async fn open_socket(
    transport: &DaemonTransport,
    device: &mut MockDevice,
    service: &str,
    remote_id: u32,
    ack: Option<u32>,
) -> AdbSocket {
    let (socket, open) = tokio::join!(transport.connect(service), async {
        let open = device.expect(Command::OPEN).await;
        let okay = match ack {
            Some(bytes) => AdbMessage::okay_with_ack(remote_id, open.arg0, bytes),
            None => AdbMessage::okay(remote_id, open.arg0),
        };
        device.send(okay).await;
        open
    });
    let socket = socket.unwrap();
    assert_eq!(socket.local_id(), open.arg0);
    assert_eq!(socket.remote_id(), remote_id);
    socket
}
