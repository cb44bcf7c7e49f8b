use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use super::banner::{host_banner, Banner};
use super::error::{AdbError, AdbResult};
use super::message::{read_message, write_message, AdbMessage, Command};
use crate::config::HandshakeConfig;
use crate::session::auth::AuthProcessor;
use crate::transport::ConnectionState;

/// Parameters agreed with the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// `min(proposed, device)` protocol version
    pub version: u32,
    /// `min(proposed, device)` maximum payload size
    pub max_payload_size: u32,
    pub banner: Banner,
    /// Features the host advertised
    pub features: Vec<String>,
    /// Receive budget requested for delayed-ack sockets
    pub initial_delayed_ack_bytes: u32,
}

/// Run the CNXN/AUTH/CNXN exchange on a raw connection.
///
/// The connection is only borrowed: on failure it stays with the caller, who
/// may retry, since the device resets its state on every CNXN it receives.
pub async fn handshake<C>(
    connection: &mut C,
    processor: &mut AuthProcessor,
    config: &HandshakeConfig,
) -> AdbResult<HandshakeResult>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let features = config.effective_features();
    let banner = host_banner(&features);
    tracing::info!(
        "Sending CNXN: version=0x{:08x}, max_payload={}",
        config.version,
        config.max_payload_size
    );
    tracing::debug!("Host banner: {}", banner);

    tracing::debug!("Connection state: {}", ConnectionState::Connecting);

    // Checksums are always sent until the version has been negotiated.
    let connect = AdbMessage::cnxn(config.version, config.max_payload_size, &banner).with_checksum();

    let max_payload = config.max_payload_size as usize;
    let exchange = async {
        write_message(connection, &connect).await?;
        loop {
            let message = read_message(connection, max_payload)
                .await?
                .ok_or(AdbError::TransportClosed)?;
            match message.command {
                Command::CNXN => return Ok::<_, AdbError>(message),
                Command::AUTH => {
                    tracing::debug!(
                        "Connection state: {} (AUTH type {})",
                        ConnectionState::Authenticating,
                        message.arg0
                    );
                    let response = processor.process(&message).await?.with_checksum();
                    write_message(connection, &response).await?;
                }
                other => {
                    // Left over from a previous session on this connection.
                    tracing::debug!("Ignoring {} during handshake", other);
                }
            }
        }
    };

    let device = match config.timeout() {
        Some(limit) => with_timeout(limit, exchange).await?,
        None => exchange.await?,
    };

    let result = HandshakeResult {
        version: config.version.min(device.arg0),
        max_payload_size: config.max_payload_size.min(device.arg1),
        banner: Banner::parse_bytes(&device.payload),
        features,
        initial_delayed_ack_bytes: config.initial_delayed_ack_bytes,
    };
    tracing::debug!("Connection state: {}", ConnectionState::Connected);
    tracing::info!(
        "Connected to {}: version=0x{:08x}, max_payload={}",
        result.banner,
        result.version,
        result.max_payload_size
    );
    Ok(result)
}

async fn with_timeout<T>(
    limit: Duration,
    future: impl std::future::Future<Output = AdbResult<T>>,
) -> AdbResult<T> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| AdbError::Timeout {
            operation: "handshake",
            limit,
        })?
}
