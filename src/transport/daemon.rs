use std::sync::Arc;

use crate::config::{ClientConfig, DispatcherConfig};
use crate::protocol::constants::{MAX_PAYLOAD, VERSION_SKIP_CHECKSUM};
use crate::protocol::features::DELAYED_ACK;
use crate::protocol::{handshake, AdbError, AdbResult, Banner, HandshakeResult};
use crate::session::{
    random_address, AdbSocket, AuthProcessor, CredentialStore, DisconnectReason, Dispatcher,
    DispatcherOptions, DispatcherStats, ReverseTunnelHandler,
};

use super::{ConnectionState, DeviceConnection};

/// An authenticated session with one ADB daemon.
///
/// Dropping the transport shuts the dispatcher down; sockets still held by
/// the application then see end-of-stream and `TransportClosed`.
pub struct DaemonTransport {
    banner: Banner,
    protocol_version: u32,
    max_payload_size: u32,
    features: Vec<String>,
    delayed_ack_bytes: u32,
    dispatcher: Dispatcher,
}

impl DaemonTransport {
    /// Handshake with keys from `store`, then start dispatching.
    ///
    /// On failure the connection is handed back in the error, and
    /// authentication may be attempted again on it.
    pub async fn authenticate<C: DeviceConnection>(
        connection: C,
        store: Arc<dyn CredentialStore>,
        config: &ClientConfig,
    ) -> Result<Self, AuthenticateError<C>> {
        Self::authenticate_with(connection, AuthProcessor::new(store), config).await
    }

    /// Like [`DaemonTransport::authenticate`], with a caller-built processor
    /// (for example one reporting [`crate::session::AuthEvent`]s).
    pub async fn authenticate_with<C: DeviceConnection>(
        mut connection: C,
        mut processor: AuthProcessor,
        config: &ClientConfig,
    ) -> Result<Self, AuthenticateError<C>> {
        let result = handshake(&mut connection, &mut processor, &config.handshake).await;
        processor.close();
        let negotiated = result.and_then(|handshake| {
            let options = dispatcher_options(&handshake, &config.dispatcher)?;
            Ok((handshake, options))
        });
        match negotiated {
            Ok((handshake, options)) => Ok(Self::start(connection, handshake, options)),
            Err(error) => {
                tracing::debug!("Authentication failed: {}", error);
                Err(AuthenticateError { error, connection })
            }
        }
    }

    /// Start dispatching on a connection that already completed the handshake.
    pub fn from_handshake<C: DeviceConnection>(
        connection: C,
        handshake: HandshakeResult,
        config: &DispatcherConfig,
    ) -> AdbResult<Self> {
        let options = dispatcher_options(&handshake, config)?;
        Ok(Self::start(connection, handshake, options))
    }

    fn start<C: DeviceConnection>(
        connection: C,
        handshake: HandshakeResult,
        options: DispatcherOptions,
    ) -> Self {
        let delayed_ack_bytes = options.initial_delayed_ack_bytes;
        let dispatcher = Dispatcher::spawn(connection, options);
        tracing::debug!("Connection state: {}", ConnectionState::Operational);

        Self {
            banner: handshake.banner,
            protocol_version: handshake.version,
            max_payload_size: handshake.max_payload_size,
            features: handshake.features,
            delayed_ack_bytes,
            dispatcher,
        }
    }

    pub fn banner(&self) -> &Banner {
        &self.banner
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    /// Features this side advertised.
    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Per-socket receive budget, or `None` when classic flow control is used.
    pub fn delayed_ack_bytes(&self) -> Option<u32> {
        (self.delayed_ack_bytes > 0).then_some(self.delayed_ack_bytes)
    }

    pub fn state(&self) -> ConnectionState {
        if self.dispatcher.disconnect_reason().is_some() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Operational
        }
    }

    /// Open a socket to a device service such as `shell:ls`.
    pub async fn connect(&self, service: &str) -> AdbResult<AdbSocket> {
        self.dispatcher.connect(service).await
    }

    /// Route device-opened sockets for `address` to `handler`, generating a
    /// `localabstract:` address when none is given. Returns the address.
    ///
    /// Only the local routing is set up; asking the device to forward the
    /// address is done with a `reverse:forward:` service.
    pub async fn add_reverse_tunnel(
        &self,
        handler: impl ReverseTunnelHandler + 'static,
        address: Option<&str>,
    ) -> AdbResult<String> {
        let address = address.map(str::to_string).unwrap_or_else(random_address);
        self.dispatcher
            .add_reverse_tunnel(address.clone(), Arc::new(handler))
            .await?;
        Ok(address)
    }

    pub async fn remove_reverse_tunnel(&self, address: &str) -> AdbResult<bool> {
        self.dispatcher.remove_reverse_tunnel(address).await
    }

    pub async fn clear_reverse_tunnels(&self) -> AdbResult<()> {
        self.dispatcher.clear_reverse_tunnels().await
    }

    pub async fn stats(&self) -> AdbResult<DispatcherStats> {
        self.dispatcher.stats().await
    }

    /// Close every socket and the connection.
    pub async fn close(&self) {
        self.dispatcher.close().await;
        tracing::debug!("Connection state: {}", ConnectionState::Disconnected);
    }

    /// Resolves once the connection is gone, with the reason.
    pub async fn disconnected(&self) -> DisconnectReason {
        self.dispatcher.disconnected().await
    }
}

/// Flow control and checksum settings implied by a completed handshake.
fn dispatcher_options(
    handshake: &HandshakeResult,
    config: &DispatcherConfig,
) -> AdbResult<DispatcherOptions> {
    let requested_delayed_ack = handshake.features.iter().any(|f| f == DELAYED_ACK);
    if requested_delayed_ack && handshake.initial_delayed_ack_bytes == 0 {
        return Err(AdbError::UnsupportedFeatureConfiguration(
            "delayed_ack requires a non-zero initial_delayed_ack_bytes".to_string(),
        ));
    }

    let delayed_ack_bytes = if requested_delayed_ack && handshake.banner.has_feature(DELAYED_ACK)
    {
        handshake.initial_delayed_ack_bytes
    } else {
        0
    };
    let legacy = handshake.version < VERSION_SKIP_CHECKSUM;
    tracing::debug!(
        "Starting dispatcher: delayed_ack_bytes={}, checksums={}",
        delayed_ack_bytes,
        legacy
    );

    Ok(DispatcherOptions {
        max_payload_size: handshake.max_payload_size,
        max_inbound_payload: handshake.max_payload_size.max(MAX_PAYLOAD) as usize,
        calculate_checksum: legacy,
        append_null_to_service: legacy,
        initial_delayed_ack_bytes: delayed_ack_bytes,
        read_time_limit: config.read_time_limit(),
        packet_queue_depth: config.packet_queue_depth,
    })
}

/// A failed [`DaemonTransport::authenticate`], carrying the connection back
/// so the caller can retry on it.
pub struct AuthenticateError<C> {
    error: AdbError,
    connection: C,
}

impl<C> AuthenticateError<C> {
    pub fn error(&self) -> &AdbError {
        &self.error
    }

    pub fn into_connection(self) -> C {
        self.connection
    }

    pub fn into_parts(self) -> (AdbError, C) {
        (self.error, self.connection)
    }
}

impl<C> From<AuthenticateError<C>> for AdbError {
    fn from(err: AuthenticateError<C>) -> Self {
        err.error
    }
}

impl<C> std::fmt::Debug for AuthenticateError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticateError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<C> std::fmt::Display for AuthenticateError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, f)
    }
}

impl<C> std::error::Error for AuthenticateError<C> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

impl Drop for DaemonTransport {
    fn drop(&mut self) {
        self.dispatcher.shutdown_in_background();
    }
}

impl std::fmt::Debug for DaemonTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonTransport")
            .field("banner", &self.banner)
            .field("protocol_version", &format_args!("0x{:08x}", self.protocol_version))
            .field("max_payload_size", &self.max_payload_size)
            .field("delayed_ack_bytes", &self.delayed_ack_bytes)
            .finish_non_exhaustive()
    }
}
