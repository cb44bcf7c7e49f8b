use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, trace, warn};

use super::reverse::{ReverseTunnelHandler, ReverseTunnelRegistry};
use super::socket::{AdbSocket, SocketState};
use crate::protocol::{
    read_message, write_message, AdbError, AdbMessage, AdbResult, Command, FormatError,
};

/// How long a graceful shutdown waits for queued packets to reach the device.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies a socket on the wire: our id and the device's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SocketId {
    pub local: u32,
    pub remote: u32,
}

impl SocketId {
    /// Packets from the device carry its id in arg0 and ours in arg1.
    fn from_incoming(message: &AdbMessage) -> Self {
        Self {
            local: message.arg1,
            remote: message.arg0,
        }
    }
}

/// Requests from handles to the dispatcher loop
pub(crate) enum DispatcherCommand {
    Connect {
        service: String,
        reply: oneshot::Sender<AdbResult<AdbSocket>>,
    },
    Write {
        id: SocketId,
        data: Bytes,
        reply: oneshot::Sender<AdbResult<()>>,
    },
    /// Bytes consumed by a reader in delayed-ack mode
    Ack {
        id: SocketId,
        bytes: u32,
    },
    Close {
        id: SocketId,
    },
    AddReverseTunnel {
        address: String,
        handler: Arc<dyn ReverseTunnelHandler>,
        reply: oneshot::Sender<()>,
    },
    RemoveReverseTunnel {
        address: String,
        reply: oneshot::Sender<bool>,
    },
    ClearReverseTunnels {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<DispatcherStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Why the dispatcher stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally
    Closed,
    /// The device closed the connection
    EndOfStream,
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed locally"),
            DisconnectReason::EndOfStream => write!(f, "closed by device"),
            DisconnectReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Snapshot of the dispatcher tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Sockets opened by this side
    pub local_sockets: usize,
    /// Sockets opened by the device through reverse tunnels
    pub device_sockets: usize,
    /// Connects waiting for the device's answer
    pub pending_opens: usize,
    pub reverse_tunnels: usize,
}

/// Settings fixed for the lifetime of one dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Negotiated maximum payload size; outgoing data is chunked to it
    pub max_payload_size: u32,
    /// Largest inbound payload accepted before the stream is declared corrupt
    pub max_inbound_payload: usize,
    /// Compute data checksums on outgoing packets (versions before 0x01000001)
    pub calculate_checksum: bool,
    /// NUL-terminate OPEN service strings (versions before 0x01000001)
    pub append_null_to_service: bool,
    /// Receive budget per socket; 0 selects classic one-in-flight flow control
    pub initial_delayed_ack_bytes: u32,
    pub read_time_limit: Option<Duration>,
    pub packet_queue_depth: usize,
}

impl DispatcherOptions {
    fn delayed_ack(&self) -> bool {
        self.initial_delayed_ack_bytes > 0
    }
}

/// Handle to a running dispatcher.
///
/// The dispatcher owns the connection and every socket table. It runs as a
/// task with a reader task feeding it packets and a writer task draining
/// its outbound queue, so every packet goes through one ordered funnel.
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<DispatcherCommand>,
    disconnected: watch::Receiver<Option<DisconnectReason>>,
}

impl Dispatcher {
    /// Start dispatching on an authenticated connection. Must be called
    /// from within a tokio runtime.
    pub fn spawn<C>(connection: C, options: DispatcherOptions) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(connection);
        let (packet_tx, packet_rx) = mpsc::channel(options.packet_queue_depth.max(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (disconnected_tx, disconnected_rx) = watch::channel(None);

        let reader = tokio::spawn(read_loop(
            read_half,
            packet_tx,
            options.max_inbound_payload,
            options.read_time_limit,
        ));
        let writer = tokio::spawn(write_loop(write_half, outbound_rx));

        let dispatcher = DispatcherLoop {
            outbound: Outbound {
                tx: Some(outbound_tx),
                calculate_checksum: options.calculate_checksum,
            },
            options,
            commands: command_tx.clone(),
            tables: SocketTables::default(),
            reverse_tunnels: ReverseTunnelRegistry::default(),
            next_local_id: 1,
        };
        tokio::spawn(dispatcher.run(packet_rx, command_rx, reader, writer, disconnected_tx));

        Self {
            commands: command_tx,
            disconnected: disconnected_rx,
        }
    }

    /// Open a socket to `service` on the device.
    pub async fn connect(&self, service: &str) -> AdbResult<AdbSocket> {
        self.request(|reply| DispatcherCommand::Connect {
            service: service.to_string(),
            reply,
        })
        .await?
    }

    pub async fn add_reverse_tunnel(
        &self,
        address: String,
        handler: Arc<dyn ReverseTunnelHandler>,
    ) -> AdbResult<()> {
        self.request(|reply| DispatcherCommand::AddReverseTunnel {
            address,
            handler,
            reply,
        })
        .await
    }

    /// Returns whether a handler was registered for `address`.
    pub async fn remove_reverse_tunnel(&self, address: &str) -> AdbResult<bool> {
        self.request(|reply| DispatcherCommand::RemoveReverseTunnel {
            address: address.to_string(),
            reply,
        })
        .await
    }

    pub async fn clear_reverse_tunnels(&self) -> AdbResult<()> {
        self.request(|reply| DispatcherCommand::ClearReverseTunnels { reply })
            .await
    }

    pub async fn stats(&self) -> AdbResult<DispatcherStats> {
        self.request(|reply| DispatcherCommand::Stats { reply }).await
    }

    /// Close every socket and the connection. Idempotent.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(DispatcherCommand::Shutdown { reply })
            .is_ok()
        {
            let _ = done.await;
        }
        self.disconnected().await;
    }

    /// Wait until the dispatcher has stopped.
    pub async fn disconnected(&self) -> DisconnectReason {
        let mut disconnected = self.disconnected.clone();
        loop {
            if let Some(reason) = disconnected.borrow_and_update().clone() {
                return reason;
            }
            if disconnected.changed().await.is_err() {
                // Loop gone without publishing; only possible if its task panicked.
                return disconnected
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| DisconnectReason::Error("dispatcher stopped".into()));
            }
        }
    }

    /// The reason the dispatcher stopped, if it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnected.borrow().clone()
    }

    /// Ask the loop to shut down without waiting for it.
    pub(crate) fn shutdown_in_background(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(DispatcherCommand::Shutdown { reply });
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> DispatcherCommand,
    ) -> AdbResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| AdbError::TransportClosed)?;
        response.await.map_err(|_| AdbError::TransportClosed)
    }
}

/// Read half that fails with `TimedOut` when no bytes arrive for `limit`.
///
/// The deadline moves forward on every read that makes progress, so a slow
/// packet whose bytes keep coming is not cut off.
struct IdleLimitedReader<R> {
    inner: R,
    limit: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<R> IdleLimitedReader<R> {
    fn new(inner: R, limit: Option<Duration>) -> Self {
        let deadline = limit.map(|limit| Box::pin(tokio::time::sleep(limit)));
        Self {
            inner,
            limit,
            deadline,
        }
    }

    /// Restart the idle clock.
    fn rearm(&mut self) {
        if let (Some(limit), Some(deadline)) = (self.limit, self.deadline.as_mut()) {
            deadline.as_mut().reset(Instant::now() + limit);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for IdleLimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.rearm();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if let Some(deadline) = this.deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no data within the read time limit",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

async fn read_loop<R>(
    reader: R,
    packets: mpsc::Sender<AdbResult<AdbMessage>>,
    max_payload: usize,
    read_time_limit: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = IdleLimitedReader::new(reader, read_time_limit);
    loop {
        // Time spent waiting on the packet queue is not idle time.
        reader.rearm();
        let next = match read_message(&mut reader, max_payload).await {
            Err(AdbError::Io(e)) if e.kind() == io::ErrorKind::TimedOut => {
                match read_time_limit {
                    Some(limit) => Err(AdbError::Timeout {
                        operation: "read",
                        limit,
                    }),
                    None => Err(AdbError::Io(e)),
                }
            }
            other => other,
        };

        match next {
            Ok(Some(message)) => {
                if packets.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = packets.send(Err(e)).await;
                return;
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<AdbMessage>,
) -> AdbResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        write_message(&mut writer, &message).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Sending side of the writer task's queue
struct Outbound {
    tx: Option<mpsc::UnboundedSender<AdbMessage>>,
    calculate_checksum: bool,
}

impl Outbound {
    fn send(&self, message: AdbMessage) {
        let message = if self.calculate_checksum {
            message.with_checksum()
        } else {
            message
        };
        trace!(">> {}", message);
        if let Some(tx) = &self.tx {
            // A dead writer is reported through its join handle.
            let _ = tx.send(message);
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Send budget of one socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteWindow {
    /// One WRTE in flight until the device's OKAY
    Classic { awaiting_okay: bool },
    /// Bytes the device is still willing to buffer
    Delayed { available: u64 },
}

impl WriteWindow {
    fn new(delayed_budget: Option<u32>) -> Self {
        match delayed_budget {
            Some(bytes) => WriteWindow::Delayed {
                available: bytes as u64,
            },
            None => WriteWindow::Classic {
                awaiting_okay: false,
            },
        }
    }

    /// Largest chunk that may be sent right now
    fn sendable(&self, max_payload: usize) -> usize {
        match *self {
            WriteWindow::Classic { awaiting_okay } => {
                if awaiting_okay {
                    0
                } else {
                    max_payload
                }
            }
            WriteWindow::Delayed { available } => available.min(max_payload as u64) as usize,
        }
    }

    fn consume(&mut self, bytes: usize) {
        match self {
            WriteWindow::Classic { awaiting_okay } => *awaiting_okay = true,
            WriteWindow::Delayed { available } => *available -= bytes as u64,
        }
    }

    fn acknowledge(&mut self, acked: Option<u32>) {
        match self {
            WriteWindow::Classic { awaiting_okay } => *awaiting_okay = false,
            WriteWindow::Delayed { available } => *available += acked.unwrap_or(0) as u64,
        }
    }
}

struct PendingWrite {
    data: Bytes,
    reply: oneshot::Sender<AdbResult<()>>,
}

struct PendingOpen {
    service: String,
    reply: oneshot::Sender<AdbResult<AdbSocket>>,
}

/// Dispatcher side of an [`AdbSocket`]
struct SocketEntry {
    id: SocketId,
    service: String,
    state: SocketState,
    state_tx: watch::Sender<SocketState>,
    inbound: mpsc::UnboundedSender<Bytes>,
    window: WriteWindow,
    writes: VecDeque<PendingWrite>,
    /// Classic mode: write whose last packet awaits the device's OKAY
    in_flight: Option<oneshot::Sender<AdbResult<()>>>,
    /// Delayed-ack mode: bytes delivered but not yet consumed
    unacked: u64,
}

impl SocketEntry {
    fn set_state(&mut self, state: SocketState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Hand a payload to the reader. False if the reader is gone.
    fn deliver(&mut self, payload: Bytes) -> bool {
        self.inbound.send(payload).is_ok()
    }

    /// Send as much queued data as the window allows.
    fn pump(&mut self, outbound: &Outbound, max_payload: usize) {
        if self.state != SocketState::Open {
            return;
        }
        loop {
            let sendable = self.window.sendable(max_payload);
            if sendable == 0 {
                break;
            }
            let Some(front) = self.writes.front_mut() else {
                break;
            };

            let chunk = front.data.split_to(sendable.min(front.data.len()));
            self.window.consume(chunk.len());
            outbound.send(AdbMessage::wrte(self.id.local, self.id.remote, chunk));

            if front.data.is_empty() {
                if let Some(done) = self.writes.pop_front() {
                    match self.window {
                        WriteWindow::Classic { .. } => self.in_flight = Some(done.reply),
                        WriteWindow::Delayed { .. } => {
                            let _ = done.reply.send(Ok(()));
                        }
                    }
                }
            }
        }
    }

    fn fail_writes(&mut self, error: impl Fn() -> AdbError) {
        if let Some(done) = self.in_flight.take() {
            let _ = done.send(Err(error()));
        }
        for pending in self.writes.drain(..) {
            let _ = pending.reply.send(Err(error()));
        }
    }

    /// Final transition; dropping the entry ends the reader's stream.
    fn finish(mut self, error: impl Fn() -> AdbError) {
        self.set_state(SocketState::Closed);
        self.fail_writes(error);
    }
}

/// Every live socket, keyed by the id the opener chose
#[derive(Default)]
struct SocketTables {
    /// Opened by us, keyed by local id
    local_sockets: HashMap<u32, SocketEntry>,
    /// Opened by the device, keyed by remote id
    remote_sockets: HashMap<u32, SocketEntry>,
    /// Connects awaiting OKAY or CLSE, keyed by local id
    pending_opens: HashMap<u32, PendingOpen>,
}

impl SocketTables {
    fn get_mut(&mut self, id: SocketId) -> Option<&mut SocketEntry> {
        match self.local_sockets.get_mut(&id.local) {
            Some(entry) if entry.id.remote == id.remote => Some(entry),
            _ => self
                .remote_sockets
                .get_mut(&id.remote)
                .filter(|entry| entry.id.local == id.local),
        }
    }

    fn remove(&mut self, id: SocketId) -> Option<SocketEntry> {
        if self
            .local_sockets
            .get(&id.local)
            .is_some_and(|entry| entry.id.remote == id.remote)
        {
            return self.local_sockets.remove(&id.local);
        }
        if self
            .remote_sockets
            .get(&id.remote)
            .is_some_and(|entry| entry.id.local == id.local)
        {
            return self.remote_sockets.remove(&id.remote);
        }
        None
    }

    fn is_local_id_live(&self, local_id: u32) -> bool {
        self.local_sockets.contains_key(&local_id)
            || self.pending_opens.contains_key(&local_id)
            || self.remote_sockets.values().any(|entry| entry.id.local == local_id)
    }
}

struct DispatcherLoop {
    options: DispatcherOptions,
    outbound: Outbound,
    /// Cloned into every socket handle
    commands: mpsc::UnboundedSender<DispatcherCommand>,
    tables: SocketTables,
    reverse_tunnels: ReverseTunnelRegistry,
    next_local_id: u32,
}

impl DispatcherLoop {
    async fn run(
        mut self,
        mut packets: mpsc::Receiver<AdbResult<AdbMessage>>,
        mut commands: mpsc::UnboundedReceiver<DispatcherCommand>,
        reader: JoinHandle<()>,
        mut writer: JoinHandle<AdbResult<()>>,
        disconnected: watch::Sender<Option<DisconnectReason>>,
    ) {
        let mut shutdown_reply = None;
        let mut writer_finished = false;

        let reason = loop {
            tokio::select! {
                packet = packets.recv() => match packet {
                    Some(Ok(message)) => {
                        if let Err(e) = self.handle_packet(message) {
                            warn!("Protocol violation: {}", e);
                            break DisconnectReason::Error(e.to_string());
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Connection read failed: {}", e);
                        break DisconnectReason::Error(e.to_string());
                    }
                    None => break DisconnectReason::EndOfStream,
                },
                command = commands.recv() => match command {
                    Some(DispatcherCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break DisconnectReason::Closed;
                    }
                    Some(command) => self.handle_command(command),
                    None => break DisconnectReason::Closed,
                },
                result = &mut writer => {
                    writer_finished = true;
                    let reason = match result {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    warn!("Connection write failed: {}", reason);
                    break DisconnectReason::Error(reason);
                }
            }
        };

        if reason == DisconnectReason::Closed {
            self.close_open_sockets();
        }
        self.teardown();
        self.outbound.close();

        if !writer_finished {
            if reason == DisconnectReason::Closed {
                if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                    debug!("Timed out flushing outbound packets");
                    writer.abort();
                }
            } else {
                writer.abort();
            }
        }
        reader.abort();

        info!("Dispatcher stopped: {}", reason);
        disconnected.send_replace(Some(reason));
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn handle_packet(&mut self, message: AdbMessage) -> AdbResult<()> {
        trace!("<< {}", message);
        match message.command {
            Command::OPEN => self.handle_open(message),
            Command::OKAY => self.handle_okay(message)?,
            Command::WRTE => self.handle_write(message),
            Command::CLSE => self.handle_close(message),
            Command::CNXN | Command::AUTH => {
                return Err(AdbError::UnexpectedPacket {
                    command: message.command.name(),
                    reason: "connection is already established".to_string(),
                });
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: DispatcherCommand) {
        match command {
            DispatcherCommand::Connect { service, reply } => self.connect(service, reply),
            DispatcherCommand::Write { id, data, reply } => self.write(id, data, reply),
            DispatcherCommand::Ack { id, bytes } => self.acknowledge_read(id, bytes),
            DispatcherCommand::Close { id } => self.close_socket(id),
            DispatcherCommand::AddReverseTunnel {
                address,
                handler,
                reply,
            } => {
                debug!("Registered reverse tunnel {}", address);
                self.reverse_tunnels.add(address, handler);
                let _ = reply.send(());
            }
            DispatcherCommand::RemoveReverseTunnel { address, reply } => {
                let removed = self.reverse_tunnels.remove(&address);
                let _ = reply.send(removed);
            }
            DispatcherCommand::ClearReverseTunnels { reply } => {
                self.reverse_tunnels.clear();
                let _ = reply.send(());
            }
            DispatcherCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            // Intercepted by the run loop.
            DispatcherCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            local_sockets: self.tables.local_sockets.len(),
            device_sockets: self.tables.remote_sockets.len(),
            pending_opens: self.tables.pending_opens.len(),
            reverse_tunnels: self.reverse_tunnels.len(),
        }
    }

    fn max_payload(&self) -> usize {
        self.options.max_payload_size as usize
    }

    fn allocate_local_id(&mut self) -> u32 {
        loop {
            let id = self.next_local_id;
            self.next_local_id = self.next_local_id.checked_add(1).unwrap_or(1);
            if id != 0 && !self.tables.is_local_id_live(id) {
                return id;
            }
        }
    }

    fn new_socket(
        &self,
        id: SocketId,
        service: String,
        window: WriteWindow,
    ) -> (SocketEntry, AdbSocket) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SocketState::Open);
        let socket = AdbSocket::new(
            id,
            service.clone(),
            inbound_rx,
            self.commands.clone(),
            state_rx,
            self.options.delayed_ack(),
        );
        let entry = SocketEntry {
            id,
            service,
            state: SocketState::Open,
            state_tx,
            inbound: inbound_tx,
            window,
            writes: VecDeque::new(),
            in_flight: None,
            unacked: 0,
        };
        (entry, socket)
    }

    /// The ack size carried by an OKAY, validated against the flow mode.
    fn ack_bytes(&self, message: &AdbMessage) -> AdbResult<Option<u32>> {
        if self.options.delayed_ack() {
            let payload: [u8; 4] = message.payload.as_ref().try_into().map_err(|_| {
                FormatError::InvalidAckPayload {
                    expected: 4,
                    actual: message.payload.len(),
                }
            })?;
            Ok(Some(u32::from_le_bytes(payload)))
        } else if !message.payload.is_empty() {
            Err(FormatError::InvalidAckPayload {
                expected: 0,
                actual: message.payload.len(),
            }
            .into())
        } else {
            Ok(None)
        }
    }

    fn handle_okay(&mut self, message: AdbMessage) -> AdbResult<()> {
        let acked = self.ack_bytes(&message)?;
        let id = SocketId::from_incoming(&message);

        if let Some(pending) = self.tables.pending_opens.remove(&id.local) {
            let (entry, socket) = self.new_socket(id, pending.service, WriteWindow::new(acked));
            if pending.reply.send(Ok(socket)).is_ok() {
                debug!(
                    "Socket {} open: local={}, remote={}",
                    entry.service, id.local, id.remote
                );
                self.tables.local_sockets.insert(id.local, entry);
            } else {
                debug!("Connect to {} abandoned, closing", entry.service);
                self.outbound.send(AdbMessage::clse(id.local, id.remote));
            }
            return Ok(());
        }

        let max_payload = self.max_payload();
        match self.tables.get_mut(id) {
            Some(entry) => {
                entry.window.acknowledge(acked);
                if let Some(done) = entry.in_flight.take() {
                    let _ = done.send(Ok(()));
                }
                entry.pump(&self.outbound, max_payload);
            }
            None => {
                debug!("OKAY for unknown socket {}/{}, closing", id.local, id.remote);
                self.outbound.send(AdbMessage::clse(id.local, id.remote));
            }
        }
        Ok(())
    }

    fn handle_write(&mut self, message: AdbMessage) {
        let id = SocketId::from_incoming(&message);
        let delayed = self.options.delayed_ack();
        let budget = self.options.initial_delayed_ack_bytes as u64;

        let Some(entry) = self.tables.get_mut(id) else {
            debug!("WRTE for unknown socket {}/{}", id.local, id.remote);
            return;
        };

        let length = message.payload.len() as u32;
        let delivered = entry.deliver(message.payload);
        if !delayed {
            self.outbound.send(AdbMessage::okay(id.local, id.remote));
        } else if delivered {
            entry.unacked += length as u64;
            if entry.unacked > budget {
                warn!(
                    "Device exceeded receive budget on socket {}: {} > {}",
                    id.local, entry.unacked, budget
                );
            }
        } else {
            // Nobody will consume it; return the budget right away.
            self.outbound
                .send(AdbMessage::okay_with_ack(id.local, id.remote, length));
        }
    }

    fn handle_close(&mut self, message: AdbMessage) {
        if let Some(pending) = self.tables.pending_opens.remove(&message.arg1) {
            debug!("Device refused {}", pending.service);
            let _ = pending.reply.send(Err(AdbError::SocketRefused {
                service: pending.service,
            }));
            return;
        }

        let id = SocketId::from_incoming(&message);
        match self.tables.remove(id) {
            Some(entry) => {
                if entry.state == SocketState::Open {
                    self.outbound.send(AdbMessage::clse(id.local, id.remote));
                }
                debug!("Socket {} closed by device", entry.service);
                let local_id = id.local;
                entry.finish(|| AdbError::SocketClosed { local_id });
            }
            None => trace!("CLSE for unknown socket {}/{}", id.local, id.remote),
        }
    }

    fn handle_open(&mut self, message: AdbMessage) {
        let remote_id = message.arg0;
        let delayed = self.options.delayed_ack();

        if !delayed && message.arg1 != 0 {
            // Not a new socket; no local probe owns this id.
            debug!(
                "OPEN from {} names local id {}, refusing",
                remote_id, message.arg1
            );
            self.outbound.send(AdbMessage::clse(0, remote_id));
            return;
        }
        if delayed && message.arg1 == 0 {
            warn!("OPEN from {} without a send budget, refusing", remote_id);
            self.outbound.send(AdbMessage::clse(0, remote_id));
            return;
        }
        if self.tables.remote_sockets.contains_key(&remote_id) {
            warn!("Duplicate OPEN for device socket {}", remote_id);
            return;
        }

        let address = String::from_utf8_lossy(&message.payload)
            .trim_end_matches('\0')
            .to_string();
        let Some(handler) = self.reverse_tunnels.get(&address) else {
            debug!("No reverse tunnel for {}, refusing", address);
            self.outbound.send(AdbMessage::clse(0, remote_id));
            return;
        };

        let id = SocketId {
            local: self.allocate_local_id(),
            remote: remote_id,
        };
        let window = WriteWindow::new(delayed.then_some(message.arg1));
        let (entry, socket) = self.new_socket(id, address, window);
        // Registered before the handler runs so its first write finds the entry.
        self.tables.remote_sockets.insert(remote_id, entry);

        match handler.accept(socket) {
            Ok(()) => {
                debug!("Accepted device socket {} as {}", remote_id, id.local);
                let okay = if delayed {
                    AdbMessage::okay_with_ack(
                        id.local,
                        remote_id,
                        self.options.initial_delayed_ack_bytes,
                    )
                } else {
                    AdbMessage::okay(id.local, remote_id)
                };
                self.outbound.send(okay);
            }
            Err(e) => {
                debug!("Reverse tunnel handler declined: {}", e);
                self.tables.remote_sockets.remove(&remote_id);
                self.outbound.send(AdbMessage::clse(0, remote_id));
            }
        }
    }

    fn connect(&mut self, service: String, reply: oneshot::Sender<AdbResult<AdbSocket>>) {
        let local_id = self.allocate_local_id();
        let mut payload = service.clone().into_bytes();
        if self.options.append_null_to_service {
            payload.push(0);
        }
        debug!("Opening {} as local socket {}", service, local_id);
        self.tables
            .pending_opens
            .insert(local_id, PendingOpen { service, reply });
        self.outbound.send(AdbMessage::open(
            local_id,
            self.options.initial_delayed_ack_bytes,
            payload,
        ));
    }

    fn write(&mut self, id: SocketId, data: Bytes, reply: oneshot::Sender<AdbResult<()>>) {
        let max_payload = self.max_payload();
        match self.tables.get_mut(id) {
            Some(entry) if entry.state == SocketState::Open => {
                entry.writes.push_back(PendingWrite { data, reply });
                entry.pump(&self.outbound, max_payload);
            }
            _ => {
                let _ = reply.send(Err(AdbError::SocketClosed { local_id: id.local }));
            }
        }
    }

    fn acknowledge_read(&mut self, id: SocketId, bytes: u32) {
        if let Some(entry) = self.tables.get_mut(id) {
            entry.unacked = entry.unacked.saturating_sub(bytes as u64);
            if entry.state == SocketState::Open {
                self.outbound
                    .send(AdbMessage::okay_with_ack(id.local, id.remote, bytes));
            }
        }
    }

    fn close_socket(&mut self, id: SocketId) {
        let Some(entry) = self.tables.get_mut(id) else {
            return;
        };
        if entry.state != SocketState::Open {
            return;
        }
        debug!("Closing socket {}", entry.service);
        entry.set_state(SocketState::HalfClosed);
        let local_id = id.local;
        entry.fail_writes(|| AdbError::SocketClosed { local_id });
        self.outbound.send(AdbMessage::clse(id.local, id.remote));
    }

    /// Graceful shutdown: tell the device about every socket still open.
    fn close_open_sockets(&mut self) {
        for entry in self.tables.local_sockets.values().chain(self.tables.remote_sockets.values()) {
            if entry.state == SocketState::Open {
                self.outbound
                    .send(AdbMessage::clse(entry.id.local, entry.id.remote));
            }
        }
    }

    fn teardown(&mut self) {
        for (_, pending) in self.tables.pending_opens.drain() {
            let _ = pending.reply.send(Err(AdbError::TransportClosed));
        }
        let local = self.tables.local_sockets.drain().map(|(_, entry)| entry);
        let remote = self.tables.remote_sockets.drain().map(|(_, entry)| entry);
        for entry in local.chain(remote) {
            entry.finish(|| AdbError::TransportClosed);
        }
        self.reverse_tunnels.clear();
    }
}
