use bytes::{Bytes, BytesMut};
use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};

use super::dispatcher::{DispatcherCommand, SocketId};
use crate::protocol::{AdbError, AdbResult};

/// Lifecycle of a logical socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// OPEN sent, waiting for the device's OKAY or CLSE. Connects in this
    /// state are tracked by the dispatcher; handles are only created once
    /// the device answers, so an [`AdbSocket`] never reports it.
    Opening,
    Open,
    /// CLSE sent locally, waiting for the device's CLSE
    HalfClosed,
    Closed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Opening => "opening",
            SocketState::Open => "open",
            SocketState::HalfClosed => "half-closed",
            SocketState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One multiplexed duplex stream to a device service.
///
/// Reads and writes can be driven concurrently after [`AdbSocket::split`].
/// Dropping the socket (or its write half) closes it.
pub struct AdbSocket {
    reader: AdbSocketReader,
    writer: AdbSocketWriter,
}

impl AdbSocket {
    pub(crate) fn new(
        id: SocketId,
        service: String,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        commands: mpsc::UnboundedSender<DispatcherCommand>,
        state: watch::Receiver<SocketState>,
        delayed_ack: bool,
    ) -> Self {
        let reader = AdbSocketReader {
            id,
            inbound,
            acks: delayed_ack.then(|| commands.clone()),
        };
        let writer = AdbSocketWriter {
            id,
            service,
            commands,
            state,
            closed: false,
        };
        Self { reader, writer }
    }

    pub fn local_id(&self) -> u32 {
        self.writer.id.local
    }

    pub fn remote_id(&self) -> u32 {
        self.writer.id.remote
    }

    /// Service string this socket was opened with.
    pub fn service(&self) -> &str {
        &self.writer.service
    }

    pub fn state(&self) -> SocketState {
        self.writer.state()
    }

    /// Next chunk from the device, or `None` once the socket is closed.
    ///
    /// With classic flow control every chunk is acknowledged on arrival, so
    /// unread chunks queue without bound. Read chatty services promptly.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.reader.read().await
    }

    /// Read until the device closes the socket.
    pub async fn read_to_end(&mut self) -> Bytes {
        self.reader.read_to_end().await
    }

    pub async fn write(&mut self, data: impl Into<Bytes>) -> AdbResult<()> {
        self.writer.write(data).await
    }

    pub fn close(&mut self) {
        self.writer.close()
    }

    /// Wait until both sides have closed.
    pub async fn closed(&self) {
        self.writer.closed().await
    }

    pub fn split(self) -> (AdbSocketReader, AdbSocketWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for AdbSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdbSocket")
            .field("local_id", &self.local_id())
            .field("remote_id", &self.remote_id())
            .field("service", &self.service())
            .field("state", &self.state())
            .finish()
    }
}

/// Readable half of an [`AdbSocket`].
pub struct AdbSocketReader {
    id: SocketId,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    /// Present in delayed-ack mode: consumed bytes are acknowledged.
    acks: Option<mpsc::UnboundedSender<DispatcherCommand>>,
}

impl AdbSocketReader {
    pub async fn read(&mut self) -> Option<Bytes> {
        let chunk = self.inbound.recv().await?;
        self.acknowledge(chunk.len());
        Some(chunk)
    }

    pub async fn read_to_end(&mut self) -> Bytes {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.read().await {
            buffer.extend_from_slice(&chunk);
        }
        buffer.freeze()
    }

    fn acknowledge(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        if let Some(acks) = &self.acks {
            let _ = acks.send(DispatcherCommand::Ack {
                id: self.id,
                bytes: bytes.min(u32::MAX as usize) as u32,
            });
        }
    }
}

impl Drop for AdbSocketReader {
    fn drop(&mut self) {
        // Release the device's send budget held by unread data.
        self.inbound.close();
        let mut unread = 0usize;
        while let Ok(chunk) = self.inbound.try_recv() {
            unread += chunk.len();
        }
        self.acknowledge(unread);
    }
}

/// Writable half of an [`AdbSocket`].
pub struct AdbSocketWriter {
    id: SocketId,
    service: String,
    commands: mpsc::UnboundedSender<DispatcherCommand>,
    state: watch::Receiver<SocketState>,
    closed: bool,
}

impl AdbSocketWriter {
    pub fn local_id(&self) -> u32 {
        self.id.local
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Send `data`, waiting for flow control.
    ///
    /// Completes once the device acknowledged the last packet (classic mode)
    /// or once every packet fit in the send budget (delayed-ack mode).
    pub async fn write(&mut self, data: impl Into<Bytes>) -> AdbResult<()> {
        let data = data.into();
        if self.closed {
            return Err(AdbError::SocketClosed {
                local_id: self.id.local,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let (reply, done) = oneshot::channel();
        self.commands
            .send(DispatcherCommand::Write {
                id: self.id,
                data,
                reply,
            })
            .map_err(|_| AdbError::TransportClosed)?;
        done.await.unwrap_or(Err(AdbError::TransportClosed))
    }

    /// Send CLSE. Reads continue until the device closes its side.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.commands.send(DispatcherCommand::Close { id: self.id });
    }

    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the dispatcher dropped the socket, which is closed too.
        let _ = state.wait_for(|s| *s == SocketState::Closed).await;
    }
}

impl Drop for AdbSocketWriter {
    fn drop(&mut self) {
        self.close();
    }
}
