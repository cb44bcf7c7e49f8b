use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::{Cursor, Read};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::checksum;
use super::constants::*;
use super::error::{AdbError, AdbResult, FormatError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    CNXN = 0x4e584e43, // "CNXN" - Connection
    AUTH = 0x48545541, // "AUTH" - Authentication
    OPEN = 0x4e45504f, // "OPEN" - Open stream
    OKAY = 0x59414b4f, // "OKAY" - Ready / acknowledgment
    CLSE = 0x45534c43, // "CLSE" - Close stream
    WRTE = 0x45545257, // "WRTE" - Write data
}

impl Command {
    /// Create Command from u32 value
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            CNXN => Some(Command::CNXN),
            AUTH => Some(Command::AUTH),
            OPEN => Some(Command::OPEN),
            OKAY => Some(Command::OKAY),
            CLSE => Some(Command::CLSE),
            WRTE => Some(Command::WRTE),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Magic value (bitwise NOT of command)
    pub fn magic(self) -> u32 {
        !self.to_u32()
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::CNXN => "CNXN",
            Command::AUTH => "AUTH",
            Command::OPEN => "OPEN",
            Command::OKAY => "OKAY",
            Command::CLSE => "CLSE",
            Command::WRTE => "WRTE",
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = FormatError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_u32(value).ok_or(FormatError::UnknownCommand(value))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ADB protocol packet
///
/// A 24-byte little-endian header followed by `payload`. The payload length
/// field is not stored; it is always `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbMessage {
    pub command: Command,
    /// First argument (usage varies by command)
    pub arg0: u32,
    /// Second argument (usage varies by command)
    pub arg1: u32,
    /// Byte-sum of the payload, or 0 when checksums are not in use
    pub data_checksum: u32,
    /// `!command` for every packet built locally
    pub magic: u32,
    pub payload: Bytes,
}

impl AdbMessage {
    pub const HEADER_SIZE: usize = HEADER_SIZE;

    /// Create a packet with a correct magic and no checksum.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            data_checksum: 0,
            magic: command.magic(),
            payload: payload.into(),
        }
    }

    pub fn new_empty(command: Command, arg0: u32, arg1: u32) -> Self {
        Self::new(command, arg0, arg1, Bytes::new())
    }

    /// Fill in the legacy payload checksum.
    pub fn with_checksum(mut self) -> Self {
        self.data_checksum = checksum::calculate(&self.payload);
        self
    }

    pub fn data_length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == self.command.magic()
    }

    pub fn has_valid_checksum(&self) -> bool {
        checksum::verify(&self.payload, self.data_checksum)
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize header and payload into one buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = BytesMut::with_capacity(self.total_size());
        buffer.put_u32_le(self.command.to_u32());
        buffer.put_u32_le(self.arg0);
        buffer.put_u32_le(self.arg1);
        buffer.put_u32_le(self.data_length());
        buffer.put_u32_le(self.data_checksum);
        buffer.put_u32_le(self.magic);
        buffer.put_slice(&self.payload);
        buffer.to_vec()
    }

    /// Write the serialized packet to a blocking writer.
    pub fn serialize_into<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.serialize())
    }

    /// Read exactly one packet from a blocking reader.
    ///
    /// A reader that ends before the declared payload length is a
    /// [`FormatError::Truncated`].
    pub fn deserialize<R: Read>(reader: &mut R) -> AdbResult<Self> {
        let mut header = [0u8; HEADER_SIZE];
        let filled = read_up_to(reader, &mut header)?;
        if filled < HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE,
                actual: filled,
            }
            .into());
        }
        let header = Header::parse(&header)?;

        let expected = header.data_length as usize;
        let mut payload = Vec::new();
        reader
            .take(header.data_length as u64)
            .read_to_end(&mut payload)?;
        if payload.len() < expected {
            return Err(FormatError::Truncated {
                expected,
                actual: payload.len(),
            }
            .into());
        }
        Ok(header.into_message(payload.into()))
    }

    /// Create a CNXN message carrying a `host::` or `device::` banner
    pub fn cnxn(version: u32, max_payload: u32, banner: &str) -> Self {
        Self::new(
            Command::CNXN,
            version,
            max_payload,
            Bytes::copy_from_slice(banner.as_bytes()),
        )
    }

    pub fn auth(auth_type: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(Command::AUTH, auth_type, 0, payload)
    }

    /// `initial_ack` is the receive budget in delayed-ack mode, otherwise 0.
    pub fn open(local_id: u32, initial_ack: u32, service: impl Into<Bytes>) -> Self {
        Self::new(Command::OPEN, local_id, initial_ack, service)
    }

    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new_empty(Command::OKAY, local_id, remote_id)
    }

    /// OKAY carrying a delayed-ack byte count.
    pub fn okay_with_ack(local_id: u32, remote_id: u32, acked: u32) -> Self {
        Self::new(
            Command::OKAY,
            local_id,
            remote_id,
            Bytes::copy_from_slice(&acked.to_le_bytes()),
        )
    }

    pub fn wrte(local_id: u32, remote_id: u32, data: Bytes) -> Self {
        Self::new(Command::WRTE, local_id, remote_id, data)
    }

    pub fn clse(local_id: u32, remote_id: u32) -> Self {
        Self::new_empty(Command::CLSE, local_id, remote_id)
    }
}

impl fmt::Display for AdbMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:08x}, 0x{:08x}) [{} bytes]",
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len()
        )
    }
}

struct Header {
    command: Command,
    arg0: u32,
    arg1: u32,
    data_length: u32,
    data_checksum: u32,
    magic: u32,
}

impl Header {
    fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(&bytes[..]);
        // Reads from a fixed 24-byte buffer cannot fail.
        let mut next =
            || ReadBytesExt::read_u32::<LittleEndian>(&mut cursor).unwrap_or_default();
        let command = Command::try_from(next())?;
        Ok(Self {
            command,
            arg0: next(),
            arg1: next(),
            data_length: next(),
            data_checksum: next(),
            magic: next(),
        })
    }

    fn into_message(self, payload: Bytes) -> AdbMessage {
        AdbMessage {
            command: self.command,
            arg0: self.arg0,
            arg1: self.arg1,
            data_checksum: self.data_checksum,
            magic: self.magic,
            payload,
        }
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

async fn read_up_to_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one packet from an async byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly on a packet boundary.
/// Payloads longer than `max_payload` are rejected before allocation.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> AdbResult<Option<AdbMessage>> {
    let mut header = [0u8; HEADER_SIZE];
    let filled = read_up_to_async(reader, &mut header).await?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < HEADER_SIZE {
        return Err(FormatError::Truncated {
            expected: HEADER_SIZE,
            actual: filled,
        }
        .into());
    }
    let header = Header::parse(&header)?;

    let expected = header.data_length as usize;
    if expected > max_payload {
        return Err(FormatError::PayloadTooLarge {
            size: expected,
            max: max_payload,
        }
        .into());
    }
    let mut payload = vec![0u8; expected];
    let filled = read_up_to_async(reader, &mut payload).await?;
    if filled < expected {
        return Err(FormatError::Truncated {
            expected,
            actual: filled,
        }
        .into());
    }
    Ok(Some(header.into_message(payload.into())))
}

/// Write one packet as a single buffer and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &AdbMessage,
) -> AdbResult<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await.map_err(AdbError::Io)
}
