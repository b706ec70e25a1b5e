//! Binary wire protocol shared by servers, clients, and replication.
//!
//! Every integer is little-endian. Commands start with a one-byte tag:
//!
//! ```text
//! Set     1 | keyLen:i32 | key | valueLen:i32 | value | ttlSeconds:i32
//! Get     2 | keyLen:i32 | key
//! Delete  3 | keyLen:i32 | key
//! Join    4
//! ```
//!
//! Responses carry no tag; the reader knows which kind to expect from the
//! request it sent. Set and Delete answer with a bare status byte, Get answers
//! with a status byte followed by a length-prefixed value.

use std::{fmt, io};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on any single length-prefixed field.
pub const DEFAULT_MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

const CMD_SET: u8 = 1;
const CMD_GET: u8 = 2;
const CMD_DELETE: u8 = 3;
const CMD_JOIN: u8 = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command byte {0}")]
    UnknownCommand(u8),
    #[error("unknown status byte {0}")]
    UnknownStatus(u8),
    #[error("negative length prefix {0}")]
    NegativeLength(i32),
    #[error("field of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes, ttl_seconds: i32 },
    Delete { key: Bytes },
    Join,
}

impl Command {
    /// The response frame a peer sends back for this command, if any.
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            Command::Get { .. } => Some(ResponseKind::Value),
            Command::Set { .. } | Command::Delete { .. } => Some(ResponseKind::Status),
            Command::Join => None,
        }
    }

    /// Whether the command changes store contents and is forwarded to members.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Command::Set { .. } | Command::Delete { .. })
    }

    /// Fails if any field is longer than `max_field_len` or than an `i32`
    /// length prefix can describe.
    pub fn check_field_lens(&self, max_field_len: usize) -> Result<(), ProtocolError> {
        let max = max_field_len.min(i32::MAX as usize);
        let longest = match self {
            Command::Set { key, value, .. } => key.len().max(value.len()),
            Command::Get { key } | Command::Delete { key } => key.len(),
            Command::Join => 0,
        };

        if longest > max {
            return Err(ProtocolError::FrameTooLarge { len: longest, max });
        }
        Ok(())
    }

    /// Encodes the frame. Fields must pass [`Command::check_field_lens`];
    /// commands produced by [`read_command`] always do.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Command::Set {
                key,
                value,
                ttl_seconds,
            } => {
                buf.put_u8(CMD_SET);
                put_field(&mut buf, key);
                put_field(&mut buf, value);
                buf.put_i32_le(*ttl_seconds);
            }
            Command::Get { key } => {
                buf.put_u8(CMD_GET);
                put_field(&mut buf, key);
            }
            Command::Delete { key } => {
                buf.put_u8(CMD_DELETE);
                put_field(&mut buf, key);
            }
            Command::Join => buf.put_u8(CMD_JOIN),
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Command::Set { key, value, .. } => 1 + 4 + key.len() + 4 + value.len() + 4,
            Command::Get { key } | Command::Delete { key } => 1 + 4 + key.len(),
            Command::Join => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    None = 0,
    Ok = 1,
    Error = 2,
    KeyNotFound = 3,
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(Status::None),
            1 => Ok(Status::Ok),
            2 => Ok(Status::Error),
            3 => Ok(Status::KeyNotFound),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::None => "None",
            Status::Ok => "Ok",
            Status::Error => "Error",
            Status::KeyNotFound => "KeyNotFound",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Status,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Status(Status),
    Value { status: Status, value: Bytes },
}

impl Response {
    pub fn status(&self) -> Status {
        match self {
            Response::Status(status) | Response::Value { status, .. } => *status,
        }
    }

    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Status(_) => ResponseKind::Status,
            Response::Value { .. } => ResponseKind::Value,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Response::Status(status) => Bytes::copy_from_slice(&[*status as u8]),
            Response::Value { status, value } => {
                // Only a successful lookup carries a payload.
                let value: &[u8] = if *status == Status::Ok { &value[..] } else { &[] };
                let mut buf = BytesMut::with_capacity(1 + 4 + value.len());
                buf.put_u8(*status as u8);
                put_field(&mut buf, value);
                buf.freeze()
            }
        }
    }
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
    debug_assert!(field.len() <= i32::MAX as usize, "field too long to encode");
    buf.put_i32_le(field.len() as i32);
    buf.put_slice(field);
}

/// Reads exactly one command frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte of a
/// frame. Ending anywhere inside a frame is an `UnexpectedEof` error.
pub async fn read_command<R>(
    reader: &mut R,
    max_field_len: usize,
) -> Result<Option<Command>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let tag = match read_tag(reader).await? {
        Some(tag) => tag,
        None => return Ok(None),
    };

    let command = match tag {
        CMD_SET => {
            let key = read_field(reader, max_field_len).await?;
            let value = read_field(reader, max_field_len).await?;
            let ttl_seconds = reader.read_i32_le().await?;
            Command::Set {
                key,
                value,
                ttl_seconds,
            }
        }
        CMD_GET => Command::Get {
            key: read_field(reader, max_field_len).await?,
        },
        CMD_DELETE => Command::Delete {
            key: read_field(reader, max_field_len).await?,
        },
        CMD_JOIN => Command::Join,
        other => return Err(ProtocolError::UnknownCommand(other)),
    };

    Ok(Some(command))
}

/// Reads one response frame of the given kind.
pub async fn read_response<R>(
    reader: &mut R,
    kind: ResponseKind,
    max_field_len: usize,
) -> Result<Response, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let status = Status::try_from(reader.read_u8().await?)?;
    match kind {
        ResponseKind::Status => Ok(Response::Status(status)),
        ResponseKind::Value => {
            let value = read_field(reader, max_field_len).await?;
            Ok(Response::Value { status, value })
        }
    }
}

async fn read_tag<R>(reader: &mut R) -> io::Result<Option<u8>>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await {
        Ok(tag) => Ok(Some(tag)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err),
    }
}

async fn read_field<R>(reader: &mut R, max_field_len: usize) -> Result<Bytes, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32_le().await?;
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len));
    }

    let len = len as usize;
    if len > max_field_len {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_field_len,
        });
    }

    let mut field = vec![0u8; len];
    reader.read_exact(&mut field).await?;
    Ok(Bytes::from(field))
}
