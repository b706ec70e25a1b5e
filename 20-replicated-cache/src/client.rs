use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, ToSocketAddrs,
    },
};
use tracing::debug;

use crate::protocol::{
    read_response, Command, ProtocolError, Response, Status, DEFAULT_MAX_FIELD_LEN,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("key {0:?} not found")]
    KeyNotFound(Bytes),
    #[error("server returned status {0}")]
    Status(Status),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("unexpected data on idle connection")]
    UnexpectedData,
    #[error("join has no response; use Client::join")]
    NoResponse,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Request/response connection to a cache server.
///
/// Requests are issued one at a time; each call writes a frame and waits for
/// its response before returning.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(BufReader::new(reader), writer))
    }

    /// Wraps an already established connection, such as one accepted by a server.
    pub fn from_parts(reader: BufReader<OwnedReadHalf>, writer: OwnedWriteHalf) -> Self {
        Self { reader, writer }
    }

    pub async fn get(&mut self, key: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        let key = key.into();
        match self.request(&Command::Get { key: key.clone() }).await? {
            Response::Value {
                status: Status::Ok,
                value,
            } => Ok(value),
            Response::Value {
                status: Status::KeyNotFound,
                ..
            } => Err(ClientError::KeyNotFound(key)),
            other => Err(ClientError::Status(other.status())),
        }
    }

    pub async fn set(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl_seconds: i32,
    ) -> Result<(), ClientError> {
        let command = Command::Set {
            key: key.into(),
            value: value.into(),
            ttl_seconds,
        };
        self.expect_ok(&command).await
    }

    pub async fn delete(&mut self, key: impl Into<Bytes>) -> Result<(), ClientError> {
        self.expect_ok(&Command::Delete { key: key.into() }).await
    }

    /// Sends `Join`, turning this connection into a replication channel.
    pub async fn join(&mut self) -> Result<(), ClientError> {
        self.write_command(&Command::Join).await
    }

    /// Writes `command` and reads back its response.
    ///
    /// `Join` has no response and is refused before anything is sent; use
    /// [`Client::join`] for it.
    pub async fn request(&mut self, command: &Command) -> Result<Response, ClientError> {
        let kind = command.response_kind().ok_or(ClientError::NoResponse)?;
        self.write_command(command).await?;
        Ok(read_response(&mut self.reader, kind, DEFAULT_MAX_FIELD_LEN).await?)
    }

    /// Resolves once the peer closes the connection or sends unsolicited bytes.
    ///
    /// Cancel safe: dropping the future before it resolves consumes nothing.
    pub async fn closed(&mut self) -> ClientError {
        match self.reader.read_u8().await {
            Ok(byte) => {
                debug!(byte, "unsolicited byte on request/response connection");
                ClientError::UnexpectedData
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => ClientError::ConnectionClosed,
            Err(err) => ClientError::Io(err),
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn expect_ok(&mut self, command: &Command) -> Result<(), ClientError> {
        match self.request(command).await?.status() {
            Status::Ok => Ok(()),
            status => Err(ClientError::Status(status)),
        }
    }

    async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        command.check_field_lens(DEFAULT_MAX_FIELD_LEN)?;
        self.writer.write_all(&command.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
