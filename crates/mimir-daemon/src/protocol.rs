//! Wire protocol between daemon and clients.
//!
//! Messages are framed as length-prefixed MessagePack:
//! - 4 bytes: big-endian payload length
//! - N bytes: `[command or status, data map, session map]`
//!
//! Requests and responses share that shape. The client always speaks first
//! and the daemon answers every request with exactly one response.

use crate::error::{DaemonError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol generation spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1";

/// Largest accepted frame (4 MiB).
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// String to string map carried by every message.
pub type Data = BTreeMap<String, String>;

/// Well-known data and session keys.
pub mod fields {
    /// Protocol generation, sent with HELLO
    pub const PROTOCOL: &str = "protocol";
    /// Daemon crate version, answered to HELLO
    pub const VERSION: &str = "version";
    /// Session id in the session map
    pub const SESSION_ID: &str = "sessionId";
    /// Encoded key
    pub const KEY: &str = "key";
    /// Absolute path on the daemon host
    pub const PATH: &str = "path";
    /// BYE flag asking the daemon to terminate
    pub const SHUTDOWN: &str = "shutdown";
    /// Comma-joined checksum algorithm names
    pub const CHECKSUMS: &str = "checksums";
    /// Human-readable KO message
    pub const MESSAGE: &str = "message";
    /// Prefix of the numbered PRESEED keys
    pub const KEY_PREFIX: &str = "key.";
    /// PRESEED count of stored keys
    pub const STORED: &str = "stored";
    /// PRESEED count of keys already present
    pub const SKIPPED: &str = "skipped";
}

/// Commands a client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Open a session
    Hello,
    /// Close the session, optionally shutting the daemon down
    Bye,
    /// Look a key up
    Locate,
    /// Materialize a key at a path
    Transfer,
    /// List checksum algorithms
    LsChecksums,
    /// Store a file under a key
    StorePath,
    /// Bulk-populate from a local bundle
    Preseed,
}

impl Command {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Bye => "BYE",
            Self::Locate => "LOCATE",
            Self::Transfer => "TRANSFER",
            Self::LsChecksums => "LS_CHECKSUMS",
            Self::StorePath => "STORE_PATH",
            Self::Preseed => "PRESEED",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HELLO" => Ok(Self::Hello),
            "BYE" => Ok(Self::Bye),
            "LOCATE" => Ok(Self::Locate),
            "TRANSFER" => Ok(Self::Transfer),
            "LS_CHECKSUMS" => Ok(Self::LsChecksums),
            "STORE_PATH" => Ok(Self::StorePath),
            "PRESEED" => Ok(Self::Preseed),
            other => Err(DaemonError::protocol(format!("unknown command '{other}'"))),
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Success; data holds the result
    Ok,
    /// Failure; data holds a `message`
    Ko,
}

impl Status {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Ko => "KO",
        }
    }
}

impl FromStr for Status {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OK" => Ok(Self::Ok),
            "KO" => Ok(Self::Ko),
            other => Err(DaemonError::protocol(format!("unknown status '{other}'"))),
        }
    }
}

/// Client to daemon message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command name as sent; unknown names are kept so the daemon can answer KO
    pub command: String,
    /// Command arguments
    pub data: Data,
    /// Session map, empty before HELLO
    pub session: Data,
}

impl Request {
    /// Request for `command` with `data` in `session`.
    #[must_use]
    pub fn new(command: Command, data: Data, session: Data) -> Self {
        Self {
            command: command.as_str().to_string(),
            data,
            session,
        }
    }

    /// Write this request as one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or I/O fails.
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        write_message(writer, &self.command, &self.data, &self.session).await
    }

    /// Read one request; `None` when the peer closed the connection cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated, oversized or undecodable frames.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Option<Self>> {
        Ok(read_message(reader)
            .await?
            .map(|(command, data, session)| Self {
                command,
                data,
                session,
            }))
    }
}

/// Daemon to client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Outcome
    pub status: Status,
    /// Result data, or the KO message
    pub data: Data,
    /// Session map
    pub session: Data,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub const fn ok(data: Data, session: Data) -> Self {
        Self {
            status: Status::Ok,
            data,
            session,
        }
    }

    /// Failed response carrying `message`.
    #[must_use]
    pub fn ko(message: impl Into<String>, session: Data) -> Self {
        Self {
            status: Status::Ko,
            data: Data::from([(fields::MESSAGE.to_string(), message.into())]),
            session,
        }
    }

    /// KO message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.data.get(fields::MESSAGE).map(String::as_str)
    }

    /// Write this response as one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or I/O fails.
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        write_message(writer, self.status.as_str(), &self.data, &self.session).await
    }

    /// Read one response; `None` when the peer closed the connection cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated, oversized or undecodable frames.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Option<Self>> {
        match read_message(reader).await? {
            None => Ok(None),
            Some((status, data, session)) => Ok(Some(Self {
                status: status.parse()?,
                data,
                session,
            })),
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    head: &str,
    data: &Data,
    session: &Data,
) -> Result<()> {
    let payload = rmp_serde::to_vec(&(head, data, session))
        .map_err(|e| DaemonError::codec(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| DaemonError::protocol(format!("frame of {} bytes too large", payload.len())))?;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| DaemonError::io_no_path(e, "write frame"))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| DaemonError::io_no_path(e, "write frame"))?;
    writer
        .flush()
        .await
        .map_err(|e| DaemonError::io_no_path(e, "flush frame"))?;
    Ok(())
}

async fn read_message<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Option<(String, Data, Data)>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader
            .read(&mut len_buf[filled..])
            .await
            .map_err(|e| DaemonError::io_no_path(e, "read frame"))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DaemonError::protocol("connection closed inside frame header"));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(DaemonError::protocol(format!("frame of {len} bytes too large")));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| DaemonError::io_no_path(e, "read frame"))?;

    rmp_serde::from_slice(&payload)
        .map(Some)
        .map_err(|e| DaemonError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names_round_trip() {
        for command in [
            Command::Hello,
            Command::Bye,
            Command::Locate,
            Command::Transfer,
            Command::LsChecksums,
            Command::StorePath,
            Command::Preseed,
        ] {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
        assert!("FETCH".parse::<Command>().is_err());
    }

    #[tokio::test]
    async fn test_clean_eof_reads_as_none() {
        let mut empty: &[u8] = &[];
        assert!(Request::read_from(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let mut partial: &[u8] = &[0, 0];
        assert!(Request::read_from(&mut partial).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let header = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut reader: &[u8] = &header;
        let err = Request::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, DaemonError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_payload_is_a_three_element_array() {
        let request = Request::new(
            Command::Locate,
            Data::from([(fields::KEY.to_string(), "mimir:file:b:x".to_string())]),
            Data::new(),
        );
        let mut frame = Vec::new();
        request.write_to(&mut frame).await.unwrap();

        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        let (command, data, session): (String, Data, Data) =
            rmp_serde::from_slice(&frame[4..]).unwrap();
        assert_eq!(command, "LOCATE");
        assert_eq!(data[fields::KEY], "mimir:file:b:x");
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_ko_carries_message() {
        let response = Response::ko("no such key", Data::new());
        let mut frame = Vec::new();
        response.write_to(&mut frame).await.unwrap();
        let decoded = Response::read_from(&mut frame.as_slice()).await.unwrap().unwrap();
        assert_eq!(decoded.status, Status::Ko);
        assert_eq!(decoded.message(), Some("no such key"));
    }
}
