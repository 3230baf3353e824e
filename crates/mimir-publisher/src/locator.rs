//! Locators and their redemption.
//!
//! A locator is either an HTTP URL (`http://host:port/txid/<token>`) or a
//! raw socket address followed by a token (`host:port <token>`).

use crate::token::TOKEN_LEN;
use async_trait::async_trait;
use futures::StreamExt;
use mimir_core::{Entry, EntryInfo, Error, RemoteEntry, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default bound on establishing a redemption connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed publication locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Fetch with an HTTP GET
    Http(String),
    /// Connect, send the token, read until EOF
    Socket {
        /// `host:port`
        address: String,
        /// 36 character token
        token: String,
    },
}

impl Locator {
    /// Peer the locator points at, for logs and errors.
    #[must_use]
    pub fn peer(&self) -> &str {
        match self {
            Self::Http(url) => url,
            Self::Socket { address, .. } => address,
        }
    }
}

impl FromStr for Locator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Self::Http(s.to_string()));
        }
        match s.split_once(' ') {
            Some((address, token)) if !address.is_empty() && token.len() == TOKEN_LEN => {
                Ok(Self::Socket {
                    address: address.to_string(),
                    token: token.to_string(),
                })
            }
            _ => Err(Error::peer(s, "malformed locator")),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => f.write_str(url),
            Self::Socket { address, token } => write!(f, "{address} {token}"),
        }
    }
}

/// Fetch the bytes behind `locator` into `sink`, returning the byte count.
///
/// # Errors
///
/// Returns [`Error::Peer`] when the publisher refuses or fails, and an I/O
/// error when writing to `sink` fails.
pub async fn redeem(
    locator: &Locator,
    sink: &mut (dyn AsyncWrite + Send + Unpin),
    connect_timeout: Duration,
) -> Result<u64> {
    let bytes = match locator {
        Locator::Http(url) => redeem_http(url, sink, connect_timeout).await?,
        Locator::Socket { address, token } => {
            redeem_socket(address, token, sink, connect_timeout).await?
        }
    };
    sink.flush()
        .await
        .map_err(|e| Error::io_no_path(e, "flush redeemed content"))?;
    tracing::debug!(peer = locator.peer(), bytes, "Locator redeemed");
    Ok(bytes)
}

async fn redeem_http(
    url: &str,
    sink: &mut (dyn AsyncWrite + Send + Unpin),
    connect_timeout: Duration,
) -> Result<u64> {
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| Error::peer(url, e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::peer(url, e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::peer(url, format!("HTTP {}", response.status())));
    }

    let mut body = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Error::peer(url, e.to_string()))?;
        sink.write_all(&chunk)
            .await
            .map_err(|e| Error::io_no_path(e, "write redeemed content"))?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

async fn redeem_socket(
    address: &str,
    token: &str,
    sink: &mut (dyn AsyncWrite + Send + Unpin),
    connect_timeout: Duration,
) -> Result<u64> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::peer(address, "connect timed out"))?
        .map_err(|e| Error::peer(address, e.to_string()))?;
    stream
        .write_all(token.as_bytes())
        .await
        .map_err(|e| Error::peer(address, e.to_string()))?;
    tokio::io::copy(&mut stream, sink)
        .await
        .map_err(|e| Error::peer(address, e.to_string()))
}

/// Remote entry whose content is fetched by redeeming a locator.
#[derive(Debug)]
pub struct PublishedEntry {
    info: EntryInfo,
    locator: Locator,
    connect_timeout: Duration,
}

impl PublishedEntry {
    /// Entry described by `info`, served at `locator`.
    #[must_use]
    pub const fn new(info: EntryInfo, locator: Locator, connect_timeout: Duration) -> Self {
        Self {
            info,
            locator,
            connect_timeout,
        }
    }

    /// Where the content is served.
    #[must_use]
    pub const fn locator(&self) -> &Locator {
        &self.locator
    }
}

impl Entry for PublishedEntry {
    fn info(&self) -> &EntryInfo {
        &self.info
    }
}

#[async_trait]
impl RemoteEntry for PublishedEntry {
    async fn handle_content(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        redeem(&self.locator, sink, self.connect_timeout).await
    }
}
