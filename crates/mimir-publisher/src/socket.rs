//! Raw TCP socket publisher.
//!
//! A consumer connects, writes the 36 byte token and reads the entry bytes
//! until the publisher closes the connection. Unknown tokens get an
//! immediately closed connection.

use crate::publisher::{Publication, Publications, Publisher, PublisherConfig};
use crate::token::{TOKEN_LEN, TokenTable};
use async_trait::async_trait;
use mimir_core::{Error, Key, Result, SystemNode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Name of the raw socket publisher
pub const SOCKET_PUBLISHER_NAME: &str = "socket";

/// Serves published entries over plain TCP
pub struct SocketPublisher {
    publications: Publications,
    local_addr: SocketAddr,
    advertised: String,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl SocketPublisher {
    /// Bind the listener and start accepting consumers.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid or cannot be bound.
    pub async fn start(system: Arc<dyn SystemNode>, config: PublisherConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| Error::io_no_path(e, format!("bind {}", config.bind_address)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::io_no_path(e, "socket publisher address"))?;
        let advertised = config.advertised_address(local_addr);
        let publications = Publications::new(SOCKET_PUBLISHER_NAME, system, config.token_ttl)?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            Arc::clone(publications.tokens()),
            config.read_timeout,
            shutdown.clone(),
            tracker.clone(),
        ));

        tracing::info!(address = %local_addr, advertised = %advertised, "Socket publisher listening");
        Ok(Self {
            publications,
            local_addr,
            advertised,
            shutdown,
            tracker,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Publisher for SocketPublisher {
    fn name(&self) -> &str {
        self.publications.name()
    }

    async fn create_handle(&self, key: &Key) -> Result<Option<Publication>> {
        self.publications
            .publish(key, |token| format!("{} {token}", self.advertised))
            .await
    }

    async fn close(&self) -> Result<()> {
        if !self.publications.begin_close() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(address = %self.local_addr, "Socket publisher closed");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    tokens: Arc<TokenTable>,
    read_timeout: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let tokens = Arc::clone(&tokens);
                        tracker.spawn(async move {
                            match serve_consumer(stream, &tokens, read_timeout).await {
                                Ok(Some(bytes)) => tracing::debug!(%peer, bytes, "Publication served"),
                                Ok(None) => tracing::debug!(%peer, "Unknown token, connection closed"),
                                Err(e) => tracing::debug!(%peer, error = %e, "Publication failed"),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                }
            }

            () = shutdown.cancelled() => {
                break;
            }
        }
    }
}

/// Read one token and stream the matching entry; `None` for unknown tokens.
async fn serve_consumer(
    mut stream: TcpStream,
    tokens: &TokenTable,
    read_timeout: Duration,
) -> Result<Option<u64>> {
    let mut token = [0u8; TOKEN_LEN];
    tokio::time::timeout(read_timeout, stream.read_exact(&mut token))
        .await
        .map_err(|_| Error::unavailable("socket publisher", "timed out waiting for token"))?
        .map_err(|e| Error::io_no_path(e, "read token"))?;

    let Some(entry) = std::str::from_utf8(&token)
        .ok()
        .and_then(|token| tokens.redeem(token))
    else {
        return Ok(None);
    };

    let mut file = entry.open().await?;
    let bytes = tokio::io::copy(&mut file, &mut stream)
        .await
        .map_err(|e| Error::io_no_path(e, "send entry"))?;
    stream
        .shutdown()
        .await
        .map_err(|e| Error::io_no_path(e, "close connection"))?;
    Ok(Some(bytes))
}
