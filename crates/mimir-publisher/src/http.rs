//! HTTP publisher.
//!
//! Serves `GET /txid/{token}` once per token. Unknown or used tokens are
//! answered with 404, other methods (HEAD included) with 405.

use crate::publisher::{Publication, Publications, Publisher, PublisherConfig};
use crate::token::TokenTable;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use mimir_core::{Entry, Error, Key, Result, SystemNode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

/// Name of the HTTP publisher
pub const HTTP_PUBLISHER_NAME: &str = "http";

/// Path prefix of publication URLs
pub const TXID_PREFIX: &str = "/txid/";

/// Router serving tokens from `tokens`.
pub fn router(tokens: Arc<TokenTable>) -> Router {
    Router::new()
        // axum routes HEAD to the GET handler unless HEAD has its own.
        .route("/txid/{token}", get(serve_token).head(method_not_allowed))
        .layer(TraceLayer::new_for_http())
        .with_state(tokens)
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, HeaderValue::from_static("GET"))],
    )
        .into_response()
}

async fn serve_token(
    State(tokens): State<Arc<TokenTable>>,
    Path(token): Path<String>,
) -> Response {
    let Some(entry) = tokens.redeem(&token) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let file = match entry.open().await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(error = %e, "Published entry vanished");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let length = match entry.info().content_length() {
        Some(length) => Some(length),
        None => file.metadata().await.ok().map(|m| m.len()),
    };
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(value) = entry
        .info()
        .last_modified()
        .and_then(|modified| HeaderValue::from_str(&http_date(modified)).ok())
    {
        headers.insert(header::LAST_MODIFIED, value);
    }

    (headers, Body::from_stream(ReaderStream::new(file))).into_response()
}

/// RFC 7231 date, as used by `Last-Modified`.
fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serves published entries over HTTP
pub struct HttpPublisher {
    publications: Publications,
    local_addr: SocketAddr,
    advertised: String,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl HttpPublisher {
    /// Bind the listener and start serving.
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
            .map_err(|e| Error::io_no_path(e, "http publisher address"))?;
        let advertised = config.advertised_address(local_addr);
        let publications = Publications::new(HTTP_PUBLISHER_NAME, system, config.token_ttl)?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let app = router(Arc::clone(publications.tokens()));
        let stop = shutdown.clone().cancelled_owned();
        tracker.spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                tracing::error!(error = %e, "HTTP publisher stopped");
            }
        });

        tracing::info!(address = %local_addr, advertised = %advertised, "HTTP publisher listening");
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
impl Publisher for HttpPublisher {
    fn name(&self) -> &str {
        self.publications.name()
    }

    async fn create_handle(&self, key: &Key) -> Result<Option<Publication>> {
        self.publications
            .publish(key, |token| {
                format!("http://{}{TXID_PREFIX}{token}", self.advertised)
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        if !self.publications.begin_close() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(address = %self.local_addr, "HTTP publisher closed");
        Ok(())
    }
}
