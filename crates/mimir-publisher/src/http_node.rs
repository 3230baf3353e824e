//! Remote node over a static HTTP mirror.
//!
//! Objects are laid out with a key layout below a base URL. `HEAD` answers
//! presence and metadata, `<url>.sha1` style sidecars carry checksums and
//! `GET` streams the content.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mimir_core::checksum::{self, SHA_1};
use mimir_core::entry::content_metadata;
use mimir_core::node::Lifecycle;
use mimir_core::properties::keys;
use mimir_core::resolver::{self, DEFAULT_LAYOUT};
use mimir_core::{
    Checksums, Entry, EntryInfo, Error, Key, KeyResolver, Node, Properties, RemoteEntry,
    RemoteNode, Result,
};
use reqwest::{StatusCode, Url};
use reqwest::header::{CONTENT_LENGTH, LAST_MODIFIED};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Name of the HTTP mirror node
pub const HTTP_NODE_NAME: &str = "http";

/// Default distance of the HTTP mirror node
pub const DEFAULT_DISTANCE: u32 = 100;

/// Default connect and read timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings of an [`HttpNode`]
#[derive(Debug, Clone)]
pub struct HttpNodeConfig {
    /// Node name
    pub name: String,
    /// URL objects are laid out below
    pub base_url: String,
    /// Routing cost
    pub distance: u32,
    /// Connect and read timeout
    pub timeout: Duration,
    /// Algorithms whose sidecars are fetched
    pub checksum_algorithms: Vec<String>,
    /// Key layout name
    pub layout: String,
}

impl HttpNodeConfig {
    /// Mirror at `base_url` with defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: HTTP_NODE_NAME.to_string(),
            base_url: base_url.into(),
            distance: DEFAULT_DISTANCE,
            timeout: DEFAULT_TIMEOUT,
            checksum_algorithms: vec![SHA_1.to_string()],
            layout: DEFAULT_LAYOUT.to_string(),
        }
    }

    /// Read the `mimir.http.*` keys.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `mimir.http.baseUrl` is missing or a
    /// value is malformed.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        Ok(Self {
            distance: properties.get_parsed(keys::HTTP_DISTANCE, DEFAULT_DISTANCE)?,
            timeout: properties.get_duration_ms(keys::HTTP_TIMEOUT_MS, DEFAULT_TIMEOUT)?,
            checksum_algorithms: properties.get_list_or(keys::HTTP_CHECKSUM_ALGORITHMS, SHA_1),
            ..Self::new(properties.require(keys::HTTP_BASE_URL)?)
        })
    }
}

/// Remote node reading a static mirror
pub struct HttpNode {
    config: HttpNodeConfig,
    base: Url,
    algorithms: Vec<&'static str>,
    client: reqwest::Client,
    resolver: Arc<dyn KeyResolver>,
    lifecycle: Lifecycle,
}

impl HttpNode {
    /// Build the node and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unusable base URL, unknown
    /// layouts or unknown algorithms.
    pub fn new(config: HttpNodeConfig) -> Result<Self> {
        let algorithms = checksum::factories(&config.checksum_algorithms)?
            .into_iter()
            .map(checksum::ChecksumAlgorithmFactory::name)
            .collect();
        let base = Url::parse(&config.base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                Error::configuration(format!("invalid mirror base URL '{}'", config.base_url))
            })?;
        let resolver = resolver::resolver_for(&config.layout)?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .map_err(|e| Error::configuration(format!("http client: {e}")))?;
        Ok(Self {
            config,
            base,
            algorithms,
            client,
            resolver,
            lifecycle: Lifecycle::new(),
        })
    }

    fn url(&self, key: &Key) -> Result<String> {
        let relative = self.resolver.resolve(key)?;
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                Error::configuration(format!("invalid mirror base URL '{}'", self.base))
            })?
            .pop_if_empty()
            .extend(
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy()),
            );
        Ok(url.into())
    }

    async fn fetch_checksums(&self, url: &str) -> Result<Checksums> {
        let mut checksums = Checksums::new();
        for algorithm in &self.algorithms {
            let sidecar = format!("{url}.{}", sidecar_extension(algorithm));
            let response = self
                .client
                .get(&sidecar)
                .send()
                .await
                .map_err(|e| Error::peer(&sidecar, e.to_string()))?;
            if !response.status().is_success() {
                tracing::debug!(url = %sidecar, status = %response.status(), "No checksum sidecar");
                continue;
            }
            let body = response
                .text()
                .await
                .map_err(|e| Error::peer(&sidecar, e.to_string()))?;
            if let Some(digest) = body.split_whitespace().next() {
                checksums.insert((*algorithm).to_string(), digest.to_ascii_lowercase());
            }
        }
        Ok(checksums)
    }
}

/// `SHA-256` becomes `sha256`
fn sidecar_extension(algorithm: &str) -> String {
    algorithm.to_ascii_lowercase().replace('-', "")
}

#[async_trait]
impl Node for HttpNode {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn distance(&self) -> u32 {
        self.config.distance
    }

    async fn close(&self) -> Result<()> {
        self.lifecycle.begin_close();
        Ok(())
    }
}

#[async_trait]
impl RemoteNode for HttpNode {
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn RemoteEntry>>> {
        self.lifecycle.ensure_open(&self.config.name)?;
        let url = self.url(key)?;
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| Error::peer(&url, e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Ok(None),
            status if !status.is_success() => {
                return Err(Error::peer(&url, format!("HTTP {status}")));
            }
            _ => {}
        }

        let headers = response.headers();
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));
        let metadata = match length {
            Some(length) => content_metadata(length, modified),
            None => mimir_core::Metadata::new(),
        };
        let checksums = self.fetch_checksums(&url).await?;

        tracing::debug!(key = %key, url = %url, "Mirror hit");
        Ok(Some(Arc::new(HttpEntry {
            info: EntryInfo::new(metadata, checksums),
            url,
            client: self.client.clone(),
        })))
    }
}

/// Entry on an HTTP mirror
#[derive(Debug)]
pub struct HttpEntry {
    info: EntryInfo,
    url: String,
    client: reqwest::Client,
}

impl Entry for HttpEntry {
    fn info(&self) -> &EntryInfo {
        &self.info
    }
}

#[async_trait]
impl RemoteEntry for HttpEntry {
    async fn handle_content(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::peer(&self.url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::peer(&self.url, format!("HTTP {}", response.status())));
        }
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::peer(&self.url, e.to_string()))?;
            sink.write_all(&chunk)
                .await
                .map_err(|e| Error::io_no_path(e, "write mirror content"))?;
            written += chunk.len() as u64;
        }
        sink.flush()
            .await
            .map_err(|e| Error::io_no_path(e, "flush mirror content"))?;
        Ok(written)
    }
}
