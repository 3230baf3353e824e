//! Publisher contract and the state every transport shares

use crate::token::{DEFAULT_TOKEN_TTL, TokenTable};
use async_trait::async_trait;
use mimir_core::node::Lifecycle;
use mimir_core::properties::keys;
use mimir_core::{Key, Properties, Result, SystemEntry, SystemNode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default TCP bind address of the socket and HTTP publishers
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:0";

/// How long a socket consumer may take to send its token
pub const DEFAULT_TOKEN_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A published entry: the locator to hand out and the entry behind it
#[derive(Debug, Clone)]
pub struct Publication {
    /// Where and how to fetch the bytes, exactly once
    pub locator: String,
    /// The system entry the locator serves
    pub entry: Arc<dyn SystemEntry>,
}

/// Exposes system-node entries to other processes or hosts
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publisher name, used in logs
    fn name(&self) -> &str;

    /// Publish the entry for `key`, or `None` when the system node misses
    ///
    /// # Errors
    ///
    /// Returns an error if the publisher is closed or the lookup fails.
    async fn create_handle(&self, key: &Key) -> Result<Option<Publication>>;

    /// Stop serving and drop every outstanding token; idempotent
    ///
    /// # Errors
    ///
    /// Returns an error if releasing resources fails.
    async fn close(&self) -> Result<()>;
}

/// Settings shared by the TCP based publishers
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Address to bind, `host:port`
    pub bind_address: String,
    /// Host written into locators instead of the bound one
    pub advertised_host: Option<String>,
    /// Lifetime of unredeemed tokens
    pub token_ttl: Duration,
    /// Time a consumer has to present its token
    pub read_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            advertised_host: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            read_timeout: DEFAULT_TOKEN_READ_TIMEOUT,
        }
    }
}

impl PublisherConfig {
    /// Loopback configuration on an ephemeral port
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }

    /// Settings of the raw socket publisher
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed values.
    pub fn socket(properties: &Properties) -> Result<Self> {
        Self::from_properties(properties, keys::PUBLISHER_SOCKET_BIND_ADDRESS)
    }

    /// Settings of the HTTP publisher
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed values.
    pub fn http(properties: &Properties) -> Result<Self> {
        Self::from_properties(properties, keys::PUBLISHER_HTTP_BIND_ADDRESS)
    }

    fn from_properties(properties: &Properties, bind_key: &str) -> Result<Self> {
        Ok(Self {
            bind_address: properties.get_or(bind_key, DEFAULT_BIND_ADDRESS).to_string(),
            advertised_host: properties
                .get(keys::PUBLISHER_ADVERTISED_HOST)
                .map(ToString::to_string),
            token_ttl: properties.get_duration_ms(keys::PUBLISHER_TOKEN_TTL_MS, DEFAULT_TOKEN_TTL)?,
            read_timeout: DEFAULT_TOKEN_READ_TIMEOUT,
        })
    }

    /// `host:port` to put into locators for a listener bound at `local`
    #[must_use]
    pub fn advertised_address(&self, local: SocketAddr) -> String {
        match &self.advertised_host {
            Some(host) => format!("{host}:{}", local.port()),
            None if local.ip().is_unspecified() => {
                let loopback = if local.is_ipv4() { "127.0.0.1" } else { "[::1]" };
                format!("{loopback}:{}", local.port())
            }
            None => local.to_string(),
        }
    }
}

/// Lookup, token minting and lifecycle common to every publisher
pub(crate) struct Publications {
    name: String,
    system: Arc<dyn SystemNode>,
    tokens: Arc<TokenTable>,
    lifecycle: Lifecycle,
}

impl Publications {
    pub(crate) fn new(
        name: impl Into<String>,
        system: Arc<dyn SystemNode>,
        ttl: Duration,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            system,
            tokens: Arc::new(TokenTable::new(ttl)?),
            lifecycle: Lifecycle::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn tokens(&self) -> &Arc<TokenTable> {
        &self.tokens
    }

    /// Locate `key` on the system node and mint a token for it
    pub(crate) async fn publish(
        &self,
        key: &Key,
        locator: impl FnOnce(&str) -> String,
    ) -> Result<Option<Publication>> {
        self.lifecycle.ensure_open(&self.name)?;
        let Some(entry) = self.system.locate_system(key).await? else {
            tracing::debug!(publisher = %self.name, key = %key, "Nothing to publish");
            return Ok(None);
        };
        let token = self.tokens.insert(entry.clone())?;
        tracing::debug!(publisher = %self.name, key = %key, "Published entry");
        Ok(Some(Publication {
            locator: locator(&token),
            entry,
        }))
    }

    /// Mark closed and drop all tokens; `false` when already closed
    pub(crate) fn begin_close(&self) -> bool {
        if !self.lifecycle.begin_close() {
            return false;
        }
        self.tokens.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_address_prefers_configured_host() {
        let config = PublisherConfig {
            advertised_host: Some("cache.example".to_string()),
            ..PublisherConfig::default()
        };
        let local: SocketAddr = "0.0.0.0:4711".parse().unwrap();
        assert_eq!(config.advertised_address(local), "cache.example:4711");
    }

    #[test]
    fn test_advertised_address_replaces_unspecified_host() {
        let config = PublisherConfig::default();
        assert_eq!(
            config.advertised_address("0.0.0.0:80".parse().unwrap()),
            "127.0.0.1:80"
        );
        assert_eq!(config.advertised_address("[::]:80".parse().unwrap()), "[::1]:80");
        assert_eq!(
            config.advertised_address("10.1.2.3:80".parse().unwrap()),
            "10.1.2.3:80"
        );
    }

    #[test]
    fn test_config_from_properties() {
        let props = Properties::new()
            .with(keys::PUBLISHER_HTTP_BIND_ADDRESS, "127.0.0.1:8080")
            .with(keys::PUBLISHER_TOKEN_TTL_MS, "1500");
        let http = PublisherConfig::http(&props).unwrap();
        assert_eq!(http.bind_address, "127.0.0.1:8080");
        assert_eq!(http.token_ttl, Duration::from_millis(1500));

        let socket = PublisherConfig::socket(&props).unwrap();
        assert_eq!(socket.bind_address, DEFAULT_BIND_ADDRESS);
    }

    #[test]
    fn test_malformed_ttl_is_rejected() {
        let props = Properties::new().with(keys::PUBLISHER_TOKEN_TTL_MS, "soon");
        assert!(PublisherConfig::socket(&props).is_err());
    }
}
