//! Flat configuration properties
//!
//! Every node and publisher factory receives the same effective
//! [`Properties`] and reads the well-known keys it cares about.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Well-known property keys
pub mod keys {
    /// Base directory of all mimir state
    pub const BASEDIR: &str = "mimir.basedir";

    /// Unix socket the daemon listens on
    pub const DAEMON_SOCKET_PATH: &str = "mimir.daemon.socketPath";
    /// Maximum number of connections served concurrently
    pub const DAEMON_WORKERS: &str = "mimir.daemon.workers";
    /// Factory name of the system node
    pub const DAEMON_SYSTEM_NODE: &str = "mimir.daemon.systemNode";
    /// Factory names of local nodes
    pub const DAEMON_LOCAL_NODES: &str = "mimir.daemon.localNodes";
    /// Factory names of remote nodes
    pub const DAEMON_REMOTE_NODES: &str = "mimir.daemon.remoteNodes";
    /// Factory names of publishers
    pub const DAEMON_PUBLISHERS: &str = "mimir.daemon.publishers";

    /// Root of the file node
    pub const FILE_BASEDIR: &str = "mimir.file.basedir";
    /// Checksum algorithms of the file node
    pub const FILE_CHECKSUM_ALGORITHMS: &str = "mimir.file.checksumAlgorithms";
    /// Whether the file node may hard link instead of copy
    pub const FILE_MAY_LINK: &str = "mimir.file.mayLink";
    /// Key layout of the file node
    pub const FILE_LAYOUT: &str = "mimir.file.layout";

    /// Root of the read-only bundle node
    pub const BUNDLE_BASEDIR: &str = "mimir.bundle.basedir";
    /// Distance of the bundle node
    pub const BUNDLE_DISTANCE: &str = "mimir.bundle.distance";

    /// Root URL of the HTTP mirror node
    pub const HTTP_BASE_URL: &str = "mimir.http.baseUrl";
    /// Distance of the HTTP mirror node
    pub const HTTP_DISTANCE: &str = "mimir.http.distance";
    /// Connect and read timeout of the HTTP mirror node
    pub const HTTP_TIMEOUT_MS: &str = "mimir.http.timeoutMs";
    /// Checksum sidecars fetched by the HTTP mirror node
    pub const HTTP_CHECKSUM_ALGORITHMS: &str = "mimir.http.checksumAlgorithms";

    /// Peers of the group node
    pub const GROUP_PEERS: &str = "mimir.group.peers";
    /// UDP address the group publisher answers on
    pub const GROUP_BIND_ADDRESS: &str = "mimir.group.bindAddress";
    /// Distance of the group node
    pub const GROUP_DISTANCE: &str = "mimir.group.distance";
    /// How long the group node waits for answers
    pub const GROUP_TIMEOUT_MS: &str = "mimir.group.timeoutMs";

    /// Lifetime of an unredeemed publication token
    pub const PUBLISHER_TOKEN_TTL_MS: &str = "mimir.publisher.tokenTtlMs";
    /// TCP address of the raw socket publisher
    pub const PUBLISHER_SOCKET_BIND_ADDRESS: &str = "mimir.publisher.socket.bindAddress";
    /// TCP address of the HTTP publisher
    pub const PUBLISHER_HTTP_BIND_ADDRESS: &str = "mimir.publisher.http.bindAddress";
    /// Host name put into locators
    pub const PUBLISHER_ADVERTISED_HOST: &str = "mimir.publisher.advertisedHost";
}

/// Effective configuration: an ordered string to string map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Empty properties
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace a value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Overlay `other` on top of these properties
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Raw value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Raw value or a default
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Required raw value
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the key is absent or blank.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::configuration(format!("missing required property '{key}'")))
    }

    /// Parsed value or a default
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the key when parsing fails.
    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                Error::configuration(format!("property '{key}' has invalid value '{raw}'"))
            }),
        }
    }

    /// Boolean value (`true`/`false`) or a default
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the key for other values.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        self.get_parsed(key, default)
    }

    /// Millisecond value as a duration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the key when not a number.
    pub fn get_duration_ms(&self, key: &str, default: Duration) -> Result<Duration> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.get_parsed(key, default_ms).map(Duration::from_millis)
    }

    /// Comma separated list, trimmed, blanks dropped
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key).map(split_list).unwrap_or_default()
    }

    /// Comma separated list or a default list
    #[must_use]
    pub fn get_list_or(&self, key: &str, default: &str) -> Vec<String> {
        split_list(self.get_or(key, default))
    }

    /// Iterate over all entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
