//! Group control plane.
//!
//! Peers exchange MessagePack encoded [`GroupMessage`] datagrams over UDP.
//! A [`GroupNode`] fans a `Locate` out to every peer and takes the first
//! `Located`; a [`GroupPublisher`] answers `Locate` requests by publishing
//! through a side-channel publisher and replying with its locator. A peer
//! whose lookup fails answers `Failed`, which the node reports as an error
//! unless another peer has the entry.

use crate::locator::{DEFAULT_CONNECT_TIMEOUT, Locator, PublishedEntry};
use crate::publisher::{Publication, Publisher};
use async_trait::async_trait;
use mimir_core::node::Lifecycle;
use mimir_core::properties::keys;
use mimir_core::{
    Entry, EntryInfo, Error, Key, Node, Properties, RemoteEntry, RemoteNode, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Name of the group node and publisher
pub const GROUP_NAME: &str = "group";

/// Default UDP address the group publisher answers on
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:9780";

/// Default distance of the group node
pub const DEFAULT_DISTANCE: u32 = 50;

/// Default time the group node waits for answers
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagram exchanged between group members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// Who has `key`?
    Locate {
        /// Correlates answers with the request
        request_id: String,
        /// Encoded key
        key: String,
    },
    /// The sender published `key` at `locator`
    Located {
        /// Request being answered
        request_id: String,
        /// Where to fetch the bytes
        locator: String,
        /// Merged `m.`/`c.` entry map
        entry: BTreeMap<String, String>,
    },
    /// The sender does not have the key
    NotFound {
        /// Request being answered
        request_id: String,
    },
    /// The sender could not look the key up
    Failed {
        /// Request being answered
        request_id: String,
        /// What went wrong
        message: String,
    },
}

impl GroupMessage {
    /// Request id carried by any variant.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Locate { request_id, .. }
            | Self::Located { request_id, .. }
            | Self::NotFound { request_id }
            | Self::Failed { request_id, .. } => request_id,
        }
    }

    /// Encode as MessagePack.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::peer(GROUP_NAME, e.to_string()))
    }

    /// Decode from MessagePack.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed datagrams.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::peer(GROUP_NAME, e.to_string()))
    }
}

/// Settings of the group node and publisher
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Peers asked on locate, `host:port`
    pub peers: Vec<String>,
    /// UDP address the publisher answers on
    pub bind_address: String,
    /// Distance of the node
    pub distance: u32,
    /// How long locate waits for answers
    pub timeout: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            distance: DEFAULT_DISTANCE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl GroupConfig {
    /// Read the `mimir.group.*` keys.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed values.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        Ok(Self {
            peers: properties.get_list(keys::GROUP_PEERS),
            bind_address: properties
                .get_or(keys::GROUP_BIND_ADDRESS, DEFAULT_BIND_ADDRESS)
                .to_string(),
            distance: properties.get_parsed(keys::GROUP_DISTANCE, DEFAULT_DISTANCE)?,
            timeout: properties.get_duration_ms(keys::GROUP_TIMEOUT_MS, DEFAULT_TIMEOUT)?,
        })
    }
}

// ============================================================================
// Requesting side
// ============================================================================

/// Remote node asking group peers for entries
pub struct GroupNode {
    config: GroupConfig,
    lifecycle: Lifecycle,
}

impl GroupNode {
    /// Node asking `config.peers`.
    #[must_use]
    pub const fn new(config: GroupConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(),
        }
    }

    async fn ask(&self, key: &Key) -> Result<Option<Arc<dyn RemoteEntry>>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::io_no_path(e, "bind group socket"))?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = GroupMessage::Locate {
            request_id: request_id.clone(),
            key: key.to_string(),
        }
        .encode()?;

        for peer in &self.config.peers {
            socket
                .send_to(&request, peer.as_str())
                .await
                .map_err(|e| Error::peer(peer.as_str(), e.to_string()))?;
        }

        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut answered: HashSet<SocketAddr> = HashSet::new();
        let mut failure: Option<Error> = None;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Ok(received) =
                tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
            else {
                tracing::debug!(key = %key, answered = answered.len(), "Group locate timed out");
                return failure.map_or(Ok(None), Err);
            };
            let (len, from) = received.map_err(|e| Error::io_no_path(e, "receive group answer"))?;
            let message = match GroupMessage::decode(&buf[..len]) {
                Ok(message) if message.request_id() == request_id => message,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "Ignoring malformed group datagram");
                    continue;
                }
            };
            match message {
                GroupMessage::Located { locator, entry, .. } => {
                    let locator: Locator = locator.parse()?;
                    tracing::debug!(key = %key, %from, "Group hit");
                    let entry = PublishedEntry::new(
                        EntryInfo::from_merged(&entry),
                        locator,
                        DEFAULT_CONNECT_TIMEOUT,
                    );
                    return Ok(Some(Arc::new(entry)));
                }
                GroupMessage::NotFound { .. } => {
                    answered.insert(from);
                }
                GroupMessage::Failed { message, .. } => {
                    tracing::debug!(key = %key, %from, error = %message, "Group peer failed");
                    answered.insert(from);
                    if failure.is_none() {
                        failure = Some(Error::peer(from.to_string(), message));
                    }
                }
                GroupMessage::Locate { .. } => continue,
            }
            if answered.len() >= self.config.peers.len() {
                return failure.map_or(Ok(None), Err);
            }
        }
    }
}

#[async_trait]
impl Node for GroupNode {
    fn name(&self) -> &str {
        GROUP_NAME
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
impl RemoteNode for GroupNode {
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn RemoteEntry>>> {
        self.lifecycle.ensure_open(GROUP_NAME)?;
        if self.config.peers.is_empty() {
            return Ok(None);
        }
        self.ask(key).await
    }
}

// ============================================================================
// Answering side
// ============================================================================

/// Answers group `Locate` requests through a side-channel publisher
pub struct GroupPublisher {
    side_channel: Arc<dyn Publisher>,
    local_addr: SocketAddr,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl GroupPublisher {
    /// Bind the UDP socket and start answering.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(side_channel: Arc<dyn Publisher>, bind_address: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_address)
            .await
            .map_err(|e| Error::io_no_path(e, format!("bind {bind_address}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::io_no_path(e, "group publisher address"))?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(answer_loop(
            Arc::new(socket),
            Arc::clone(&side_channel),
            shutdown.clone(),
            tracker.clone(),
        ));

        tracing::info!(address = %local_addr, side_channel = side_channel.name(), "Group publisher listening");
        Ok(Self {
            side_channel,
            local_addr,
            lifecycle: Lifecycle::new(),
            shutdown,
            tracker,
        })
    }

    /// Address the UDP socket is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Publisher for GroupPublisher {
    fn name(&self) -> &str {
        GROUP_NAME
    }

    async fn create_handle(&self, key: &Key) -> Result<Option<Publication>> {
        self.lifecycle.ensure_open(GROUP_NAME)?;
        self.side_channel.create_handle(key).await
    }

    async fn close(&self) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.side_channel.close().await
    }
}

async fn answer_loop(
    socket: Arc<UdpSocket>,
    side_channel: Arc<dyn Publisher>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        let datagram = buf[..len].to_vec();
                        let socket = Arc::clone(&socket);
                        let side_channel = Arc::clone(&side_channel);
                        tracker.spawn(async move {
                            let Some(reply) = answer(&datagram, side_channel.as_ref()).await else {
                                return;
                            };
                            if let Err(e) = socket.send_to(&reply, from).await {
                                tracing::debug!(%from, error = %e, "Failed to answer group request");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to receive group datagram");
                    }
                }
            }

            () = shutdown.cancelled() => {
                break;
            }
        }
    }
}

/// Encoded answer to one datagram; `None` when it deserves no answer.
async fn answer(datagram: &[u8], side_channel: &dyn Publisher) -> Option<Vec<u8>> {
    let GroupMessage::Locate { request_id, key } = GroupMessage::decode(datagram).ok()? else {
        return None;
    };
    let reply = match key.parse::<Key>() {
        Ok(key) => match side_channel.create_handle(&key).await {
            Ok(Some(publication)) => GroupMessage::Located {
                request_id,
                locator: publication.locator,
                entry: publication.entry.info().to_merged(),
            },
            Ok(None) => GroupMessage::NotFound { request_id },
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Group publication failed");
                GroupMessage::Failed {
                    request_id,
                    message: e.to_string(),
                }
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "Group request for invalid key");
            GroupMessage::Failed {
                request_id,
                message: e.to_string(),
            }
        }
    };
    reply.encode().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip_keeps_request_id() {
        let message = GroupMessage::Located {
            request_id: "r-1".to_string(),
            locator: "127.0.0.1:1 token".to_string(),
            entry: BTreeMap::from([("m.content-length".to_string(), "3".to_string())]),
        };
        let decoded = GroupMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.request_id(), "r-1");
    }

    #[tokio::test]
    async fn test_invalid_key_is_answered_with_failure() {
        struct Unused;

        #[async_trait]
        impl Publisher for Unused {
            fn name(&self) -> &str {
                "unused"
            }

            async fn create_handle(&self, _key: &Key) -> Result<Option<Publication>> {
                Ok(None)
            }

            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let request = GroupMessage::Locate {
            request_id: "r-2".to_string(),
            key: "not-a-key".to_string(),
        }
        .encode()
        .unwrap();
        let reply = answer(&request, &Unused).await.unwrap();
        match GroupMessage::decode(&reply).unwrap() {
            GroupMessage::Failed { request_id, message } => {
                assert_eq!(request_id, "r-2");
                assert!(message.contains("not-a-key"), "{message}");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_config_defaults_and_overrides() {
        let defaults = GroupConfig::from_properties(&Properties::new()).unwrap();
        assert!(defaults.peers.is_empty());
        assert_eq!(defaults.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(defaults.distance, DEFAULT_DISTANCE);

        let props = Properties::new()
            .with(keys::GROUP_PEERS, "10.0.0.1:9780, 10.0.0.2:9780")
            .with(keys::GROUP_TIMEOUT_MS, "250");
        let config = GroupConfig::from_properties(&props).unwrap();
        assert_eq!(config.peers, vec!["10.0.0.1:9780", "10.0.0.2:9780"]);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_node_without_peers_misses() {
        let node = GroupNode::new(GroupConfig::default());
        let key: Key = "mimir:file:bucket:a".parse().unwrap();
        assert!(node.locate(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_as_miss() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node = GroupNode::new(GroupConfig {
            peers: vec![silent.local_addr().unwrap().to_string()],
            timeout: Duration::from_millis(100),
            ..GroupConfig::default()
        });
        let key: Key = "mimir:file:bucket:a".parse().unwrap();
        assert!(node.locate(&key).await.unwrap().is_none());
    }
}
