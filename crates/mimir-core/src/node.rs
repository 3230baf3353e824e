//! Cache node capabilities
//!
//! A node is one cache tier. What a node can do is expressed by the trait it
//! implements:
//!
//! - [`LocalNode`]: trusted, file-system capable, can store,
//! - [`SystemNode`]: the authoritative local node; stores remote entries and
//!   hands out entries that can be published to other processes,
//! - [`RemoteNode`]: a network peer whose content is only streamable.
//!
//! Every node has a fixed distance; chains are walked in ascending distance.

use crate::checksum::Checksums;
use crate::entry::{LocalEntry, Metadata, RemoteEntry, SystemEntry};
use crate::key::Key;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Behaviour shared by all nodes
#[async_trait]
pub trait Node: Send + Sync {
    /// Node name, used in logs and errors
    fn name(&self) -> &str;

    /// Routing cost; lower is tried first
    fn distance(&self) -> u32;

    /// Release resources
    ///
    /// Idempotent: only the first call has an effect, later calls succeed.
    ///
    /// # Errors
    ///
    /// Returns every error collected while releasing resources.
    async fn close(&self) -> Result<()>;
}

/// A trusted node on the local file system
#[async_trait]
pub trait LocalNode: Node {
    /// Look up a key; a miss is `Ok(None)`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeClosed`] after close, or the I/O failure that
    /// prevented checking for the key.
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn LocalEntry>>>;

    /// Durably store `file` under `key`
    ///
    /// Checksums that are provided are verified against the content.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is closed, read-only, the checksums do
    /// not match, or writing fails.
    async fn store(
        &self,
        key: &Key,
        file: &Path,
        metadata: &Metadata,
        checksums: &Checksums,
    ) -> Result<Arc<dyn LocalEntry>>;

    /// Checksum algorithms computed by this node, in configured order
    fn checksum_algorithms(&self) -> Vec<String>;
}

/// The authoritative local node
#[async_trait]
pub trait SystemNode: LocalNode {
    /// Look up a key, returning a publishable entry
    ///
    /// # Errors
    ///
    /// Same as [`LocalNode::locate`].
    async fn locate_system(&self, key: &Key) -> Result<Option<Arc<dyn SystemEntry>>>;

    /// Store a possibly remote entry by streaming its content
    ///
    /// # Errors
    ///
    /// Returns an error if streaming fails or the received content does not
    /// match the entry's checksums.
    async fn store_entry(&self, key: &Key, entry: &dyn RemoteEntry) -> Result<Arc<dyn SystemEntry>>;
}

/// A network peer
#[async_trait]
pub trait RemoteNode: Node {
    /// Look up a key; a miss is `Ok(None)`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeClosed`] after close, or a peer failure.
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn RemoteEntry>>>;
}

/// A node together with its capability
#[derive(Clone)]
pub enum AnyNode {
    /// Local node
    Local(Arc<dyn LocalNode>),
    /// System node
    System(Arc<dyn SystemNode>),
    /// Remote node
    Remote(Arc<dyn RemoteNode>),
}

impl AnyNode {
    /// Node name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Local(node) => node.name(),
            Self::System(node) => node.name(),
            Self::Remote(node) => node.name(),
        }
    }

    /// Capability label
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::System(_) => "system",
            Self::Remote(_) => "remote",
        }
    }

    /// Use as a local node; system nodes qualify
    #[must_use]
    pub fn into_local(self) -> Option<Arc<dyn LocalNode>> {
        match self {
            Self::Local(node) => Some(node),
            Self::System(node) => Some(node),
            Self::Remote(_) => None,
        }
    }

    /// Use as the system node
    #[must_use]
    pub fn into_system(self) -> Option<Arc<dyn SystemNode>> {
        match self {
            Self::System(node) => Some(node),
            _ => None,
        }
    }

    /// Use as a remote node
    #[must_use]
    pub fn into_remote(self) -> Option<Arc<dyn RemoteNode>> {
        match self {
            Self::Remote(node) => Some(node),
            _ => None,
        }
    }
}

impl std::fmt::Debug for AnyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyNode")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Open/closed state of a node
#[derive(Debug, Default)]
pub struct Lifecycle {
    closed: AtomicBool,
}

impl Lifecycle {
    /// A new, open lifecycle
    #[must_use]
    pub const fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
        }
    }

    /// Fail with [`Error::NodeClosed`] once closed
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeClosed`] naming `node` after [`Lifecycle::begin_close`].
    pub fn ensure_open(&self, node: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::closed(node))
        } else {
            Ok(())
        }
    }

    /// Mark closed; true only for the first caller
    pub fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Whether close has begun
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Close several nodes, collecting every failure
///
/// # Errors
///
/// Returns the aggregated close errors.
pub async fn close_all(nodes: &[&dyn Node]) -> Result<()> {
    let mut errors = Vec::new();
    for node in nodes {
        if let Err(e) = node.close().await {
            tracing::warn!(node = node.name(), error = %e, "Failed to close node");
            errors.push(e);
        }
    }
    Error::collect(errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_first_closer_wins() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.ensure_open("n").is_ok());
        assert!(lifecycle.begin_close());
        assert!(!lifecycle.begin_close());
        assert!(lifecycle.ensure_open("n").unwrap_err().is_closed());
    }
}
