//! Cache-resolution engine
//!
//! [`CachingNode`] presents a chain of nodes as one local node:
//!
//! 1. local nodes in ascending distance, first hit wins,
//! 2. the system node,
//! 3. remote nodes in ascending distance; the first hit is stored into the
//!    system node and the stored local entry is returned.
//!
//! Equal distances keep registration order. Errors abort the walk: only a
//! miss moves on to the next node.

use crate::checksum::Checksums;
use crate::entry::{LocalEntry, Metadata};
use crate::key::Key;
use crate::node::{Lifecycle, LocalNode, Node, RemoteNode, SystemNode, close_all};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Name reported by the engine
pub const CACHING_NODE_NAME: &str = "caching";

/// Chain of local, system and remote nodes with promotion on remote hits
pub struct CachingNode {
    locals: Vec<Arc<dyn LocalNode>>,
    system: Arc<dyn SystemNode>,
    remotes: Vec<Arc<dyn RemoteNode>>,
    inflight: DashMap<Key, Arc<Mutex<()>>>,
    lifecycle: Lifecycle,
}

impl CachingNode {
    /// Build the chain; nodes are ordered by distance, ties keep the given order
    #[must_use]
    pub fn new(
        mut locals: Vec<Arc<dyn LocalNode>>,
        system: Arc<dyn SystemNode>,
        mut remotes: Vec<Arc<dyn RemoteNode>>,
    ) -> Self {
        locals.sort_by_key(|node| node.distance());
        remotes.sort_by_key(|node| node.distance());
        tracing::debug!(
            locals = ?locals.iter().map(|n| n.name()).collect::<Vec<_>>(),
            system = system.name(),
            remotes = ?remotes.iter().map(|n| n.name()).collect::<Vec<_>>(),
            "Caching node assembled"
        );
        Self {
            locals,
            system,
            remotes,
            inflight: DashMap::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// The system node writes go to
    #[must_use]
    pub fn system(&self) -> &Arc<dyn SystemNode> {
        &self.system
    }

    async fn locate_remote(&self, key: &Key) -> Result<Option<Arc<dyn LocalEntry>>> {
        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let outcome = {
            let _guard = gate.lock().await;
            self.promote(key).await
        };
        drop(gate);
        self.inflight
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
        outcome
    }

    async fn promote(&self, key: &Key) -> Result<Option<Arc<dyn LocalEntry>>> {
        // Another caller may have promoted while we waited for the gate.
        if let Some(entry) = self.system.locate(key).await? {
            return Ok(Some(entry));
        }
        for remote in &self.remotes {
            let Some(entry) = remote.locate(key).await? else {
                continue;
            };
            tracing::info!(key = %key, node = remote.name(), "Remote hit, promoting");
            let stored: Arc<dyn LocalEntry> = self.system.store_entry(key, entry.as_ref()).await?;
            return Ok(Some(stored));
        }
        Ok(None)
    }
}

impl std::fmt::Debug for CachingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingNode")
            .field("locals", &self.locals.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("system", &self.system.name())
            .field("remotes", &self.remotes.iter().map(|n| n.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Node for CachingNode {
    fn name(&self) -> &str {
        CACHING_NODE_NAME
    }

    fn distance(&self) -> u32 {
        0
    }

    async fn close(&self) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        let mut nodes: Vec<&dyn Node> = Vec::new();
        nodes.extend(self.locals.iter().map(|n| n.as_ref() as &dyn Node));
        nodes.push(self.system.as_ref());
        nodes.extend(self.remotes.iter().map(|n| n.as_ref() as &dyn Node));
        close_all(&nodes).await
    }
}

#[async_trait]
impl LocalNode for CachingNode {
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn LocalEntry>>> {
        self.lifecycle.ensure_open(CACHING_NODE_NAME)?;
        for local in &self.locals {
            if let Some(entry) = local.locate(key).await? {
                tracing::debug!(key = %key, node = local.name(), "Local hit");
                return Ok(Some(entry));
            }
        }
        if let Some(entry) = self.system.locate(key).await? {
            tracing::debug!(key = %key, node = self.system.name(), "System hit");
            return Ok(Some(entry));
        }
        if self.remotes.is_empty() {
            return Ok(None);
        }
        self.locate_remote(key).await
    }

    async fn store(
        &self,
        key: &Key,
        file: &Path,
        metadata: &Metadata,
        checksums: &Checksums,
    ) -> Result<Arc<dyn LocalEntry>> {
        self.lifecycle.ensure_open(CACHING_NODE_NAME)?;
        self.system.store(key, file, metadata, checksums).await
    }

    fn checksum_algorithms(&self) -> Vec<String> {
        self.system.checksum_algorithms()
    }
}

/// Overlay nodes checked before a base node, without promotion
pub struct OverlayingNode {
    overlays: Vec<Arc<dyn LocalNode>>,
    base: Arc<dyn LocalNode>,
    lifecycle: Lifecycle,
}

impl OverlayingNode {
    /// Overlays are checked in the given order, then the base
    #[must_use]
    pub fn new(overlays: Vec<Arc<dyn LocalNode>>, base: Arc<dyn LocalNode>) -> Self {
        Self {
            overlays,
            base,
            lifecycle: Lifecycle::new(),
        }
    }
}

impl std::fmt::Debug for OverlayingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayingNode")
            .field("overlays", &self.overlays.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("base", &self.base.name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Node for OverlayingNode {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn distance(&self) -> u32 {
        self.base.distance()
    }

    async fn close(&self) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        let mut nodes: Vec<&dyn Node> = self
            .overlays
            .iter()
            .map(|n| n.as_ref() as &dyn Node)
            .collect();
        nodes.push(self.base.as_ref());
        close_all(&nodes).await
    }
}

#[async_trait]
impl LocalNode for OverlayingNode {
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn LocalEntry>>> {
        self.lifecycle.ensure_open(self.base.name())?;
        for overlay in &self.overlays {
            if let Some(entry) = overlay.locate(key).await? {
                tracing::debug!(key = %key, node = overlay.name(), "Overlay hit");
                return Ok(Some(entry));
            }
        }
        self.base.locate(key).await
    }

    async fn store(
        &self,
        key: &Key,
        file: &Path,
        metadata: &Metadata,
        checksums: &Checksums,
    ) -> Result<Arc<dyn LocalEntry>> {
        self.lifecycle.ensure_open(self.base.name())?;
        self.base.store(key, file, metadata, checksums).await
    }

    fn checksum_algorithms(&self) -> Vec<String> {
        self.base.checksum_algorithms()
    }
}
