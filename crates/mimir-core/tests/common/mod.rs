//! Shared fixtures for node integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use mimir_core::checksum::{self, Checksummer};
use mimir_core::entry::content_metadata;
use mimir_core::node::Lifecycle;
use mimir_core::{
    Checksums, Entry, EntryInfo, Error, FileNode, FileNodeConfig, Key, LocalEntry, Node,
    RemoteEntry, RemoteNode, Result,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const ALGORITHMS: [&str; 2] = ["SHA-1", "SHA-512"];

pub fn digests(content: &[u8]) -> Checksums {
    let mut checksummer = Checksummer::new(&checksum::factories(&ALGORITHMS).unwrap());
    checksummer.update(content);
    checksummer.finish()
}

pub fn file_node(root: &Path, name: &str, distance: u32) -> Arc<FileNode> {
    Arc::new(
        FileNode::new(FileNodeConfig::new(name, root.join(name)).with_distance(distance)).unwrap(),
    )
}

static SCRATCH: AtomicUsize = AtomicUsize::new(0);

fn scratch(root: &Path) -> std::path::PathBuf {
    root.join("scratch")
        .join(SCRATCH.fetch_add(1, Ordering::SeqCst).to_string())
}

pub async fn seed(node: &FileNode, root: &Path, key: &Key, content: &[u8]) {
    use mimir_core::LocalNode;

    let src = scratch(root);
    tokio::fs::create_dir_all(src.parent().unwrap()).await.unwrap();
    tokio::fs::write(&src, content).await.unwrap();
    node.store(key, &src, &Default::default(), &Default::default())
        .await
        .unwrap();
}

pub async fn read_entry(entry: &dyn LocalEntry, root: &Path) -> Vec<u8> {
    let dest = scratch(root);
    entry.transfer_to(&dest).await.unwrap();
    tokio::fs::read(&dest).await.unwrap()
}

/// Remote node serving objects from memory
pub struct MemoryRemoteNode {
    name: String,
    distance: u32,
    objects: Mutex<HashMap<Key, MemoryObject>>,
    locates: AtomicUsize,
    lifecycle: Lifecycle,
}

#[derive(Clone)]
struct MemoryObject {
    content: Vec<u8>,
    checksums: Checksums,
}

impl MemoryRemoteNode {
    pub fn new(name: &str, distance: u32) -> Self {
        Self {
            name: name.to_string(),
            distance,
            objects: Mutex::new(HashMap::new()),
            locates: AtomicUsize::new(0),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn insert(&self, key: &Key, content: &[u8]) {
        self.insert_with_checksums(key, content, digests(content));
    }

    /// Advertise checksums that do not match the served bytes
    pub fn insert_with_checksums(&self, key: &Key, content: &[u8], checksums: Checksums) {
        self.objects.lock().unwrap().insert(
            key.clone(),
            MemoryObject {
                content: content.to_vec(),
                checksums,
            },
        );
    }

    pub fn locate_count(&self) -> usize {
        self.locates.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}

#[async_trait]
impl Node for MemoryRemoteNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn distance(&self) -> u32 {
        self.distance
    }

    async fn close(&self) -> Result<()> {
        self.lifecycle.begin_close();
        Ok(())
    }
}

#[async_trait]
impl RemoteNode for MemoryRemoteNode {
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn RemoteEntry>>> {
        self.lifecycle.ensure_open(&self.name)?;
        self.locates.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to pile up behind the gate.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let object = self.objects.lock().unwrap().get(key).cloned();
        Ok(object.map(|object| {
            Arc::new(MemoryEntry {
                info: EntryInfo::new(
                    content_metadata(object.content.len() as u64, None),
                    object.checksums,
                ),
                content: object.content,
            }) as Arc<dyn RemoteEntry>
        }))
    }
}

#[derive(Debug)]
struct MemoryEntry {
    info: EntryInfo,
    content: Vec<u8>,
}

impl Entry for MemoryEntry {
    fn info(&self) -> &EntryInfo {
        &self.info
    }
}

#[async_trait]
impl RemoteEntry for MemoryEntry {
    async fn handle_content(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        sink.write_all(&self.content)
            .await
            .map_err(|e| Error::io_no_path(e, "write"))?;
        Ok(self.content.len() as u64)
    }
}

/// Remote node whose every lookup fails
pub struct FailingRemoteNode {
    pub distance: u32,
}

#[async_trait]
impl Node for FailingRemoteNode {
    fn name(&self) -> &str {
        "failing"
    }

    fn distance(&self) -> u32 {
        self.distance
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RemoteNode for FailingRemoteNode {
    async fn locate(&self, _key: &Key) -> Result<Option<Arc<dyn RemoteEntry>>> {
        Err(Error::peer("failing", "connection reset"))
    }
}
