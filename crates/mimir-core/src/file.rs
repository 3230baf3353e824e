//! File system node
//!
//! Stores content under a base directory using a [`KeyResolver`] layout and
//! keeps the entry snapshot in a JSON sidecar:
//!
//! ```text
//! <basedir>/
//!   central/artifact/org/example/lib/1.0/lib-1.0.jar
//!   .meta/
//!     central/artifact/org/example/lib/1.0/lib-1.0.jar.json
//! ```
//!
//! Writes go to a hidden temporary sibling first and are renamed into place,
//! so readers never observe partial content. Content is renamed before its
//! sidecar, and a sidecar records the length, modification time and inode of
//! the file it describes; a sidecar that does not match the file on disk is
//! ignored and the checksums are recomputed. Containers cannot start with a
//! dot, so `.meta` never clashes with cached content.

use crate::checksum::{
    self, ChecksumAlgorithmFactory, ChecksumWriter, Checksums, checksum_file, enforce,
};
use crate::entry::{
    CONTENT_LAST_MODIFIED, Entry, EntryInfo, LocalEntry, Metadata, RemoteEntry, SystemEntry,
    content_metadata,
};
use crate::key::Key;
use crate::node::{Lifecycle, LocalNode, Node, SystemNode};
use crate::properties::{Properties, keys};
use crate::resolver::{DEFAULT_LAYOUT, KeyResolver, resolver_for};
use crate::{Error, Result, paths};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Directory under the base directory holding sidecars
pub const META_DIR: &str = ".meta";

/// Checksum algorithms used when none are configured
pub const DEFAULT_CHECKSUM_ALGORITHMS: &str = "SHA-1,SHA-512";

/// Identity of the content file a sidecar was written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FileStamp {
    length: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

impl FileStamp {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            length: meta.len(),
            modified: meta.modified().ok(),
            inode: inode(meta),
        }
    }
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(meta)
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    stamp: FileStamp,
    info: EntryInfo,
}

/// File node configuration
#[derive(Debug, Clone)]
pub struct FileNodeConfig {
    /// Node name
    pub name: String,
    /// Root directory
    pub basedir: PathBuf,
    /// Routing cost
    pub distance: u32,
    /// Checksum algorithms computed on store
    pub checksum_algorithms: Vec<String>,
    /// Hard link instead of copying when possible
    pub may_link: bool,
    /// Reject every store
    pub read_only: bool,
    /// Key layout name
    pub layout: String,
}

impl FileNodeConfig {
    /// Configuration with defaults for everything but name and root
    #[must_use]
    pub fn new(name: impl Into<String>, basedir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            basedir: basedir.into(),
            distance: 0,
            checksum_algorithms: DEFAULT_CHECKSUM_ALGORITHMS
                .split(',')
                .map(ToString::to_string)
                .collect(),
            may_link: true,
            read_only: false,
            layout: DEFAULT_LAYOUT.to_string(),
        }
    }

    /// The system file node as configured by `mimir.file.*`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for malformed values.
    pub fn system(properties: &Properties) -> Result<Self> {
        Ok(Self {
            name: "file".to_string(),
            basedir: paths::file_node_dir(properties)?,
            distance: 0,
            checksum_algorithms: properties
                .get_list_or(keys::FILE_CHECKSUM_ALGORITHMS, DEFAULT_CHECKSUM_ALGORITHMS),
            may_link: properties.get_bool(keys::FILE_MAY_LINK, true)?,
            read_only: false,
            layout: properties.get_or(keys::FILE_LAYOUT, DEFAULT_LAYOUT).to_string(),
        })
    }

    /// A read-only bundle as configured by `mimir.bundle.*`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `mimir.bundle.basedir` is missing.
    pub fn bundle(properties: &Properties) -> Result<Self> {
        Ok(Self {
            name: "bundle".to_string(),
            basedir: PathBuf::from(properties.require(keys::BUNDLE_BASEDIR)?),
            distance: properties.get_parsed(keys::BUNDLE_DISTANCE, 0)?,
            checksum_algorithms: properties
                .get_list_or(keys::FILE_CHECKSUM_ALGORITHMS, DEFAULT_CHECKSUM_ALGORITHMS),
            may_link: false,
            read_only: true,
            layout: properties.get_or(keys::FILE_LAYOUT, DEFAULT_LAYOUT).to_string(),
        })
    }

    /// Set the distance
    #[must_use]
    pub const fn with_distance(mut self, distance: u32) -> Self {
        self.distance = distance;
        self
    }

    /// Set the checksum algorithms
    #[must_use]
    pub fn with_checksum_algorithms<S: Into<String>>(
        mut self,
        algorithms: impl IntoIterator<Item = S>,
    ) -> Self {
        self.checksum_algorithms = algorithms.into_iter().map(Into::into).collect();
        self
    }

    /// Allow or forbid hard links
    #[must_use]
    pub const fn with_may_link(mut self, may_link: bool) -> Self {
        self.may_link = may_link;
        self
    }

    /// Make the node read-only
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Node backed by a directory tree
#[derive(Debug)]
pub struct FileNode {
    config: FileNodeConfig,
    resolver: Arc<dyn KeyResolver>,
    factories: Vec<&'static ChecksumAlgorithmFactory>,
    lifecycle: Lifecycle,
}

impl FileNode {
    /// Create a node; nothing is touched on disk until the first store
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown layout, an unknown checksum algorithm
    /// or an empty algorithm list.
    pub fn new(config: FileNodeConfig) -> Result<Self> {
        if config.checksum_algorithms.is_empty() {
            return Err(Error::configuration(format!(
                "node '{}' needs at least one checksum algorithm",
                config.name
            )));
        }
        let resolver = resolver_for(&config.layout)?;
        let factories = checksum::factories(&config.checksum_algorithms)?;
        Ok(Self {
            config,
            resolver,
            factories,
            lifecycle: Lifecycle::new(),
        })
    }

    /// Root directory
    #[must_use]
    pub fn basedir(&self) -> &Path {
        &self.config.basedir
    }

    fn content_path(&self, key: &Key) -> Result<PathBuf> {
        Ok(self.config.basedir.join(self.resolver.resolve(key)?))
    }

    fn sidecar_path(&self, key: &Key) -> Result<PathBuf> {
        let mut path = self
            .config
            .basedir
            .join(META_DIR)
            .join(self.resolver.resolve(key)?);
        path.as_mut_os_string().push(".json");
        Ok(path)
    }

    fn ensure_writable(&self) -> Result<()> {
        self.lifecycle.ensure_open(&self.config.name)?;
        if self.config.read_only {
            return Err(Error::ReadOnly {
                node: self.config.name.clone(),
            });
        }
        Ok(())
    }

    async fn find(&self, key: &Key) -> Result<Option<Arc<FileEntry>>> {
        self.lifecycle.ensure_open(&self.config.name)?;
        let path = self.content_path(key)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "stat")),
        };

        let length = meta.len();
        let info = match read_sidecar(&self.sidecar_path(key)?).await {
            Some(sidecar) if sidecar.stamp == FileStamp::of(&meta) => sidecar.info,
            _ => {
                tracing::debug!(key = %key, "No usable sidecar, computing checksums");
                let checksums = checksum_file(&path, &self.factories).await?;
                let modified = meta.modified().ok().map(DateTime::<Utc>::from);
                EntryInfo::new(content_metadata(length, modified), checksums)
            }
        };
        Ok(Some(Arc::new(FileEntry { path, info })))
    }

    /// Put `source` at `target` by hard link or copy
    async fn place(&self, source: &Path, target: &Path, modified: Option<SystemTime>) -> Result<()> {
        if self.config.may_link {
            match tokio::fs::hard_link(source, target).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        source = %source.display(),
                        error = %e,
                        "Hard link failed, falling back to copy"
                    );
                }
            }
        }
        tokio::fs::copy(source, target)
            .await
            .map_err(|e| Error::io(e, target, "copy"))?;
        if let Some(modified) = modified {
            set_modified(target, modified).await?;
        }
        Ok(())
    }

    async fn receive(&self, tmp: &Path, entry: &dyn RemoteEntry) -> Result<(u64, Checksums)> {
        let file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| Error::io(e, tmp, "create"))?;
        let mut writer = ChecksumWriter::new(file, &self.factories);
        entry.handle_content(&mut writer).await?;
        writer
            .flush()
            .await
            .map_err(|e| Error::io(e, tmp, "flush"))?;
        let written = writer.written();
        let (file, checksums) = writer.finish();
        file.sync_all()
            .await
            .map_err(|e| Error::io(e, tmp, "sync"))?;
        Ok((written, checksums))
    }

    /// Move the content into place, then describe it in the sidecar
    async fn commit(&self, tmp: &Path, target: &Path, sidecar: &Path, info: &EntryInfo) -> Result<()> {
        let meta = tokio::fs::metadata(tmp)
            .await
            .map_err(|e| Error::io(e, tmp, "stat"))?;
        let stamp = FileStamp::of(&meta);
        tokio::fs::rename(tmp, target)
            .await
            .map_err(|e| Error::io(e, target, "rename"))?;
        write_sidecar(
            sidecar,
            &Sidecar {
                stamp,
                info: info.clone(),
            },
        )
        .await
    }
}

#[async_trait]
impl Node for FileNode {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn distance(&self) -> u32 {
        self.config.distance
    }

    async fn close(&self) -> Result<()> {
        if self.lifecycle.begin_close() {
            tracing::debug!(node = %self.config.name, "File node closed");
        }
        Ok(())
    }
}

#[async_trait]
impl LocalNode for FileNode {
    async fn locate(&self, key: &Key) -> Result<Option<Arc<dyn LocalEntry>>> {
        Ok(self.find(key).await?.map(|e| e as Arc<dyn LocalEntry>))
    }

    async fn store(
        &self,
        key: &Key,
        file: &Path,
        metadata: &Metadata,
        checksums: &Checksums,
    ) -> Result<Arc<dyn LocalEntry>> {
        self.ensure_writable()?;
        let source_meta = tokio::fs::metadata(file)
            .await
            .map_err(|e| Error::io(e, file, "stat"))?;

        let computed = checksum_file(file, &self.factories).await?;
        if !checksums.is_empty() {
            enforce(checksums, &computed)?;
        }
        let mut all_checksums = checksum::canonicalize(checksums.clone());
        all_checksums.extend(computed);

        let modified = metadata
            .get(CONTENT_LAST_MODIFIED)
            .and_then(|millis| millis.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .or_else(|| source_meta.modified().ok().map(DateTime::<Utc>::from));
        let mut all_metadata = metadata.clone();
        all_metadata.extend(content_metadata(source_meta.len(), modified));
        let info = EntryInfo::new(all_metadata, all_checksums);

        let target = self.content_path(key)?;
        let sidecar = self.sidecar_path(key)?;
        create_parent(&target).await?;
        let tmp = temp_sibling(&target);

        let outcome = async {
            self.place(file, &tmp, modified.map(SystemTime::from)).await?;
            self.commit(&tmp, &target, &sidecar, &info).await
        }
        .await;
        if let Err(e) = outcome {
            discard(&tmp).await;
            return Err(e);
        }

        tracing::debug!(key = %key, path = %target.display(), "Stored file");
        Ok(Arc::new(FileEntry { path: target, info }))
    }

    fn checksum_algorithms(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.name().to_string()).collect()
    }
}

#[async_trait]
impl SystemNode for FileNode {
    async fn locate_system(&self, key: &Key) -> Result<Option<Arc<dyn SystemEntry>>> {
        Ok(self.find(key).await?.map(|e| e as Arc<dyn SystemEntry>))
    }

    async fn store_entry(&self, key: &Key, entry: &dyn RemoteEntry) -> Result<Arc<dyn SystemEntry>> {
        self.ensure_writable()?;
        let target = self.content_path(key)?;
        let sidecar = self.sidecar_path(key)?;
        create_parent(&target).await?;
        let tmp = temp_sibling(&target);

        let outcome = async {
            let (written, computed) = self.receive(&tmp, entry).await?;
            if let Some(expected) = entry.info().content_length()
                && expected != written
            {
                return Err(Error::peer(
                    self.config.name.clone(),
                    format!("received {written} bytes for {key}, expected {expected}"),
                ));
            }
            if !entry.checksums().is_empty() {
                enforce(entry.checksums(), &computed)?;
            }

            let modified = entry.info().last_modified();
            let mut metadata = entry.metadata().clone();
            metadata.extend(content_metadata(written, modified));
            let mut checksums = checksum::canonicalize(entry.checksums().clone());
            checksums.extend(computed);
            let info = EntryInfo::new(metadata, checksums);

            if let Some(modified) = modified {
                set_modified(&tmp, modified.into()).await?;
            }
            self.commit(&tmp, &target, &sidecar, &info).await?;
            Ok(info)
        }
        .await;

        match outcome {
            Ok(info) => {
                tracing::debug!(key = %key, path = %target.display(), "Stored streamed entry");
                Ok(Arc::new(FileEntry { path: target, info }))
            }
            Err(e) => {
                discard(&tmp).await;
                Err(e)
            }
        }
    }
}

/// Entry of a [`FileNode`]
#[derive(Debug)]
pub struct FileEntry {
    path: PathBuf,
    info: EntryInfo,
}

impl FileEntry {
    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Entry for FileEntry {
    fn info(&self) -> &EntryInfo {
        &self.info
    }
}

#[async_trait]
impl LocalEntry for FileEntry {
    async fn transfer_to(&self, file: &Path) -> Result<()> {
        create_parent(file).await?;
        let tmp = temp_sibling(file);
        let outcome = async {
            tokio::fs::copy(&self.path, &tmp)
                .await
                .map_err(|e| Error::io(e, &self.path, "copy"))?;
            if let Some(modified) = self.info.last_modified() {
                set_modified(&tmp, modified.into()).await?;
            }
            tokio::fs::rename(&tmp, file)
                .await
                .map_err(|e| Error::io(e, file, "rename"))
        }
        .await;
        if outcome.is_err() {
            discard(&tmp).await;
        }
        outcome
    }
}

#[async_trait]
impl SystemEntry for FileEntry {
    async fn open(&self) -> Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| Error::io(e, &self.path, "open"))
    }
}

async fn read_sidecar(path: &Path) -> Option<Sidecar> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable sidecar");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(sidecar) => Some(sidecar),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt sidecar");
            None
        }
    }
}

async fn write_sidecar(path: &Path, sidecar: &Sidecar) -> Result<()> {
    create_parent(path).await?;
    let json = serde_json::to_vec_pretty(sidecar).map_err(|e| {
        Error::io(io::Error::new(io::ErrorKind::InvalidData, e), path, "serialize")
    })?;
    let tmp = temp_sibling(path);
    let outcome = async {
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| Error::io(e, &tmp, "write"))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::io(e, path, "rename"))
    }
    .await;
    if outcome.is_err() {
        discard(&tmp).await;
    }
    outcome
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    Ok(())
}

/// Hidden, unique temporary path next to `target`
fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

async fn discard(tmp: &Path) {
    if let Err(e) = tokio::fs::remove_file(tmp).await
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %tmp.display(), error = %e, "Failed to remove temporary file");
    }
}

async fn set_modified(path: &Path, modified: SystemTime) -> Result<()> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::File::open(&owned)?.set_modified(modified))
        .await
        .map_err(|e| Error::io(io::Error::other(e), path, "set_modified"))?
        .map_err(|e| Error::io(e, path, "set_modified"))
}
