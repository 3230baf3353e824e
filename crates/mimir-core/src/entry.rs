//! Cached object handles
//!
//! An entry pairs an immutable snapshot of metadata and checksums with a way
//! to get at the bytes. The way depends on where the bytes live:
//!
//! - [`LocalEntry`] can be transferred to a local file,
//! - [`SystemEntry`] additionally opens a file handle for publication,
//! - [`RemoteEntry`] only pushes its content into a writer.

use crate::checksum::{self, Checksums};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use tokio::io::AsyncWrite;

/// Metadata key holding the content length in bytes
pub const CONTENT_LENGTH: &str = "content-length";
/// Metadata key holding the last modification time in epoch milliseconds
pub const CONTENT_LAST_MODIFIED: &str = "content-last-modified";

/// Prefix of metadata keys in a merged map
pub const METADATA_PREFIX: &str = "m.";
/// Prefix of checksum keys in a merged map
pub const CHECKSUM_PREFIX: &str = "c.";

/// Free-form entry metadata
pub type Metadata = BTreeMap<String, String>;

/// Snapshot of an entry's metadata and checksums taken when it was created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    metadata: Metadata,
    checksums: Checksums,
}

impl EntryInfo {
    /// Create a snapshot
    #[must_use]
    pub fn new(metadata: Metadata, checksums: Checksums) -> Self {
        Self {
            metadata,
            checksums,
        }
    }

    /// Metadata map
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Checksum map
    #[must_use]
    pub fn checksums(&self) -> &Checksums {
        &self.checksums
    }

    /// Content length, when recorded
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.metadata.get(CONTENT_LENGTH)?.parse().ok()
    }

    /// Last modification time, when recorded
    #[must_use]
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let millis: i64 = self.metadata.get(CONTENT_LAST_MODIFIED)?.parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Flatten into one map using the `m.`/`c.` prefixes
    #[must_use]
    pub fn to_merged(&self) -> BTreeMap<String, String> {
        merge(&self.metadata, &self.checksums)
    }

    /// Rebuild from a flattened map, ignoring unprefixed keys
    #[must_use]
    pub fn from_merged(merged: &BTreeMap<String, String>) -> Self {
        let (metadata, checksums) = split(merged);
        Self::new(metadata, checksums)
    }
}

/// Build the metadata snapshot for content of a given size and timestamp
#[must_use]
pub fn content_metadata(length: u64, last_modified: Option<DateTime<Utc>>) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(CONTENT_LENGTH.to_string(), length.to_string());
    if let Some(modified) = last_modified {
        metadata.insert(
            CONTENT_LAST_MODIFIED.to_string(),
            modified.timestamp_millis().to_string(),
        );
    }
    metadata
}

/// Flatten metadata and checksums into one prefixed map
#[must_use]
pub fn merge(metadata: &Metadata, checksums: &Checksums) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (format!("{METADATA_PREFIX}{k}"), v.clone()))
        .chain(
            checksums
                .iter()
                .map(|(k, v)| (format!("{CHECKSUM_PREFIX}{k}"), v.clone())),
        )
        .collect()
}

/// Split a prefixed map back into metadata and checksums
///
/// Checksum algorithm names come back in canonical spelling.
#[must_use]
pub fn split(merged: &BTreeMap<String, String>) -> (Metadata, Checksums) {
    let mut metadata = Metadata::new();
    let mut checksums = Checksums::new();
    for (key, value) in merged {
        if let Some(name) = key.strip_prefix(METADATA_PREFIX) {
            metadata.insert(name.to_string(), value.clone());
        } else if let Some(name) = key.strip_prefix(CHECKSUM_PREFIX) {
            checksums.insert(name.to_string(), value.clone());
        }
    }
    (metadata, checksum::canonicalize(checksums))
}

/// Common view of every entry
pub trait Entry: Send + Sync + Debug {
    /// The snapshot taken when the entry was created
    fn info(&self) -> &EntryInfo;

    /// Metadata map
    fn metadata(&self) -> &Metadata {
        self.info().metadata()
    }

    /// Checksum map
    fn checksums(&self) -> &Checksums {
        self.info().checksums()
    }
}

/// Entry whose bytes are on a local file system
#[async_trait]
pub trait LocalEntry: Entry {
    /// Materialize the content at `file`, replacing what is there
    ///
    /// # Errors
    ///
    /// Returns an error if copying fails.
    async fn transfer_to(&self, file: &Path) -> crate::Result<()>;
}

/// Local entry of the system node, readable as an open file
#[async_trait]
pub trait SystemEntry: LocalEntry {
    /// Open the backing file for reading
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    async fn open(&self) -> crate::Result<tokio::fs::File>;
}

/// Entry whose bytes are only reachable by streaming
#[async_trait]
pub trait RemoteEntry: Entry {
    /// Push the whole content into `sink`, returning the bytes written
    ///
    /// # Errors
    ///
    /// Returns an error if fetching or writing fails.
    async fn handle_content(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> crate::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_split_are_inverse() {
        let metadata = content_metadata(12, Utc.timestamp_millis_opt(1_700_000_000_000).single());
        let checksums = Checksums::from([("SHA-1".to_string(), "2ef7".to_string())]);
        let merged = merge(&metadata, &checksums);
        assert_eq!(merged["m.content-length"], "12");
        assert_eq!(merged["c.SHA-1"], "2ef7");

        let info = EntryInfo::from_merged(&merged);
        assert_eq!(info.metadata(), &metadata);
        assert_eq!(info.checksums(), &checksums);
    }

    #[test]
    fn test_split_ignores_unprefixed_keys() {
        let merged = BTreeMap::from([
            ("key".to_string(), "mimir:file:a:b".to_string()),
            ("m.x".to_string(), "1".to_string()),
        ]);
        let (metadata, checksums) = split(&merged);
        assert_eq!(metadata.len(), 1);
        assert!(checksums.is_empty());
    }

    #[test]
    fn test_typed_accessors() {
        let info = EntryInfo::new(
            content_metadata(42, Utc.timestamp_millis_opt(1_000).single()),
            Checksums::new(),
        );
        assert_eq!(info.content_length(), Some(42));
        assert_eq!(info.last_modified().unwrap().timestamp_millis(), 1_000);
        assert_eq!(EntryInfo::default().content_length(), None);
    }
}
