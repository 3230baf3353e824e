//! Key to relative path layouts
//!
//! A layout is part of the on-disk cache format: changing how an existing
//! layout maps keys silently orphans every cached object, so changes get a
//! new layout name instead.
//!
//! ## Layout `v1`
//!
//! ```text
//! <container>/artifact/org/example/lib/1.0/lib-1.0-sources.jar
//! <container>/file/some/relative/path.txt
//! <container>/cas/ab/cd/abcdef0123...
//! ```

use crate::key::{ArtifactCoordinate, Key, Scheme};
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the layout used when none is configured
pub const DEFAULT_LAYOUT: &str = "v1";

/// Maps a key to a path relative to a node root
pub trait KeyResolver: Send + Sync + std::fmt::Debug {
    /// Layout name
    fn name(&self) -> &str;

    /// Relative path of the object addressed by `key`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the key cannot be laid out.
    fn resolve(&self, key: &Key) -> Result<PathBuf>;
}

/// Layout `v1`
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutV1;

impl KeyResolver for LayoutV1 {
    fn name(&self) -> &str {
        "v1"
    }

    fn resolve(&self, key: &Key) -> Result<PathBuf> {
        let mut path = PathBuf::from(key.container());
        path.push(key.scheme().as_str());
        match key.scheme() {
            Scheme::Artifact => path.push(repository_path(&key.coordinate()?)),
            Scheme::File => path.extend(key.payload().split('/')),
            Scheme::ContentAddress => {
                let hex = key.payload();
                path.push(&hex[0..2]);
                path.push(&hex[2..4]);
                path.push(hex);
            }
        }
        Ok(path)
    }
}

/// Look up a layout by name
///
/// # Errors
///
/// Returns [`Error::Configuration`] for unknown layout names.
pub fn resolver_for(name: &str) -> Result<Arc<dyn KeyResolver>> {
    match name {
        "v1" => Ok(Arc::new(LayoutV1)),
        other => Err(Error::configuration(format!(
            "unknown key layout '{other}' (known: v1)"
        ))),
    }
}

/// Path of an artifact inside a Maven-style repository
///
/// `org/example/lib/1.0/lib-1.0[-classifier].jar`
#[must_use]
pub fn repository_path(coordinate: &ArtifactCoordinate) -> PathBuf {
    let mut path: PathBuf = coordinate.group_id.split('.').collect();
    path.push(&coordinate.artifact_id);
    path.push(&coordinate.version);
    path.push(coordinate.file_name());
    path
}
