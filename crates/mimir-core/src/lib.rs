//! Core of the mimir build-artifact cache
//!
//! This crate holds the pieces every other mimir crate builds on:
//!
//! - [`Key`] and its [`KeyMapper`] / [`KeyResolver`] companions
//! - entries ([`EntryInfo`], [`LocalEntry`], [`SystemEntry`], [`RemoteEntry`])
//! - node capabilities ([`LocalNode`], [`SystemNode`], [`RemoteNode`])
//! - the file system node ([`FileNode`])
//! - the cache-resolution engine ([`CachingNode`], [`OverlayingNode`])
//! - checksum computation and enforcement
//! - configuration [`Properties`] and base-directory paths

pub mod caching;
pub mod checksum;
pub mod entry;
pub mod error;
pub mod file;
pub mod key;
pub mod mapper;
pub mod node;
pub mod paths;
pub mod properties;
pub mod resolver;

pub use caching::{CachingNode, OverlayingNode};
pub use checksum::{ChecksumEnforcer, Checksums};
pub use entry::{Entry, EntryInfo, LocalEntry, Metadata, RemoteEntry, SystemEntry};
pub use error::{Error, Result};
pub use file::{FileNode, FileNodeConfig};
pub use key::{ArtifactCoordinate, Key, Scheme};
pub use mapper::{KeyMapper, Origin, SimpleKeyMapper};
pub use node::{AnyNode, LocalNode, Node, RemoteNode, SystemNode};
pub use properties::Properties;
pub use resolver::KeyResolver;
