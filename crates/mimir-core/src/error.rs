//! Error types for mimir nodes and keys

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Error type for cache node operations
///
/// A cache miss is never an error: nodes report it as `Ok(None)`.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during node operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(mimir::core::io),
        help("Check file permissions and available disk space")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "hard_link")
        operation: String,
    },

    /// A key string or key component could not be parsed
    #[error("Invalid key '{key}': {reason}")]
    #[diagnostic(
        code(mimir::core::invalid_key),
        help("Keys look like mimir:<artifact|file|cas>:<container>:<payload>")
    )]
    InvalidKey {
        /// The offending input
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// Operation attempted on a node that was already closed
    #[error("Node '{node}' is closed")]
    #[diagnostic(code(mimir::core::closed))]
    NodeClosed {
        /// Name of the closed node
        node: String,
    },

    /// Store attempted on a node configured as read-only
    #[error("Node '{node}' is read-only")]
    #[diagnostic(code(mimir::core::read_only))]
    ReadOnly {
        /// Name of the node
        node: String,
    },

    /// A resource needed by the node is not available
    #[error("{resource} unavailable: {message}")]
    #[diagnostic(code(mimir::core::unavailable))]
    Unavailable {
        /// The resource (socket, file, directory)
        resource: String,
        /// Details
        message: String,
    },

    /// Computed checksums disagree with the expected ones
    #[error("Checksum mismatch: expected {expected:?}, received {received:?}")]
    #[diagnostic(
        code(mimir::core::checksum_mismatch),
        help("The content was corrupted or tampered with and was not served")
    )]
    ChecksumMismatch {
        /// Expected checksums
        expected: BTreeMap<String, String>,
        /// Checksums computed over the content
        received: BTreeMap<String, String>,
    },

    /// Expected and computed checksums share no algorithm
    #[error("No checksum algorithm intersection: expected {expected:?}, received {received:?}")]
    #[diagnostic(
        code(mimir::core::no_checksum_intersection),
        help("Configure at least one checksum algorithm that the producer also computes")
    )]
    NoChecksumIntersection {
        /// Expected checksums
        expected: BTreeMap<String, String>,
        /// Checksums computed over the content
        received: BTreeMap<String, String>,
    },

    /// Checksum algorithm name not known
    #[error("Unsupported checksum algorithm: {algorithm}")]
    #[diagnostic(
        code(mimir::core::unsupported_checksum),
        help("Supported algorithms are SHA-1, SHA-256 and SHA-512")
    )]
    UnsupportedChecksum {
        /// The algorithm name
        algorithm: String,
    },

    /// Configuration or validation error
    #[error("Configuration error: {message}")]
    #[diagnostic(code(mimir::core::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A remote peer or transport failed mid-operation
    #[error("Peer '{peer}' failed: {message}")]
    #[diagnostic(code(mimir::core::peer))]
    Peer {
        /// Peer name or address
        peer: String,
        /// Details
        message: String,
    },

    /// Several errors collected while releasing resources
    #[error("{} errors occurred: {}", errors.len(), join_messages(errors))]
    #[diagnostic(code(mimir::core::multiple))]
    Multiple {
        /// The collected errors
        #[related]
        errors: Vec<Error>,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a node closed error
    #[must_use]
    pub fn closed(node: impl Into<String>) -> Self {
        Self::NodeClosed { node: node.into() }
    }

    /// Create an unavailable resource error
    #[must_use]
    pub fn unavailable(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a peer error
    #[must_use]
    pub fn peer(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Peer {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Whether this error reports an operation on a closed node
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::NodeClosed { .. })
    }

    /// Whether this error reports corrupted or unverifiable content
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::NoChecksumIntersection { .. }
        )
    }

    /// Fold errors collected from several resources into one result
    ///
    /// # Errors
    ///
    /// Returns the single error as-is, or [`Error::Multiple`] for more than one.
    pub fn collect(mut errors: Vec<Self>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple { errors }),
        }
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, Error>;
