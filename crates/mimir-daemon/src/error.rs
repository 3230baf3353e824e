//! Error types for the daemon, its client and the command line

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Exit code for success
pub const EXIT_OK: u8 = 0;
/// Exit code for a failed command
pub const EXIT_FAILED: u8 = 1;
/// Exit code for usage or configuration errors
pub const EXIT_CONFIG: u8 = 2;
/// Exit code when no daemon is listening
pub const EXIT_NOT_RUNNING: u8 = 3;

/// Error type for daemon and client operations
#[derive(Error, Debug, Diagnostic)]
pub enum DaemonError {
    /// Error raised by a node, key or publisher
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] mimir_core::Error),

    /// The peer violated the wire protocol
    #[error("Protocol error: {message}")]
    #[diagnostic(code(mimir::daemon::protocol))]
    Protocol {
        /// What went wrong
        message: String,
    },

    /// A frame could not be encoded or decoded
    #[error("Codec error: {message}")]
    #[diagnostic(code(mimir::daemon::codec))]
    Codec {
        /// Encoder or decoder message
        message: String,
    },

    /// The daemon answered KO
    #[error("{command} rejected: {message}")]
    #[diagnostic(code(mimir::daemon::rejected))]
    Rejected {
        /// Command that was rejected
        command: String,
        /// Message sent by the daemon
        message: String,
    },

    /// The daemon answered for a different session than ours
    #[error("Daemon session changed from {expected} to {actual}")]
    #[diagnostic(
        code(mimir::daemon::session_changed),
        help("The daemon was restarted; reconnect and say HELLO again")
    )]
    SessionChanged {
        /// Session the client holds
        expected: String,
        /// Session the daemon reported
        actual: String,
    },

    /// Nothing is listening on the socket
    #[error("Daemon not running at {}", socket.display())]
    #[diagnostic(
        code(mimir::daemon::not_running),
        help("Start it with 'mimir daemon'")
    )]
    NotRunning {
        /// Socket that was tried
        socket: PathBuf,
    },

    /// A requested key is not cached anywhere
    #[error("Not found: {key}")]
    #[diagnostic(code(mimir::daemon::not_found))]
    NotFound {
        /// The key
        key: String,
    },

    /// Configuration file or command line problem
    #[error("Configuration error: {message}")]
    #[diagnostic(code(mimir::daemon::config))]
    Config {
        /// What is wrong
        message: String,
        /// How to fix it
        #[help]
        help: Option<String>,
    },

    /// Socket or file I/O failed
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(code(mimir::daemon::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path involved, if any
        path: Option<PathBuf>,
        /// Operation that failed
        operation: String,
    },
}

impl DaemonError {
    /// Create a protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a codec error
    #[must_use]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().to_path_buf()),
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

    /// Process exit code for this error
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::NotRunning { .. } => EXIT_NOT_RUNNING,
            Self::Config { .. }
            | Self::Core(
                mimir_core::Error::Configuration { .. } | mimir_core::Error::InvalidKey { .. },
            ) => EXIT_CONFIG,
            _ => EXIT_FAILED,
        }
    }
}

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let not_running = DaemonError::NotRunning {
            socket: PathBuf::from("/tmp/mimir-socket"),
        };
        assert_eq!(not_running.exit_code(), EXIT_NOT_RUNNING);
        assert_eq!(DaemonError::config("bad").exit_code(), EXIT_CONFIG);
        assert_eq!(
            DaemonError::from(mimir_core::Error::invalid_key("x", "bad")).exit_code(),
            EXIT_CONFIG
        );
        assert_eq!(DaemonError::protocol("bad frame").exit_code(), EXIT_FAILED);
    }

    #[test]
    fn test_core_errors_keep_their_message() {
        let err = DaemonError::from(mimir_core::Error::closed("file"));
        assert_eq!(err.to_string(), "Node 'file' is closed");
    }
}
