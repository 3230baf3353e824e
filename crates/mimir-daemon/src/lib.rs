// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

//! mimir daemon, client and command line
//!
//! The daemon serves a [`mimir_core::CachingNode`] over a Unix socket using
//! the length-prefixed MessagePack protocol in [`protocol`]. Clients say
//! HELLO, issue any number of commands and say BYE:
//!
//! ```ignore
//! use mimir_daemon::{DaemonClient, protocol::Data};
//!
//! let mut client = DaemonClient::connect("/home/me/.mimir/mimir-socket", Data::new()).await?;
//! let hit = client.locate(&"mimir:file:tools:bin/tool".parse()?).await?;
//! client.bye(false).await?;
//! ```

pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tracing;

pub use client::DaemonClient;
pub use error::{DaemonError, Result};
pub use handler::{CommandHandler, PreseedReport};
pub use registry::{NodeRegistry, Runtime, build_runtime};
pub use server::{Daemon, DaemonConfig};
