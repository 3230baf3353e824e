//! Publication of cached entries to other processes and hosts
//!
//! A [`Publisher`] turns a system-node entry into a one-time locator. The
//! consumer redeems the locator exactly once over the matching transport:
//!
//! - [`HttpPublisher`]: `GET http://host:port/txid/<token>`
//! - [`SocketPublisher`]: connect, send the token, read to EOF
//! - [`GroupPublisher`]: answers UDP `Locate` requests from [`GroupNode`]s
//!
//! The crate also holds the remote nodes that consume publications or
//! static mirrors: [`GroupNode`] and [`HttpNode`].

pub mod group;
pub mod http;
pub mod http_node;
pub mod locator;
pub mod publisher;
pub mod socket;
pub mod token;

pub use group::{GroupConfig, GroupMessage, GroupNode, GroupPublisher};
pub use http::HttpPublisher;
pub use http_node::{HttpNode, HttpNodeConfig};
pub use locator::{Locator, PublishedEntry, redeem};
pub use publisher::{Publication, Publisher, PublisherConfig};
pub use socket::SocketPublisher;
pub use token::TokenTable;
