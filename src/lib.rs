//! # Replex
//!
//! A multiplexing Redis client. Every concurrent caller shares one
//! pipelined connection per node; replies are demultiplexed in strict
//! enqueue order. Cluster deployments are routed by hash slot with
//! transparent MOVED/ASK/TRYAGAIN handling, sentinel-managed primaries are
//! followed across failovers, and reads can opt into a server-invalidated
//! client-side cache.
//!
//! ## Example
//!
//! ```no_run
//! use replex::{Client, ClientOptions, Command};
//!
//! #[tokio::main]
//! async fn main() -> replex::Result<()> {
//!     let client = Client::connect(ClientOptions::new(["localhost:6379"])).await?;
//!     client.do_command(Command::new("SET").key("greeting").arg("hello")).await?;
//!     let reply = client.do_command(Command::new("GET").key("greeting")).await?;
//!     assert_eq!(reply.as_str(), Some("hello"));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod cache;
mod client;
mod cluster;
mod cmd;
mod config;
mod error;
mod pool;
mod sentinel;
mod wire;

/// Wire protocol building blocks: the reply tree and the streaming codec.
pub mod proto;

pub use client::{CachedReply, Client, DedicatedClient};
pub use cluster::{key_slot, SLOT_COUNT};
pub use cmd::{Command, PubSubKind};
pub use config::ClientOptions;
pub use error::{Error, Result};
pub use proto::Reply;
pub use wire::pubsub::PubSubMessage;
