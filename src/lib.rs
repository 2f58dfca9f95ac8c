//! Local-area peer discovery and group messaging, speaking the ZRE
//! protocol (RFC 36).
//!
//! Each node broadcasts a UDP beacon on port 5670 announcing its identity
//! and TCP inbox port. Nodes that hear each other connect over TCP,
//! exchange HELLO, and from then on can [`whisper`](Node::whisper) to a
//! single peer or [`shout`](Node::shout) to every member of a named group.
//! Group membership, peer liveness (evasive after 5 s, expired after 30 s),
//! and per-peer message-loss detection are tracked by a single runtime
//! task; the owner talks to it through the [`Node`] handle and consumes a
//! stream of [`Event`]s.
//!
//! ```no_run
//! use zre_node::{Node, NodeConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (node, mut events) = Node::spawn(NodeConfig::default());
//! node.start().await?;
//! node.join("chat").await?;
//! node.shout("chat", vec![b"hello room".to_vec()]).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;

mod discovery;
mod group;
mod inbox;
mod node;
mod peer;

pub use config::NodeConfig;
pub use error::{DecodeError, NodeError};
pub use node::{Event, Node};
pub use peer::{PEER_EVASIVE, PEER_EXPIRED};
pub use protocol::DISCOVERY_PORT;
