//! # Summary
//!
//! This crate implements multi-decree Paxos over an asynchronous
//! message-passing network. A fixed set of peer nodes agrees on an
//! ordered log of opaque string values: each log slot is decided by an
//! independent instance of single-decree Paxos, so slots may be decided
//! concurrently and out of order. Every node co-hosts the proposer,
//! acceptor, and learner roles, and any node may initiate a proposal.
//!
//! # Usage
//!
//! Build a [`Config`] per node, hand every node the same membership,
//! and call [`Node::start`] to begin listening for peer messages.
//! [`Node::submit`] proposes a value for the next free slot;
//! [`Node::decided_values`] exposes the agreed log.
//!
//! ```no_run
//! use multipaxos::{Config, Node, NodeLocation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), multipaxos::Error> {
//!     let peers = (0..3)
//!         .map(|num| NodeLocation::new("127.0.0.1", 9000 + num as u16, num))
//!         .collect::<Vec<_>>();
//!
//!     let mut node = Node::new(Config::new(0, "127.0.0.1", 9000));
//!     node.set_peers(peers);
//!     node.start().await?;
//!     node.submit("hello");
//!     Ok(())
//! }
//! ```
//!
//! # Implementation Details
//!
//! - Nodes exchange one length-delimited, `bincode`-encoded message per
//!   TCP connection; the connection closes after the single frame.
//! - All state transitions are serialized through one dispatcher task;
//!   the listener, the heartbeat, and the per-slot re-propose timers
//!   only post onto its queue.
//! - Proposal numbers are seeded at the node's membership index and
//!   advance by the membership size, which keeps them globally unique.
//! - The acceptor's promises and acceptances are persisted to a
//!   snapshot file before they become visible to other nodes, and
//!   recovered on startup. Learner state is not durable: a restarted
//!   node re-learns decided slots by observing the protocol.
//! - A single advisory leader flag biases retransmission: when a send
//!   to the flagged node times out, the sender rotates the flag to the
//!   next index and announces the rotation. The flag never affects
//!   safety, only who gets retried.

#[macro_use]
extern crate log;

mod config;
mod error;
mod internal;
mod location;
mod message;
mod node;
mod protocol;
mod shared;
pub mod socket;
mod storage;
mod thread;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::location::NodeLocation;
pub use crate::message::{Envelope, Message, Proposal};
pub use crate::node::Node;
