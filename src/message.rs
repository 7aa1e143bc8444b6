use serde_derive::{Deserialize, Serialize};

use crate::location::NodeLocation;

/// Immutable proposal for a single log slot.
///
/// `psn` is globally unique: each node seeds its counter at its
/// membership index and advances it by the membership size, so
/// `psn % N` always identifies the proposing node.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Proposal {
    /// Command sequence number: the log slot under contention.
    pub csn: usize,
    /// Proposal number: totally ordered across all rounds for this slot.
    pub psn: usize,
    /// Opaque payload.
    pub value: String,
}

/// Wire messages exchanged between nodes.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Periodic liveness probe; carries no payload.
    Heartbeat,
    /// Phase one: ask acceptors to promise away lower proposal numbers.
    PrepareRequest { csn: usize, psn: usize },
    /// Phase one reply: the acceptor's current promise and its
    /// highest-psn previously accepted proposal, if any.
    PrepareResponse {
        csn: usize,
        min_psn: usize,
        accepted: Option<Proposal>,
    },
    /// Phase two: ask acceptors to accept a concrete proposal.
    AcceptRequest { proposal: Proposal },
    /// Broadcast by acceptors to all learners upon accepting.
    AcceptNotification { proposal: Proposal },
    /// Rotate the advisory leader flag to the node with this index.
    NewLeaderNotification { num: usize },
}

/// A message stamped with its route.
///
/// `receiver` is filled in by unicast; self-delivered broadcast copies
/// leave it unset.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Envelope {
    pub sender: NodeLocation,
    pub receiver: Option<NodeLocation>,
    pub message: Message,
}
