//! # Summary
//!
//! This module implements the central hub each task holds a handle to.
//! We wrap the hub `State` in `Arc<RwLock<T>>` to share the membership
//! view, the decided-value log, and the dispatcher mailbox between
//! concurrently running tasks.
//!
//! The hub also owns the outbound half of the transport: `broadcast`
//! delivers a copy of a message to every peer in the membership, and
//! `unicast` opens one connection, writes one frame, and closes. The
//! local copy of a broadcast never touches the network; it is posted
//! onto the dispatcher's queue under the same serialization discipline
//! as messages arriving from peers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::net;
use tokio::time;

use crate::error::Error;
use crate::internal;
use crate::location::{Membership, NodeLocation};
use crate::message::{Envelope, Message};
use crate::protocol;
use crate::socket;

/// Thread-safe handle to the hub.
#[derive(Clone)]
pub(crate) struct Shared(Arc<RwLock<State>>);

impl Shared {
    pub fn new(local: NodeLocation, socket_timeout: Duration) -> Self {
        Shared(Arc::new(RwLock::new(State {
            local,
            membership: Membership::default(),
            chosen: Vec::default(),
            dispatcher: None,
            socket_timeout,
        })))
    }

    /// Acquires a read lock on the underlying state.
    pub fn read(&self) -> RwLockReadGuard<State> {
        self.0.read()
    }

    /// Acquires a write lock on the underlying state.
    pub fn write(&self) -> RwLockWriteGuard<State> {
        self.0.write()
    }

    /// Posts an input onto the dispatcher's queue.
    /// Dropped silently while the node is stopped.
    pub fn dispatch(&self, input: protocol::In) {
        if let Some(dispatcher) = &self.read().dispatcher {
            dispatcher.try_send(input);
        }
    }

    /// Delivers a copy of the message to every node in the membership,
    /// including self.
    pub fn broadcast(&self, message: Message) {
        let (local, nodes) = {
            let state = self.read();
            (state.local.clone(), state.membership.nodes().to_vec())
        };
        for node in nodes {
            if node.num == local.num {
                self.dispatch(protocol::In::Deliver(Envelope {
                    sender: local.clone(),
                    receiver: None,
                    message: message.clone(),
                }));
            } else {
                self.unicast(node, message.clone());
            }
        }
    }

    /// Sends one message to one node over a fresh connection.
    ///
    /// A message addressed to the local node short-circuits onto the
    /// dispatcher's queue instead of looping through the listener.
    pub fn unicast(&self, receiver: NodeLocation, message: Message) {
        let local = self.read().local.clone();
        let envelope = Envelope {
            sender: local.clone(),
            receiver: Some(receiver.clone()),
            message,
        };
        if receiver.num == local.num {
            self.dispatch(protocol::In::Deliver(envelope));
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            send(shared, receiver, envelope).await;
        });
    }

    /// Rotates the advisory leader flag to the successor of the current
    /// leader and announces the rotation to the whole membership.
    pub fn elect_new_leader(&self) {
        let num = {
            let state = self.read();
            match state.membership.leader() {
            | Some(leader) => (leader.num + 1) % state.membership.count(),
            | None => return,
            }
        };
        debug!("electing new leader {}", num);
        self.broadcast(Message::NewLeaderNotification { num });
    }
}

/// Hub state guarded by the `Shared` lock.
pub(crate) struct State {
    local: NodeLocation,
    membership: Membership,
    chosen: Vec<Option<String>>,
    dispatcher: Option<internal::Tx<protocol::In>>,
    socket_timeout: Duration,
}

impl State {
    pub fn local(&self) -> &NodeLocation {
        &self.local
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn membership_mut(&mut self) -> &mut Membership {
        &mut self.membership
    }

    /// Registers the dispatcher mailbox with this hub.
    pub fn set_dispatcher(&mut self, dispatcher: internal::Tx<protocol::In>) {
        self.dispatcher = Some(dispatcher);
    }

    /// Disconnects the dispatcher from this hub.
    pub fn clear_dispatcher(&mut self) {
        self.dispatcher = None;
    }

    /// Records the decided value for a slot, extending the log with
    /// explicit holes as needed. Slots decide out of order.
    pub fn record_chosen(&mut self, csn: usize, value: String) {
        if self.chosen.len() <= csn {
            self.chosen.resize(csn + 1, None);
        }
        self.chosen[csn] = Some(value);
    }

    pub fn chosen(&self) -> &[Option<String>] {
        &self.chosen
    }
}

/// Writes one frame to one peer, bounded by the per-connection deadline.
///
/// A deadline expiry is read as a crash of the destination: if the
/// destination held the leader flag, the flag is rotated and the same
/// send is retried once against the presumed-recovered destination.
/// All other failures drop the message; the re-propose timer provides
/// end-to-end retransmission.
async fn send(shared: Shared, receiver: NodeLocation, envelope: Envelope) {
    let deadline = shared.read().socket_timeout;
    match time::timeout(deadline, connect(&receiver, &envelope)).await {
    | Ok(Ok(())) => (),
    | Ok(Err(error)) => warn!("failed to send to {}: {}", receiver, error),
    | Err(_) => {
        warn!("detected crash from {}", receiver);
        if shared.read().membership.is_leader(receiver.num) {
            shared.elect_new_leader();
            match time::timeout(deadline, connect(&receiver, &envelope)).await {
            | Ok(Ok(())) => (),
            | Ok(Err(error)) => warn!("failed to send to {}: {}", receiver, error),
            | Err(_) => warn!("dropping message to {}", receiver),
            }
        }
    }
    }
}

async fn connect(receiver: &NodeLocation, envelope: &Envelope) -> Result<(), Error> {
    let stream = net::TcpStream::connect(receiver.address()).await?;
    let (_, mut tx) = socket::split::<Envelope, Envelope>(stream);
    tx.send(envelope).await
}
