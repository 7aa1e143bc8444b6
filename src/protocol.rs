//! # Summary
//!
//! This module implements the per-slot Paxos state machine. The
//! proposer, acceptor, and learner roles are co-resident: every node
//! runs all three, dispatched by message kind from a single mailbox.
//!
//! The mailbox is the node's serialization domain. Inbound messages
//! from the listener, proposal submissions, re-propose timer expiries,
//! and the local copies of broadcasts all arrive here, so at any
//! instant at most one state transition is in progress and no handler
//! ever re-enters another.
//!
//! Slots are independent: any number of command sequence numbers may
//! be under contention at once, and they decide in any order. Only the
//! acceptor's promises and acceptances are durable; learner state is
//! rebuilt by observing the protocol after a restart.

use std::collections::HashMap as Map;
use std::collections::HashSet as Set;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::internal;
use crate::location::NodeLocation;
use crate::message::{Envelope, Message, Proposal};
use crate::shared::Shared;
use crate::storage::Storage;
use crate::thread::reproposer::ReProposer;

/// Inputs consumed by the dispatcher task.
#[derive(Debug)]
pub(crate) enum In {
    /// A message from a peer, a local broadcast copy, or a loopback reply.
    Deliver(Envelope),
    /// A proposal submission; `csn` is `None` for the next unused slot.
    Submit { csn: Option<usize>, value: String },
}

/// Durable acceptor state, snapshotted on every acceptor-visible mutation.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default)]
pub(crate) struct Stable {
    /// Highest psn promised per slot. Nothing below a slot's promise
    /// may be accepted.
    min_psns: Map<usize, usize>,
    /// Highest-psn proposal ever accepted per slot.
    max_accepted: Map<usize, Proposal>,
}

pub(crate) struct Protocol {
    rx: internal::Rx<In>,
    tx: internal::Tx<In>,
    shared: Shared,
    shutdown: watch::Receiver<bool>,

    // Proposer state, all volatile.
    current_csn: usize,
    psn: usize,
    num_accept_requests: Map<usize, usize>,
    proposals: Map<usize, Proposal>,
    adoptions: Map<usize, usize>,
    reproposers: Map<usize, oneshot::Sender<()>>,
    propose_timeout: Duration,

    // Acceptor state, durable.
    stable: Stable,
    storage: Storage<Stable>,

    // Learner state, volatile; decided values live in the shared hub.
    num_accept_notifications: Map<(usize, usize), usize>,
    has_learned: Set<usize>,
}

impl Protocol {
    /// Recovers acceptor state from stable storage. Must complete
    /// before the listener delivers any message.
    pub fn new(
        rx: internal::Rx<In>,
        tx: internal::Tx<In>,
        shared: Shared,
        storage: Storage<Stable>,
        propose_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let stable = match storage.load() {
        | Ok(Some(stable)) => {
            debug!("recovered acceptor state from stable storage");
            stable
        }
        | Ok(None) => Stable::default(),
        | Err(error) => {
            error!("failed to read stable storage, starting fresh: {}", error);
            Stable::default()
        }
        };
        let psn = shared.read().local().num;
        Protocol {
            rx,
            tx,
            shared,
            shutdown,
            current_csn: 0,
            psn,
            num_accept_requests: Map::default(),
            proposals: Map::default(),
            adoptions: Map::default(),
            reproposers: Map::default(),
            propose_timeout,
            stable,
            storage,
            num_accept_notifications: Map::default(),
            has_learned: Set::default(),
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                input = self.rx.recv() => match input {
                | Some(input) => self.handle(input),
                | None => return,
                },
                _ = self.shutdown.changed() => return,
            }
        }
    }

    fn handle(&mut self, input: In) {
        match input {
        | In::Deliver(envelope) => self.deliver(envelope),
        | In::Submit { csn: Some(csn), value } => self.submit(csn, value),
        | In::Submit { csn: None, value } => {
            let csn = self.current_csn;
            self.current_csn += 1;
            self.submit(csn, value);
        }
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        trace!("received {:?}", envelope);
        let Envelope { sender, message, .. } = envelope;
        match message {
        | Message::Heartbeat => (),
        | Message::PrepareRequest { csn, psn } => self.respond_prepare_request(sender, csn, psn),
        | Message::PrepareResponse { csn, min_psn, accepted } => {
            self.respond_prepare_response(csn, min_psn, accepted)
        }
        | Message::AcceptRequest { proposal } => self.respond_accept_request(proposal),
        | Message::AcceptNotification { proposal } => self.respond_accept_notification(proposal),
        | Message::NewLeaderNotification { num } => self.respond_new_leader(num),
        }
    }

    /// Acceptor role: promise away lower proposal numbers.
    ///
    /// The promise only rises on a strictly greater psn, but every
    /// prepare draws a response, so a prepare carrying the exact
    /// current promise still counts toward its proposer's majority.
    fn respond_prepare_request(&mut self, sender: NodeLocation, csn: usize, psn: usize) {
        debug!("prepare request ({}, {}) from {}", csn, psn, sender);
        let min_psn = self
            .stable
            .min_psns
            .entry(csn)
            .and_modify(|min| {
                if *min < psn {
                    *min = psn;
                }
            })
            .or_insert(psn);
        let response = Message::PrepareResponse {
            csn,
            min_psn: *min_psn,
            accepted: self.stable.max_accepted.get(&csn).cloned(),
        };
        self.shared.unicast(sender, response);
        self.persist();
    }

    /// Proposer role: tally promises for the round in flight.
    fn respond_prepare_response(&mut self, csn: usize, min_psn: usize, accepted: Option<Proposal>) {
        // the round is already closed once a majority has been heard
        let count = match self.num_accept_requests.get(&csn) {
        | Some(count) => *count,
        | None => return,
        };
        let proposal = match self.proposals.get_mut(&csn) {
        | Some(proposal) => proposal,
        | None => return,
        };

        // an acceptance reported by any acceptor supersedes our value:
        // champion the highest-psn value seen this round, under our own psn
        if let Some(accepted) = accepted {
            let supersedes = match self.adoptions.get(&csn) {
            | Some(psn) => accepted.psn > *psn,
            | None => true,
            };
            if supersedes {
                debug!("adopting {:?} for slot {}", accepted.value, csn);
                self.adoptions.insert(csn, accepted.psn);
                proposal.value = accepted.value;
            }
        }
        let proposal = proposal.clone();

        // stale round: catch the psn counter up past the reported
        // promise and start over with the (possibly adopted) value
        if min_psn > proposal.psn {
            let nodes = self.shared.read().membership().count();
            while self.psn < min_psn {
                self.psn += nodes;
            }
            self.submit(csn, proposal.value);
            return;
        }

        let count = count + 1;
        if count > self.shared.read().membership().count() / 2 {
            self.num_accept_requests.remove(&csn);
            self.adoptions.remove(&csn);
            self.reproposers.remove(&csn);
            self.shared.broadcast(Message::AcceptRequest { proposal });
        } else {
            self.num_accept_requests.insert(csn, count);
        }
    }

    /// Acceptor role: accept anything at or above the slot's promise.
    fn respond_accept_request(&mut self, proposal: Proposal) {
        let csn = proposal.csn;
        let psn = proposal.psn;
        match self.stable.min_psns.get(&csn).copied() {
        | Some(min) if psn < min => return,
        | Some(min) if psn > min => {
            self.stable.min_psns.insert(csn, psn);
        }
        | Some(_) => (),
        | None => {
            self.stable.min_psns.insert(csn, psn);
        }
        }
        debug!("accepted {:?}", proposal);
        self.stable.max_accepted.insert(csn, proposal.clone());

        // learners may only be told about an acceptance that is on disk
        if let Err(error) = self.storage.save(&self.stable) {
            error!("failed to write stable storage, withholding notification: {}", error);
            return;
        }
        self.shared.broadcast(Message::AcceptNotification { proposal });
    }

    /// Learner role: a slot is decided once a majority of acceptors
    /// report the same round. Later notifications cannot change it.
    fn respond_accept_notification(&mut self, proposal: Proposal) {
        let csn = proposal.csn;
        if self.has_learned.contains(&csn) {
            return;
        }
        let count = {
            let count = self.num_accept_notifications.entry((csn, proposal.psn)).or_insert(0);
            *count += 1;
            *count
        };
        if count > self.shared.read().membership().count() / 2 {
            self.has_learned.insert(csn);
            info!("learned {:?} for slot {}", proposal.value, csn);
            self.shared.write().record_chosen(csn, proposal.value);
            // best-effort snapshot refresh; learned values themselves
            // are not durable in this design
            self.persist();
        }
    }

    fn respond_new_leader(&mut self, num: usize) {
        debug!("new leader {}", num);
        self.shared.write().membership_mut().set_leader(num);
    }

    /// Proposer role: open a fresh prepare round for a slot.
    fn submit(&mut self, csn: usize, value: String) {
        // a fresh round supersedes the slot's pending re-propose timer
        self.reproposers.remove(&csn);
        self.adoptions.remove(&csn);
        self.num_accept_requests.insert(csn, 0);

        let proposal = Proposal { csn, psn: self.psn, value };
        info!("proposing {:?}", proposal);
        self.proposals.insert(csn, proposal.clone());

        let (reproposer, cancel) = ReProposer::new(self.tx.clone(), proposal.clone(), self.propose_timeout);
        self.reproposers.insert(csn, cancel);
        tokio::spawn(reproposer.run());

        self.shared.broadcast(Message::PrepareRequest { csn, psn: proposal.psn });
        // advancing by the membership size keeps psns globally unique
        self.psn += self.shared.read().membership().count();
    }

    fn persist(&self) {
        if let Err(error) = self.storage.save(&self.stable) {
            error!("failed to write stable storage: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::net::TcpListener;
    use tokio::time;

    use super::*;
    use crate::socket;

    fn location(num: usize, port: u16) -> NodeLocation {
        NodeLocation::new("127.0.0.1", port, num)
    }

    /// Ports 1-3 refuse connections immediately, so sends to absent
    /// peers fail fast instead of running to the deadline.
    fn absent_nodes() -> Vec<NodeLocation> {
        vec![location(0, 1), location(1, 2), location(2, 3)]
    }

    fn build(
        local_num: usize,
        nodes: Vec<NodeLocation>,
        directory: &Path,
    ) -> (Protocol, Shared, watch::Sender<bool>) {
        let local = nodes
            .iter()
            .find(|node| node.num == local_num)
            .unwrap()
            .clone();
        let shared = Shared::new(local, Duration::from_secs(5));
        shared.write().membership_mut().set_nodes(nodes);
        let (rx, tx) = internal::new();
        shared.write().set_dispatcher(tx.clone());
        let storage = Storage::new(directory.join("node.bak"));
        let (shutdown, signal) = watch::channel(false);
        let protocol = Protocol::new(
            rx,
            tx,
            shared.clone(),
            storage,
            Duration::from_secs(30),
            signal,
        );
        (protocol, shared, shutdown)
    }

    async fn next_self_message(protocol: &mut Protocol) -> Message {
        let input = time::timeout(Duration::from_secs(5), protocol.rx.recv())
            .await
            .expect("timed out waiting for dispatcher input")
            .expect("dispatcher queue closed");
        match input {
        | In::Deliver(envelope) => envelope.message,
        | input => panic!("unexpected dispatcher input: {:?}", input),
        }
    }

    async fn assert_queue_idle(protocol: &mut Protocol) {
        assert!(
            time::timeout(Duration::from_millis(200), protocol.rx.recv())
                .await
                .is_err()
        );
    }

    async fn recv_unicast(listener: &TcpListener) -> Envelope {
        let (stream, _) = time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("timed out waiting for connection")
            .unwrap();
        let (mut rx, _) = socket::split::<Envelope, Envelope>(stream);
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out reading unicast")
            .expect("connection closed before a frame arrived")
            .expect("undecodable frame")
    }

    #[tokio::test]
    async fn prepare_requests_promise_monotonically_and_always_reply() {
        let directory = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let nodes = vec![location(0, 1), location(1, port), location(2, 3)];
        let sender = nodes[1].clone();
        let (mut protocol, _shared, _shutdown) = build(0, nodes, directory.path());

        let prepare = |psn| Envelope {
            sender: sender.clone(),
            receiver: None,
            message: Message::PrepareRequest { csn: 0, psn },
        };

        protocol.deliver(prepare(7));
        let reply = recv_unicast(&listener).await;
        assert_eq!(reply.receiver, Some(sender.clone()));
        assert_eq!(
            reply.message,
            Message::PrepareResponse { csn: 0, min_psn: 7, accepted: None },
        );

        // an equal psn leaves the promise unchanged but still replies
        protocol.deliver(prepare(7));
        assert_eq!(
            recv_unicast(&listener).await.message,
            Message::PrepareResponse { csn: 0, min_psn: 7, accepted: None },
        );

        // a lower psn never lowers the promise
        protocol.deliver(prepare(4));
        assert_eq!(
            recv_unicast(&listener).await.message,
            Message::PrepareResponse { csn: 0, min_psn: 7, accepted: None },
        );

        protocol.deliver(prepare(10));
        assert_eq!(
            recv_unicast(&listener).await.message,
            Message::PrepareResponse { csn: 0, min_psn: 10, accepted: None },
        );
    }

    #[tokio::test]
    async fn majority_of_promises_broadcasts_accept_request() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, _shared, _shutdown) = build(0, absent_nodes(), directory.path());

        protocol.submit(0, "A".to_string());
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::PrepareRequest { csn: 0, psn: 0 },
        );
        assert_eq!(protocol.psn, 3);

        protocol.respond_prepare_response(0, 0, None);
        assert_eq!(protocol.num_accept_requests.get(&0), Some(&1));

        protocol.respond_prepare_response(0, 0, None);
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::AcceptRequest {
                proposal: Proposal { csn: 0, psn: 0, value: "A".to_string() },
            },
        );
        assert!(protocol.num_accept_requests.get(&0).is_none());
        assert!(protocol.reproposers.get(&0).is_none());

        // the round is closed: further responses change nothing
        protocol.respond_prepare_response(0, 0, None);
        assert_queue_idle(&mut protocol).await;
    }

    #[tokio::test]
    async fn previously_accepted_value_is_adopted() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, _shared, _shutdown) = build(1, absent_nodes(), directory.path());

        protocol.submit(0, "B".to_string());
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::PrepareRequest { csn: 0, psn: 1 },
        );

        let accepted = Proposal { csn: 0, psn: 0, value: "A".to_string() };
        protocol.respond_prepare_response(0, 1, Some(accepted));
        protocol.respond_prepare_response(0, 1, None);

        // the earlier acceptance wins the value; the psn stays ours
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::AcceptRequest {
                proposal: Proposal { csn: 0, psn: 1, value: "A".to_string() },
            },
        );
    }

    #[tokio::test]
    async fn stale_round_advances_psn_and_reproposes() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, _shared, _shutdown) = build(0, absent_nodes(), directory.path());

        protocol.submit(0, "A".to_string());
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::PrepareRequest { csn: 0, psn: 0 },
        );

        // someone already promised psn 4: our round is stale
        protocol.respond_prepare_response(0, 4, None);
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::PrepareRequest { csn: 0, psn: 6 },
        );
        assert_eq!(protocol.proposals.get(&0).map(|p| p.psn), Some(6));
        // the counter stays congruent to our membership index
        assert_eq!(protocol.psn, 9);
        assert_eq!(protocol.psn % 3, 0);
    }

    #[tokio::test]
    async fn acceptances_raise_promises_and_notify_learners() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, _shared, _shutdown) = build(0, absent_nodes(), directory.path());

        let proposal = Proposal { csn: 2, psn: 5, value: "X".to_string() };
        protocol.respond_accept_request(proposal.clone());
        assert_eq!(protocol.stable.min_psns.get(&2), Some(&5));
        assert_eq!(protocol.stable.max_accepted.get(&2), Some(&proposal));
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::AcceptNotification { proposal: proposal.clone() },
        );

        // the acceptance was durable before the notification went out
        let snapshot: Stable = Storage::new(directory.path().join("node.bak"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.min_psns.get(&2), Some(&5));
        assert_eq!(snapshot.max_accepted.get(&2), Some(&proposal));

        // below the slot's promise: ignored entirely
        protocol.respond_accept_request(Proposal { csn: 2, psn: 4, value: "Y".to_string() });
        assert_eq!(protocol.stable.max_accepted.get(&2), Some(&proposal));
        assert_queue_idle(&mut protocol).await;
    }

    #[tokio::test]
    async fn learner_needs_a_majority_and_learns_once() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, shared, _shutdown) = build(0, absent_nodes(), directory.path());

        let proposal = Proposal { csn: 2, psn: 0, value: "A".to_string() };
        protocol.respond_accept_notification(proposal.clone());
        assert!(shared.read().chosen().is_empty());

        protocol.respond_accept_notification(proposal);
        assert_eq!(
            shared.read().chosen(),
            &[None, None, Some("A".to_string())],
        );

        // a decided slot never changes
        protocol.respond_accept_notification(Proposal { csn: 2, psn: 9, value: "Z".to_string() });
        protocol.respond_accept_notification(Proposal { csn: 2, psn: 9, value: "Z".to_string() });
        assert_eq!(shared.read().chosen()[2], Some("A".to_string()));

        // other slots decide independently, in any order
        let proposal = Proposal { csn: 0, psn: 1, value: "B".to_string() };
        protocol.respond_accept_notification(proposal.clone());
        protocol.respond_accept_notification(proposal);
        assert_eq!(
            shared.read().chosen(),
            &[Some("B".to_string()), None, Some("A".to_string())],
        );
    }

    #[tokio::test]
    async fn mixed_rounds_do_not_reach_a_false_majority() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, shared, _shutdown) = build(0, absent_nodes(), directory.path());

        // one stray acceptance of an older round, one of a newer round:
        // neither constitutes a majority on its own
        protocol.respond_accept_notification(Proposal { csn: 0, psn: 0, value: "A".to_string() });
        protocol.respond_accept_notification(Proposal { csn: 0, psn: 1, value: "B".to_string() });
        assert!(shared.read().chosen().is_empty());

        protocol.respond_accept_notification(Proposal { csn: 0, psn: 1, value: "B".to_string() });
        assert_eq!(shared.read().chosen()[0], Some("B".to_string()));
    }

    #[tokio::test]
    async fn leader_rotation_converges_the_view() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, shared, _shutdown) = build(0, absent_nodes(), directory.path());

        protocol.respond_new_leader(1);
        assert!(shared.read().membership().is_leader(1));

        // the hub's rotation announcement loops back through the queue
        shared.elect_new_leader();
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::NewLeaderNotification { num: 2 },
        );
        protocol.respond_new_leader(2);
        assert!(shared.read().membership().is_leader(2));
        assert!(!shared.read().membership().is_leader(1));
    }

    #[tokio::test]
    async fn submissions_allocate_consecutive_slots() {
        let directory = tempfile::tempdir().unwrap();
        let (mut protocol, _shared, _shutdown) = build(0, absent_nodes(), directory.path());

        protocol.handle(In::Submit { csn: None, value: "A".to_string() });
        protocol.handle(In::Submit { csn: None, value: "B".to_string() });
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::PrepareRequest { csn: 0, psn: 0 },
        );
        assert_eq!(
            next_self_message(&mut protocol).await,
            Message::PrepareRequest { csn: 1, psn: 3 },
        );

        // an explicit slot does not advance the allocator
        protocol.handle(In::Submit { csn: Some(7), value: "C".to_string() });
        assert_eq!(protocol.current_csn, 2);
    }

    #[tokio::test]
    async fn restart_preserves_promises_and_acceptances() {
        let directory = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let nodes = vec![location(0, 1), location(1, port), location(2, 3)];
        let sender = nodes[1].clone();
        let accepted = Proposal { csn: 3, psn: 5, value: "X".to_string() };

        {
            let (mut protocol, _shared, _shutdown) = build(0, nodes.clone(), directory.path());
            protocol.deliver(Envelope {
                sender: sender.clone(),
                receiver: None,
                message: Message::PrepareRequest { csn: 3, psn: 5 },
            });
            recv_unicast(&listener).await;
            protocol.deliver(Envelope {
                sender: sender.clone(),
                receiver: None,
                message: Message::AcceptRequest { proposal: accepted.clone() },
            });
            // the acceptance fans out to the live peer as well
            recv_unicast(&listener).await;
        }

        let (mut protocol, _shared, _shutdown) = build(0, nodes, directory.path());

        // a stale prepare cannot roll the promise back
        protocol.deliver(Envelope {
            sender: sender.clone(),
            receiver: None,
            message: Message::PrepareRequest { csn: 3, psn: 4 },
        });
        assert_eq!(
            recv_unicast(&listener).await.message,
            Message::PrepareResponse { csn: 3, min_psn: 5, accepted: Some(accepted.clone()) },
        );

        // a higher prepare raises it and reports the old acceptance
        protocol.deliver(Envelope {
            sender,
            receiver: None,
            message: Message::PrepareRequest { csn: 3, psn: 6 },
        });
        assert_eq!(
            recv_unicast(&listener).await.message,
            Message::PrepareResponse { csn: 3, min_psn: 6, accepted: Some(accepted) },
        );
    }
}
