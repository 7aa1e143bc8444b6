use tokio::net;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Error;
use crate::internal;
use crate::location::NodeLocation;
use crate::protocol;
use crate::shared::Shared;
use crate::storage::Storage;
use crate::thread::heartbeat::Heartbeat;
use crate::thread::listener::Listener;

/// Handle to a single consensus node.
///
/// Every node plays proposer, acceptor, and learner for every slot, so
/// a value may be submitted to any of them. The handle stays usable
/// across `start`/`stop` cycles; durable acceptor state survives them.
pub struct Node {
    config: Config,
    shared: Shared,
    storage: Storage<protocol::Stable>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        let shared = Shared::new(config.location(), config.socket_timeout);
        let storage = Storage::new(config.storage_path());
        Node {
            config,
            shared,
            storage,
            shutdown: None,
        }
    }

    /// Replace the membership. The set should include this node.
    pub fn set_peers(&self, peers: Vec<NodeLocation>) {
        self.shared.write().membership_mut().set_nodes(peers);
    }

    /// The current membership, as this node sees it.
    pub fn peers(&self) -> Vec<NodeLocation> {
        self.shared.read().membership().nodes().to_vec()
    }

    /// Recover stable storage, then begin listening and heartbeating.
    /// Does nothing if the node is already running.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.shutdown.is_some() {
            return Ok(());
        }

        let (rx, tx) = internal::new();
        let (shutdown, signal) = watch::channel(false);

        // acceptor state must be recovered before any message arrives
        let protocol = protocol::Protocol::new(
            rx,
            tx.clone(),
            self.shared.clone(),
            Storage::new(self.config.storage_path()),
            self.config.propose_timeout,
            signal.clone(),
        );

        let listener = net::TcpListener::bind(self.config.location().address()).await?;
        self.shared.write().set_dispatcher(tx.clone());

        tokio::spawn(protocol.run());
        tokio::spawn(
            Listener::new(listener, tx, self.config.socket_timeout, signal.clone()).run(),
        );
        tokio::spawn(
            Heartbeat::new(
                self.shared.clone(),
                self.config.heartbeat_min,
                self.config.heartbeat_max,
                signal,
            )
            .run(),
        );

        self.shutdown = Some(shutdown);
        info!("{} started", self.config.location());
        Ok(())
    }

    /// Stop the background tasks. In-flight sends run to their
    /// deadline and exit; subsequent submissions are dropped.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            self.shared.write().clear_dispatcher();
            shutdown.send(true).ok();
            info!("{} stopped", self.config.location());
        }
    }

    /// Propose a value for the next unused slot.
    pub fn submit<V: Into<String>>(&self, value: V) {
        self.shared.dispatch(protocol::In::Submit {
            csn: None,
            value: value.into(),
        });
    }

    /// Propose a value for a specific slot.
    pub fn submit_at<V: Into<String>>(&self, csn: usize, value: V) {
        self.shared.dispatch(protocol::In::Submit {
            csn: Some(csn),
            value: value.into(),
        });
    }

    /// Snapshot of the decided log. Slots not yet decided are `None`;
    /// the log only extends as far as the highest decided slot.
    pub fn decided_values(&self) -> Vec<Option<String>> {
        self.shared.read().chosen().to_vec()
    }

    /// Flag this node as leader across the local membership view.
    pub fn become_leader(&self) {
        self.shared.write().membership_mut().set_leader(self.config.num);
    }

    pub fn is_leader(&self) -> bool {
        self.shared.read().membership().is_leader(self.config.num)
    }

    pub fn location(&self) -> NodeLocation {
        self.config.location()
    }

    /// Delete this node's durable snapshot.
    pub fn clear_storage(&self) -> Result<(), Error> {
        self.storage.clear()
    }
}
