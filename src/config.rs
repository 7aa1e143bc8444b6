use std::path::PathBuf;
use std::time::Duration;

use crate::location::NodeLocation;

/// Per-node configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Index of this node in the membership, in `[0, N)`. Doubles as
    /// the seed for its proposal numbers.
    pub(crate) num: usize,

    /// Host to listen on.
    pub(crate) host: String,

    /// Port to listen on for peer messages.
    pub(crate) port: u16,

    /// Deadline for a single outbound connection.
    pub(crate) socket_timeout: Duration,

    /// How long a proposer waits for a majority of promises before
    /// retrying the slot with a fresh proposal number.
    pub(crate) propose_timeout: Duration,

    /// Bounds for the randomized heartbeat delay.
    pub(crate) heartbeat_min: Duration,
    pub(crate) heartbeat_max: Duration,

    /// Directory holding this node's durable snapshot.
    pub(crate) storage_dir: PathBuf,
}

impl Config {
    pub fn new<H: Into<String>>(num: usize, host: H, port: u16) -> Self {
        Config {
            num,
            host: host.into(),
            port,
            socket_timeout: Duration::from_millis(5000),
            propose_timeout: Duration::from_millis(10000),
            heartbeat_min: Duration::from_millis(1000),
            heartbeat_max: Duration::from_millis(2000),
            storage_dir: PathBuf::from("stableStorage"),
        }
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_propose_timeout(mut self, timeout: Duration) -> Self {
        self.propose_timeout = timeout;
        self
    }

    /// The heartbeat delay is drawn uniformly from `[min, max)`.
    pub fn with_heartbeat_interval(mut self, min: Duration, max: Duration) -> Self {
        self.heartbeat_min = min;
        self.heartbeat_max = max;
        self
    }

    pub fn with_storage_dir<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.storage_dir = directory.into();
        self
    }

    pub(crate) fn location(&self) -> NodeLocation {
        NodeLocation::new(self.host.clone(), self.port, self.num)
    }

    pub(crate) fn storage_path(&self) -> PathBuf {
        self.storage_dir.join(format!("{}.bak", self.location()))
    }
}
