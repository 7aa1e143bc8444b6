use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time;

use crate::message::Message;
use crate::shared::Shared;

/// Periodically broadcasts a liveness probe to the whole membership.
///
/// The delay is re-rolled uniformly within the configured range after
/// every beat so the membership's heartbeats don't synchronize.
/// Heartbeats carry no protocol state; their presence on the wire
/// exercises the transport and its crash detection.
pub(crate) struct Heartbeat {
    shared: Shared,
    min: Duration,
    max: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Heartbeat {
    pub fn new(shared: Shared, min: Duration, max: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Heartbeat {
            shared,
            min,
            max,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            let delay = rand::thread_rng().gen_range(self.min.as_millis()..self.max.as_millis());
            tokio::select! {
                _ = time::sleep(Duration::from_millis(delay as u64)) => {
                    self.shared.broadcast(Message::Heartbeat);
                }
                _ = self.shutdown.changed() => return,
            }
        }
    }
}
