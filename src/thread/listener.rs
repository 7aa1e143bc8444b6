use std::time::Duration;

use tokio::net;
use tokio::sync::watch;
use tokio::time;

use crate::internal;
use crate::message::Envelope;
use crate::protocol;
use crate::socket;

/// Accepts inbound connections sequentially and decodes one message
/// per connection, delivering it to the dispatcher.
///
/// Faults never stop the loop: a failed accept, an undecodable frame,
/// or a peer that connects and stalls (bounded by the per-connection
/// deadline) all log and move on to the next connection.
pub(crate) struct Listener {
    listener: net::TcpListener,
    dispatcher: internal::Tx<protocol::In>,
    deadline: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(
        listener: net::TcpListener,
        dispatcher: internal::Tx<protocol::In>,
        deadline: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Listener {
            listener,
            dispatcher,
            deadline,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            let stream = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                | Ok((stream, _)) => stream,
                | Err(error) => {
                    warn!("failed to accept connection: {}", error);
                    continue;
                }
                },
                _ = self.shutdown.changed() => return,
            };

            let (mut rx, _) = socket::split::<Envelope, Envelope>(stream);
            match time::timeout(self.deadline, rx.recv()).await {
            | Ok(Some(Ok(envelope))) => {
                self.dispatcher.try_send(protocol::In::Deliver(envelope))
            }
            | Ok(Some(Err(error))) => warn!("discarding undecodable message: {}", error),
            | Ok(None) => (),
            | Err(_) => warn!("timed out reading inbound connection"),
            }
        }
    }
}
