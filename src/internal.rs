//! # Summary
//!
//! This module abstracts over internal connections to other tasks.
//!
//! Currently backed by `tokio::sync::mpsc`: multiple-producer
//! single-consumer channels. Since we're using unbounded channels, the
//! only way for a send to fail is if the receiving end has been dropped.
//! The dispatcher's receiving end disappears on shutdown while listener
//! and timer tasks may still be draining, so `try_send` silently drops
//! messages instead of panicking; the protocol tolerates lost messages
//! by construction.

use tokio::sync::mpsc;

/// Intra-node receiving channel.
#[derive(Debug)]
pub(crate) struct Rx<T>(mpsc::UnboundedReceiver<T>);

/// Intra-node transmission channel. All clones send to the same receiving end.
#[derive(Debug)]
pub(crate) struct Tx<T>(mpsc::UnboundedSender<T>);

impl<T> Clone for Tx<T> {
    fn clone(&self) -> Self {
        Tx(self.0.clone())
    }
}

/// Create a new pair of linked receiving and transmitting channels.
pub(crate) fn new<T>() -> (Rx<T>, Tx<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Rx(rx), Tx(tx))
}

impl<T> Tx<T> {
    /// Attempt to send a message through the channel.
    /// Does nothing if the receiving end has been dropped.
    pub fn try_send(&self, message: T) {
        self.0.send(message).ok();
    }
}

impl<T> Rx<T> {
    /// Receive the next message, or `None` once all senders have dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }
}
