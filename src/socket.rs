//! # Summary
//!
//! This module abstracts over external connections to peer nodes.
//!
//! Each connection carries length-delimited, `bincode`-encoded frames
//! over `tokio`'s asynchronous TCP stream. The protocol only ever sends
//! a single message per connection, but the framing keeps the wire
//! format self-describing and lets heterogeneous tooling talk to a node
//! with minimal boilerplate on the sending and receiving ends.

use std::marker::PhantomData;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::Error;

/// External receiving channel. Expects length-delimited, bincode-encoded
/// Rust data of type `R` sent via TCP.
pub struct Rx<R>(
    FramedRead<net::tcp::OwnedReadHalf, LengthDelimitedCodec>,
    PhantomData<R>,
);

/// External transmission channel. Sends length-delimited, bincode-encoded
/// Rust data of type `T` over TCP.
pub struct Tx<T>(
    FramedWrite<net::tcp::OwnedWriteHalf, LengthDelimitedCodec>,
    PhantomData<T>,
);

/// Split a `tokio::net::TcpStream` into a pair of receiving and
/// transmitting channels capable of reading and writing bincode-encoded
/// data.
pub fn split<R, T>(stream: net::TcpStream) -> (Rx<R>, Tx<T>)
where
    R: serde::de::DeserializeOwned,
    T: serde::Serialize,
{
    let (rx, tx) = stream.into_split();
    let rx = FramedRead::new(rx, LengthDelimitedCodec::new());
    let tx = FramedWrite::new(tx, LengthDelimitedCodec::new());
    (Rx(rx, PhantomData), Tx(tx, PhantomData))
}

impl<R: serde::de::DeserializeOwned> Rx<R> {
    /// Receive and decode the next frame, or `None` once the peer has
    /// closed the connection.
    pub async fn recv(&mut self) -> Option<Result<R, Error>> {
        match self.0.next().await {
        | None => None,
        | Some(Err(error)) => Some(Err(error.into())),
        | Some(Ok(frame)) => Some(bincode::deserialize(&frame).map_err(Error::from)),
        }
    }
}

impl<T: serde::Serialize> Tx<T> {
    /// Encode and send a single frame.
    pub async fn send(&mut self, message: &T) -> Result<(), Error> {
        let bytes = bincode::serialize(message)?;
        self.0.send(Bytes::from(bytes)).await.map_err(Error::from)
    }
}
