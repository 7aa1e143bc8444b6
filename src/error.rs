use std::fmt;
use std::io;

/// Faults surfaced by the transport and by stable storage.
///
/// The protocol itself absorbs these: a dropped message is recovered
/// by the re-propose timer, and a failed snapshot is logged without
/// taking the node down. They only propagate out of APIs like
/// `Node::start` where the caller has to react.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Codec(bincode::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
        | Error::Io(error) => write!(f, "I/O error: {}", error),
        | Error::Codec(error) => write!(f, "serialization error: {}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
        | Error::Io(error) => Some(error),
        | Error::Codec(error) => Some(&**error),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Codec(error)
    }
}
