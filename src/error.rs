use std::io;
use std::os::unix::io::RawFd;

/// Errors surfaced by the reactor API.
///
/// I/O operations on individual sockets and elements return plain
/// [`io::Result`]; this enum covers the reactor-level failure modes plus
/// address parsing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The reactor was closed; no further polls will succeed.
    #[error("reactor is closed")]
    ReactorClosed,

    /// A transport with the same file descriptor is already registered.
    #[error("fd {0} is already registered with the reactor")]
    AlreadyRegistered(RawFd),

    /// A chain already holds its single continuation.
    #[error("chain already has a continuation")]
    ChainOccupied,

    /// An address string that is neither a valid IPv4 nor IPv6 endpoint.
    #[error("malformed address {0:?}")]
    MalformedAddress(String),

    /// Any other operating-system failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the reactor-closed condition, which ends
    /// [`Reactor::run`](crate::Reactor::run) without being fatal.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ReactorClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
