//! User-facing callback objects bound to transports.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use log::error;

use crate::net::Socket;
use crate::transport::SocketTransport;

/// The callback object bound 1:1 to a transport.
///
/// Every method has a default: no-op for the lifecycle events, a logged
/// trace for `on_error`. Override only what you need. Returning an error
/// from any lifecycle callback routes it to `on_error` on the same handler.
///
/// Dispatch guarantees: `on_connect` and `on_connect_failed` are mutually
/// exclusive, `on_close` fires at most once, `on_cleanup` fires exactly once
/// by the time the reactor closes or the transport's `close()` returns.
#[allow(unused_variables)]
pub trait Handler {
    /// The transport is readable (or, for a listener, has pending
    /// connections if you did not use [`AcceptHandler`]).
    fn on_readable(&mut self, transport: &SocketTransport) -> io::Result<()> {
        Ok(())
    }

    /// The transport is writable.
    fn on_writable(&mut self, transport: &SocketTransport) -> io::Result<()> {
        Ok(())
    }

    /// A connect completed, whether immediate, in-progress or detected on a
    /// pre-connected adopted socket.
    fn on_connect(&mut self, transport: &SocketTransport) -> io::Result<()> {
        Ok(())
    }

    /// A connect failed; `err` is the socket error. Neither `on_connect`
    /// nor `on_close` will follow.
    fn on_connect_failed(&mut self, transport: &SocketTransport, err: io::Error) -> io::Result<()> {
        Ok(())
    }

    /// Out-of-band data is pending. Never synthesized on kqueue platforms.
    fn on_except(&mut self, transport: &SocketTransport) -> io::Result<()> {
        Ok(())
    }

    /// The peer closed the connection. The transport is torn down right
    /// after this returns.
    fn on_close(&mut self, transport: &SocketTransport) -> io::Result<()> {
        Ok(())
    }

    /// Last rites: the transport's resources are gone (or, on reactor
    /// close, about to be abandoned).
    fn on_cleanup(&mut self, transport: &SocketTransport) {}

    /// A lifecycle callback returned an error.
    fn on_error(&mut self, transport: &SocketTransport, err: io::Error) {
        error!("unhandled handler error: {}", err);
    }
}

/// Accept-side callback: gets each new connection as a bare [`Socket`].
///
/// Wrap an `AcceptHandler` in [`Acceptor`] to use it as a [`Handler`] whose
/// readable events accept one pending connection per event and hand it to
/// [`on_accept`](AcceptHandler::on_accept).
pub trait AcceptHandler {
    fn on_accept(
        &mut self,
        listener: &SocketTransport,
        socket: Socket,
        addr: SocketAddr,
    ) -> io::Result<()>;
}

/// Adapter making any [`AcceptHandler`] a [`Handler`] on a listening
/// transport.
#[derive(Debug)]
pub struct Acceptor<A>(pub A);

impl<A: AcceptHandler> Handler for Acceptor<A> {
    fn on_readable(&mut self, transport: &SocketTransport) -> io::Result<()> {
        if let Some((socket, addr)) = transport.accept()? {
            self.0.on_accept(transport, socket, addr)?;
        }
        Ok(())
    }
}

/// Adapts a closure into an [`AcceptHandler`].
pub struct Server<F> {
    on_connection: F,
}

impl<F> Server<F>
where
    F: FnMut(&SocketTransport, Socket, SocketAddr) -> io::Result<()>,
{
    pub fn new(on_connection: F) -> Server<F> {
        Server { on_connection }
    }
}

impl<F> AcceptHandler for Server<F>
where
    F: FnMut(&SocketTransport, Socket, SocketAddr) -> io::Result<()>,
{
    fn on_accept(
        &mut self,
        listener: &SocketTransport,
        socket: Socket,
        addr: SocketAddr,
    ) -> io::Result<()> {
        (self.on_connection)(listener, socket, addr)
    }
}

impl<F> Handler for Server<F>
where
    F: FnMut(&SocketTransport, Socket, SocketAddr) -> io::Result<()>,
{
    fn on_readable(&mut self, transport: &SocketTransport) -> io::Result<()> {
        if let Some((socket, addr)) = transport.accept()? {
            self.on_accept(transport, socket, addr)?;
        }
        Ok(())
    }
}

impl<F> fmt::Debug for Server<F> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Server").finish_non_exhaustive()
    }
}
