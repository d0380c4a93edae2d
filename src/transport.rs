use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use log::trace;

use crate::dispatch::{self, Lifecycle};
use crate::element::{Sink, Source};
use crate::error::Result;
use crate::handler::Handler;
use crate::net::Socket;
use crate::reactor::{Inner as ReactorInner, Reactor};
use crate::Interest;

/// The sticky and interest state of a transport.
///
/// Kept behind an `Arc` with atomic fields so an [`InterestHandle`] can flip
/// flags from a foreign thread during an interrupt; the reactor re-derives
/// backend interest masks from here.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    readable: AtomicBool,
    writable: AtomicBool,
    awaiting_connect: AtomicBool,
    connected: AtomicBool,
    listening: AtomicBool,
    sendall_pending: AtomicBool,
    closed: AtomicBool,
    close_dispatched: AtomicBool,
    cleanup_dispatched: AtomicBool,
}

impl Flags {
    pub(crate) fn readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }

    pub(crate) fn writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub(crate) fn awaiting_connect(&self) -> bool {
        self.awaiting_connect.load(Ordering::SeqCst)
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn suppress_close_dispatch(&self) {
        self.close_dispatched.store(true, Ordering::SeqCst);
    }

    pub(crate) fn claim_close_dispatch(&self) -> bool {
        !self.close_dispatched.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn claim_cleanup_dispatch(&self) -> bool {
        !self.cleanup_dispatched.swap(true, Ordering::SeqCst)
    }

    /// The interest the reactor should actually watch: the user's `readable`
    /// plus write readiness whenever the user wants it, a connect is in
    /// flight, or a sendall drain is pending. The user-facing flag values
    /// are never touched.
    pub(crate) fn effective_interest(&self) -> Interest {
        let mut interest = Interest::NONE;
        if self.readable() {
            interest |= Interest::READABLE;
        }
        if self.writable()
            || self.awaiting_connect()
            || self.sendall_pending.load(Ordering::SeqCst)
        {
            interest |= Interest::WRITABLE;
        }
        interest
    }
}

/// A `Send + Sync` handle onto a transport's interest flags.
///
/// Foreign threads may not touch the reactor or the transport directly; they
/// flip flags through this handle inside a [`Waker::interrupt`] window (or
/// between explicit `start_interrupt` / `end_interrupt` calls) and the
/// reactor refreshes its backend masks when the interrupt ends.
///
/// [`Waker::interrupt`]: crate::Waker::interrupt
#[derive(Clone, Debug)]
pub struct InterestHandle {
    flags: Arc<Flags>,
}

impl InterestHandle {
    pub fn set_readable(&self, readable: bool) {
        self.flags.readable.store(readable, Ordering::SeqCst);
    }

    pub fn set_writable(&self, writable: bool) {
        self.flags.writable.store(writable, Ordering::SeqCst);
    }

    pub fn readable(&self) -> bool {
        self.flags.readable()
    }

    pub fn writable(&self) -> bool {
        self.flags.writable()
    }
}

fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn is_in_progress(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EAGAIN)
    )
}

pub(crate) fn is_connection_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNRESET)
            | Some(libc::ECONNABORTED)
            | Some(libc::ENOTCONN)
            | Some(libc::ESHUTDOWN)
            | Some(libc::EPIPE)
    )
}

/// A non-blocking socket bound to a reactor.
///
/// The transport owns its file descriptor exclusively and tracks the
/// lifecycle state the dispatcher needs: interest flags, the
/// connect-in-progress latch, and the sticky closed/cleaned-up markers that
/// make `on_close` fire at most once and `on_cleanup` exactly once.
///
/// Lifecycle events are routed to the handler attached with
/// [`set_handler`](SocketTransport::set_handler). All methods must be called
/// on the reactor thread; cross-thread access goes through
/// [`interest_handle`](SocketTransport::interest_handle).
pub struct SocketTransport {
    fd: RawFd,
    sock: RefCell<Option<Socket>>,
    reactor: Weak<ReactorInner>,
    flags: Arc<Flags>,
    handler: RefCell<Option<Rc<RefCell<dyn Handler>>>>,
    sendbuf: RefCell<BytesMut>,
    weak_self: Weak<SocketTransport>,
    pending: RefCell<VecDeque<Lifecycle>>,
    in_dispatch: Cell<bool>,
}

impl SocketTransport {
    /// Create a transport over a fresh non-blocking IPv4 stream socket and
    /// register it with the reactor.
    pub fn new(reactor: &Reactor) -> Result<Rc<SocketTransport>> {
        SocketTransport::with_socket(reactor, Socket::stream_v4()?)
    }

    /// Adopt an existing socket (for example one returned by
    /// [`accept`](SocketTransport::accept)) and register it.
    ///
    /// Whether the socket is already connected is detected by querying the
    /// peer name: a connected socket synthesizes an immediate `on_connect`
    /// once a handler is attached, an unconnected one is treated as having a
    /// connect pending so an externally initiated non-blocking connect
    /// completes through the usual write-readiness path.
    pub fn with_socket(reactor: &Reactor, sock: Socket) -> Result<Rc<SocketTransport>> {
        let fd = sock.as_raw_fd();
        let connected = sock.is_connected()?;

        let transport = Rc::new_cyclic(|weak_self| SocketTransport {
            fd,
            sock: RefCell::new(Some(sock)),
            reactor: Rc::downgrade(&reactor.inner),
            flags: Arc::new(Flags::default()),
            handler: RefCell::new(None),
            sendbuf: RefCell::new(BytesMut::new()),
            weak_self: weak_self.clone(),
            pending: RefCell::new(VecDeque::new()),
            in_dispatch: Cell::new(false),
        });

        if connected {
            transport.flags.mark_connected();
        } else {
            transport
                .flags
                .awaiting_connect
                .store(true, Ordering::SeqCst);
        }

        reactor.inner.register_transport(Rc::clone(&transport))?;

        if connected {
            // Delivered once a handler is attached.
            transport.pending.borrow_mut().push_back(Lifecycle::Connect);
        }
        Ok(transport)
    }

    pub(crate) fn rc(&self) -> Rc<SocketTransport> {
        self.weak_self
            .upgrade()
            .expect("transport used after its last reference was dropped")
    }

    pub(crate) fn flags(&self) -> &Arc<Flags> {
        &self.flags
    }

    pub(crate) fn reactor_inner(&self) -> Option<Rc<ReactorInner>> {
        self.reactor.upgrade()
    }

    pub(crate) fn handler_rc(&self) -> Option<Rc<RefCell<dyn Handler>>> {
        self.handler.borrow().clone()
    }

    pub(crate) fn pending(&self) -> &RefCell<VecDeque<Lifecycle>> {
        &self.pending
    }

    pub(crate) fn in_dispatch(&self) -> &Cell<bool> {
        &self.in_dispatch
    }

    /// Attach the handler lifecycle events are dispatched to. Events that
    /// arrived before a handler existed (such as a synthesized connect) are
    /// delivered now.
    pub fn set_handler(&self, handler: Rc<RefCell<dyn Handler>>) {
        *self.handler.borrow_mut() = Some(handler);
        dispatch::drain(&self.rc());
    }

    /// The reactor this transport is registered with, if it still exists.
    pub fn reactor(&self) -> Option<Reactor> {
        self.reactor.upgrade().map(Reactor::from_inner)
    }

    /// A `Send` handle onto this transport's interest flags, for use inside
    /// interrupt windows.
    pub fn interest_handle(&self) -> InterestHandle {
        InterestHandle {
            flags: Arc::clone(&self.flags),
        }
    }

    fn with_sock<R>(&self, op: impl FnOnce(&Socket) -> io::Result<R>) -> io::Result<R> {
        match &*self.sock.borrow() {
            Some(sock) => op(sock),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) fn interest_changed(&self) {
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.update_interest(self.fd, self.flags.effective_interest());
        }
    }

    /// Interest in read readiness. Setting the current value again is a
    /// no-op and does not touch the reactor.
    pub fn set_readable(&self, readable: bool) {
        if self.flags.readable.swap(readable, Ordering::SeqCst) != readable {
            self.interest_changed();
        }
    }

    pub fn readable(&self) -> bool {
        self.flags.readable()
    }

    /// Interest in write readiness, idempotent like
    /// [`set_readable`](SocketTransport::set_readable). While a connect is
    /// in flight or a sendall drain is pending the reactor watches for write
    /// readiness regardless; this value is the user's own and is what the
    /// getter reports.
    pub fn set_writable(&self, writable: bool) {
        if self.flags.writable.swap(writable, Ordering::SeqCst) != writable {
            self.interest_changed();
        }
    }

    pub fn writable(&self) -> bool {
        self.flags.writable()
    }

    pub fn connected(&self) -> bool {
        self.flags.connected()
    }

    pub fn awaiting_connect(&self) -> bool {
        self.flags.awaiting_connect()
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed()
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.with_sock(|sock| sock.bind(addr))
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        self.with_sock(|sock| sock.set_reuseaddr(reuse))
    }

    /// Start listening. The transport stops looking like a pending connect
    /// and readable events now mean pending connections.
    pub fn listen(&self, backlog: u32) -> io::Result<()> {
        self.with_sock(|sock| sock.listen(backlog))?;
        self.flags.listening.store(true, Ordering::SeqCst);
        if self.flags.awaiting_connect.swap(false, Ordering::SeqCst) {
            self.interest_changed();
        }
        Ok(())
    }

    /// Accept one pending connection; `Ok(None)` when none is queued.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        match self.with_sock(|sock| sock.accept()) {
            Ok(pair) => Ok(Some(pair)),
            Err(ref err) if is_would_block(err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Initiate a non-blocking connect.
    ///
    /// All three outcomes are reported through the handler: immediate
    /// success fires `on_connect`, in-progress latches awaiting-connect and
    /// completes (or fails) on write readiness, and immediate failure fires
    /// `on_connect_failed`. The call itself only fails when the transport no
    /// longer has a socket.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        match self.with_sock(|sock| sock.connect(addr)) {
            Ok(()) => {
                self.flags.mark_connected();
                if self.flags.awaiting_connect.swap(false, Ordering::SeqCst) {
                    self.interest_changed();
                }
                dispatch::deliver(&self.rc(), Lifecycle::Connect);
                Ok(())
            }
            Err(ref err) if is_in_progress(err) => {
                if !self.flags.awaiting_connect.swap(true, Ordering::SeqCst) {
                    self.interest_changed();
                }
                Ok(())
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => {
                Err(io::ErrorKind::NotConnected.into())
            }
            Err(err) => {
                dispatch::connect_failed(&self.rc(), err);
                Ok(())
            }
        }
    }

    /// Clear the awaiting-connect latch. The flag is cleared before the
    /// writer subscription is dropped because backends refresh the whole
    /// mask on unsubscription.
    pub(crate) fn stop_awaiting_connect(&self) {
        if self.flags.awaiting_connect.swap(false, Ordering::SeqCst) {
            self.interest_changed();
        }
    }

    pub(crate) fn take_sock_error(&self) -> Option<io::Error> {
        match self.with_sock(|sock| sock.take_error()) {
            Ok(pending) => pending,
            Err(err) => Some(err),
        }
    }

    /// Raw peek used by the dispatcher's hangup probe.
    pub(crate) fn peek_raw(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_sock(|sock| sock.peek(buf))
    }

    /// Send bytes. Would-block progresses zero bytes; a broken pipe or lost
    /// connection synthesizes a close dispatch and also progresses zero
    /// bytes. Anything else propagates.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        match self.with_sock(|sock| sock.send(data, 0)) {
            Ok(n) => Ok(n),
            Err(ref err) if is_would_block(err) => Ok(0),
            Err(ref err) if is_connection_lost(err) => {
                self.synthesize_close();
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// Receive up to `max` bytes. An empty return means either would-block
    /// or end-of-stream; the latter synthesizes a close dispatch. Reset and
    /// abort conditions also come back empty after synthesizing a close.
    pub fn recv(&self, max: usize) -> io::Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = BytesMut::zeroed(max);
        let n = self.recv_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// [`recv`](SocketTransport::recv) into a caller-supplied buffer.
    pub fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.with_sock(|sock| sock.recv(buf, 0)) {
            Ok(0) => {
                self.synthesize_close();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(ref err) if is_would_block(err) => Ok(0),
            Err(ref err) if is_connection_lost(err) => {
                self.synthesize_close();
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// Look at queued bytes without consuming them, with the same error
    /// mapping as [`recv_into`](SocketTransport::recv_into).
    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.with_sock(|sock| sock.peek(buf)) {
            Ok(0) => {
                self.synthesize_close();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(ref err) if is_would_block(err) => Ok(0),
            Err(ref err) if is_connection_lost(err) => {
                self.synthesize_close();
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    fn synthesize_close(&self) {
        dispatch::deliver(&self.rc(), Lifecycle::Close);
    }

    /// Queue bytes to be written as the socket becomes writable, without
    /// blocking and without the caller tracking partial progress.
    ///
    /// While the buffer is non-empty the reactor watches for write readiness
    /// regardless of the user's `writable` flag, and `on_writable` is
    /// withheld; once the buffer drains, normal write dispatch resumes.
    pub fn sendall(&self, data: &[u8]) {
        let mut buf = self.sendbuf.borrow_mut();
        let was_empty = buf.is_empty();
        buf.extend_from_slice(data);
        let nonempty = !buf.is_empty();
        drop(buf);
        if was_empty && nonempty {
            self.flags.sendall_pending.store(true, Ordering::SeqCst);
            self.interest_changed();
        }
    }

    pub(crate) fn has_sendall_data(&self) -> bool {
        !self.sendbuf.borrow().is_empty()
    }

    /// Push buffered sendall bytes out. Returns whether the buffer drained.
    pub(crate) fn flush_sendall(&self) -> io::Result<bool> {
        let mut buf = self.sendbuf.borrow_mut();
        while !buf.is_empty() {
            let n = self.send(buf.chunk())?;
            if n == 0 {
                break;
            }
            buf.advance(n);
        }
        let drained = buf.is_empty();
        drop(buf);
        if drained && self.flags.sendall_pending.swap(false, Ordering::SeqCst) {
            self.interest_changed();
        }
        Ok(drained)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.with_sock(|sock| sock.local_addr())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.with_sock(|sock| sock.peer_addr())
    }

    /// Deregister from the reactor, close the file descriptor and fire
    /// `on_cleanup` exactly once. Idempotent.
    pub fn close(&self) {
        if self.flags.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("closing transport fd={}", self.fd);
        // The registry may hold the last strong reference; keep the
        // transport alive through its own teardown.
        let this = self.weak_self.upgrade();
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.remove_transport(self.fd);
        }
        self.sock.borrow_mut().take();
        if let Some(this) = this {
            dispatch::deliver(&this, Lifecycle::Cleanup);
        }
    }
}

impl AsRawFd for SocketTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SocketTransport")
            .field("fd", &self.fd)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Sink for SocketTransport {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        SocketTransport::send(self, data)
    }
}

impl Source for SocketTransport {
    fn recv(&self, max: usize) -> io::Result<Bytes> {
        SocketTransport::recv(self, max)
    }

    fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        SocketTransport::recv_into(self, buf)
    }
}
