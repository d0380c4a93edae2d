use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{trace, warn};

use crate::dispatch;
use crate::error::{Error, Result};
use crate::net::{socket_pair, Socket};
use crate::sys::{self, Selector};
use crate::transport::SocketTransport;
use crate::{Events, Interest};

/// How much concurrency abuse a backend tolerates.
///
/// Fragile backends require the full interrupt handshake for any
/// cross-thread mutation; robust and rock-solid backends pick up flag
/// changes from a plain refresh wake without pausing the reactor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Grade {
    Fragile,
    Robust,
    RockSolid,
}

/// The event-demultiplexing primitive a [`Reactor`] runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Select,
    Poll,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll,
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue,
}

impl Backend {
    /// Every backend this platform offers, in ascending order of grade.
    pub fn available() -> &'static [Backend] {
        &[
            Backend::Select,
            Backend::Poll,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll,
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue,
        ]
    }

    fn create(self) -> io::Result<Box<dyn Selector>> {
        match self {
            Backend::Select => Ok(Box::new(sys::SelectSelector::new()?)),
            Backend::Poll => Ok(Box::new(sys::PollSelector::new()?)),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll => Ok(Box::new(sys::EpollSelector::new()?)),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue => Ok(Box::new(sys::KqueueSelector::new()?)),
        }
    }

    fn best() -> Backend {
        *Backend::available().last().unwrap_or(&Backend::Poll)
    }
}

// Control channel bytes. External threads write to the sender half, the
// reactor reads from the receiver half and writes acknowledgements back.
const CTRL_START: u8 = b's';
const CTRL_END: u8 = b'e';
const CTRL_ACK: u8 = b'i';
const CTRL_REFRESH: u8 = b'f';
const CTRL_CALL: u8 = b'c';

pub(crate) type InjectPayload =
    std::result::Result<Box<dyn Any + Send>, Box<dyn std::error::Error + Send + Sync>>;

type Job = Box<dyn FnOnce() + Send>;

/// State shared with foreign threads through [`Waker`] handles.
struct Shared {
    control_tx: Socket,
    grade: Grade,
    closed: AtomicBool,
    jobs: Mutex<Vec<Job>>,
    injected: Mutex<Vec<(u64, InjectPayload)>>,
    // Serializes scoped interrupt windows.
    handshake: Mutex<()>,
}

impl Shared {
    fn send_byte(&self, byte: u8) -> io::Result<()> {
        loop {
            match self.control_tx.send(&[byte], 0) {
                Ok(_) => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn recv_byte(&self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        loop {
            match self.control_tx.recv(&mut buf, 0) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => return Ok(buf[0]),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) struct Inner {
    selector: Box<dyn Selector>,
    transports: RefCell<HashMap<RawFd, Rc<SocketTransport>>>,
    scratch: RefCell<Events>,
    control_rx: Socket,
    shared: Arc<Shared>,
    closed: Cell<bool>,
    refresh: Cell<bool>,
    parked: RefCell<Vec<Rc<SocketTransport>>>,
    waiters: RefCell<HashMap<u64, Box<dyn FnOnce(InjectPayload)>>>,
    next_token: Cell<u64>,
}

impl Inner {
    /// Register a transport; fails if the fd is already present.
    pub(crate) fn register_transport(&self, transport: Rc<SocketTransport>) -> Result<()> {
        if self.closed.get() {
            return Err(Error::ReactorClosed);
        }
        let fd = transport.as_raw_fd();
        let mut transports = self.transports.borrow_mut();
        if transports.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        self.selector
            .register(fd, transport.flags().effective_interest())?;
        trace!("registered transport fd={}", fd);
        transports.insert(fd, transport);
        Ok(())
    }

    /// Idempotent removal; the transport's fd is left open.
    pub(crate) fn remove_transport(&self, fd: RawFd) {
        if self.transports.borrow_mut().remove(&fd).is_some() {
            trace!("deregistered transport fd={}", fd);
            if let Err(err) = self.selector.deregister(fd) {
                trace!("deregistering fd={} from backend failed: {}", fd, err);
            }
        }
    }

    pub(crate) fn update_interest(&self, fd: RawFd, interest: Interest) {
        if self.closed.get() || !self.transports.borrow().contains_key(&fd) {
            return;
        }
        if let Err(err) = self.selector.reregister(fd, interest) {
            warn!("updating interest for fd={} failed: {}", fd, err);
        }
    }

    /// Remember a transport whose handler was busy; the reactor retries the
    /// drain at the end of the poll cycle.
    pub(crate) fn park_for_drain(&self, transport: Rc<SocketTransport>) {
        self.parked.borrow_mut().push(transport);
    }

    fn control_fd(&self) -> RawFd {
        self.control_rx.as_raw_fd()
    }

    fn recv_control_byte(&self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        loop {
            match self.control_rx.recv(&mut buf, 0) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => return Ok(buf[0]),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// The interrupt handshake, reactor side: the `'s'` byte has been read,
    /// acknowledge it and park until the mutator sends `'e'`.
    fn serve_interrupt(&self) {
        if let Err(err) = self.control_rx.send(&[CTRL_ACK], 0) {
            warn!("interrupt ack failed: {}", err);
            return;
        }
        loop {
            match self.recv_control_byte() {
                Ok(CTRL_END) => break,
                Ok(CTRL_REFRESH) => self.refresh.set(true),
                Ok(_) => continue,
                Err(err) => {
                    warn!("interrupt wait failed: {}", err);
                    break;
                }
            }
        }
        // The mutator may have changed any flag while we were parked.
        self.refresh.set(true);
    }

    fn refresh_interests(&self) {
        let transports: Vec<_> = self
            .transports
            .borrow()
            .iter()
            .map(|(&fd, t)| (fd, Rc::clone(t)))
            .collect();
        for (fd, transport) in transports {
            if let Err(err) = self
                .selector
                .reregister(fd, transport.flags().effective_interest())
            {
                warn!("refreshing interest for fd={} failed: {}", fd, err);
            }
        }
    }

    fn run_jobs(&self) {
        let jobs = mem::take(&mut *self.shared.jobs.lock().unwrap());
        for job in jobs {
            job();
        }
        let injected = mem::take(&mut *self.shared.injected.lock().unwrap());
        for (token, payload) in injected {
            if let Some(waiter) = self.waiters.borrow_mut().remove(&token) {
                waiter(payload);
            }
        }
    }

    fn drain_parked(&self) {
        let parked = mem::take(&mut *self.parked.borrow_mut());
        for transport in parked {
            dispatch::drain(&transport);
        }
    }

    pub(crate) fn register_waiter(&self, waiter: Box<dyn FnOnce(InjectPayload)>) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.waiters.borrow_mut().insert(token, waiter);
        token
    }
}

/// The single-threaded readiness loop.
///
/// A reactor owns one backend selector, a registry of transports keyed by
/// file descriptor and an internal wake-up socket pair. `Reactor` handles
/// are cheap clones of the same loop; the type is deliberately `!Send` —
/// foreign threads interact through [`Waker`].
#[derive(Clone)]
pub struct Reactor {
    pub(crate) inner: Rc<Inner>,
}

impl Reactor {
    /// A reactor on the best backend the platform offers.
    pub fn new() -> Result<Reactor> {
        Reactor::with_backend(Backend::best())
    }

    /// A reactor on an explicitly chosen backend.
    pub fn with_backend(backend: Backend) -> Result<Reactor> {
        Reactor::from_selector(backend.create()?)
    }

    pub(crate) fn from_selector(selector: Box<dyn Selector>) -> Result<Reactor> {
        let (control_rx, control_tx) = socket_pair()?;
        selector.register(control_rx.as_raw_fd(), Interest::READABLE)?;
        let grade = selector.grade();
        Ok(Reactor {
            inner: Rc::new(Inner {
                selector,
                transports: RefCell::new(HashMap::new()),
                scratch: RefCell::new(Events::default()),
                control_rx,
                shared: Arc::new(Shared {
                    control_tx,
                    grade,
                    closed: AtomicBool::new(false),
                    jobs: Mutex::new(Vec::new()),
                    injected: Mutex::new(Vec::new()),
                    handshake: Mutex::new(()),
                }),
                closed: Cell::new(false),
                refresh: Cell::new(false),
                parked: RefCell::new(Vec::new()),
                waiters: RefCell::new(HashMap::new()),
                next_token: Cell::new(0),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Rc<Inner>) -> Reactor {
        Reactor { inner }
    }

    /// The grade of the underlying backend.
    pub fn grade(&self) -> Grade {
        self.inner.shared.grade
    }

    /// A `Send + Sync` handle for waking, synchronized calls and the
    /// interrupt protocol.
    pub fn waker(&self) -> Waker {
        Waker {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Register a reactor-thread continuation for a cross-thread result;
    /// the returned token pairs with [`Waker::inject`].
    pub(crate) fn register_injection(&self, waiter: Box<dyn FnOnce(InjectPayload)>) -> u64 {
        self.inner.register_waiter(waiter)
    }

    /// Idempotent removal of a transport from the registry. The fd stays
    /// open; this is the counterpart of registration at construction.
    pub fn del_transport(&self, transport: &SocketTransport) {
        self.inner.remove_transport(transport.as_raw_fd());
    }

    /// Schedule `job` to run on the reactor thread within one poll cycle.
    pub fn call_synchronized(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.waker().call_synchronized(job)
    }

    /// Block up to `timeout` (`None`: indefinitely) and dispatch every ready
    /// event before returning. `EINTR` returns without dispatching.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.get() {
            return Err(Error::ReactorClosed);
        }

        let mut events = inner.scratch.take();
        let selected = inner.selector.select(&mut events, timeout);
        let outcome = match selected {
            Ok(()) => self.dispatch_batch(&events),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(Error::Io(err)),
        };
        *inner.scratch.borrow_mut() = events;
        outcome?;

        inner.run_jobs();
        inner.drain_parked();
        if inner.refresh.replace(false) && !inner.closed.get() {
            inner.refresh_interests();
        }
        Ok(())
    }

    fn dispatch_batch(&self, events: &Events) -> Result<()> {
        let inner = &self.inner;
        let mut interrupted = false;
        let wants_hup_peek = inner.selector.wants_hup_peek();

        for event in events {
            if event.fd() == inner.control_fd() {
                if !event.is_readable() {
                    continue;
                }
                match inner.recv_control_byte() {
                    Ok(CTRL_START) => interrupted = true,
                    Ok(CTRL_REFRESH) => inner.refresh.set(true),
                    Ok(CTRL_CALL) => {}
                    Ok(_) => {}
                    Err(err) => warn!("control channel read failed: {}", err),
                }
                continue;
            }

            let transport = inner.transports.borrow().get(&event.fd()).cloned();
            if let Some(transport) = transport {
                dispatch::dispatch_event(&transport, event, wants_hup_peek);
            }
        }

        if interrupted {
            inner.serve_interrupt();
        }
        Ok(())
    }

    /// Loop [`poll`](Reactor::poll) until the reactor is closed. A close
    /// from within a handler ends the loop with `Ok(())`; any other error
    /// propagates.
    pub fn run(&self) -> Result<()> {
        loop {
            match self.poll(None) {
                Ok(()) => {
                    if self.inner.closed.get() {
                        return Ok(());
                    }
                }
                Err(err) if err.is_closed() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the reactor: every registered transport gets its `on_cleanup`
    /// exactly once (their fds stay open), the registry empties, and
    /// subsequent polls fail with [`Error::ReactorClosed`]. A thread parked
    /// mid-handshake is released.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.replace(true) {
            return;
        }
        inner.shared.closed.store(true, Ordering::SeqCst);
        if let Err(err) = inner.control_rx.send(&[CTRL_ACK], 0) {
            trace!("control release on close failed: {}", err);
        }

        let transports: Vec<_> = inner.transports.borrow_mut().drain().collect();
        for (fd, transport) in transports {
            if let Err(err) = inner.selector.deregister(fd) {
                trace!("deregistering fd={} on close failed: {}", fd, err);
            }
            dispatch::deliver(&transport, dispatch::Lifecycle::Cleanup);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Reactor")
            .field("grade", &self.inner.shared.grade)
            .field("transports", &self.inner.transports.borrow().len())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// Cross-thread handle to a [`Reactor`].
///
/// Cloneable, `Send` and `Sync`. Wakes the reactor, schedules synchronized
/// calls, and drives the interrupt protocol that lets a foreign thread
/// mutate transport flags while the reactor is parked (or, on robust and
/// rock-solid backends with `change_flags`, without parking it at all).
#[derive(Clone)]
pub struct Waker {
    shared: Arc<Shared>,
}

impl Waker {
    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(Error::ReactorClosed)
        } else {
            Ok(())
        }
    }

    /// Wake the reactor out of its current poll.
    pub fn wake(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.send_byte(CTRL_CALL)?;
        Ok(())
    }

    /// Schedule `job` to run on the reactor thread the next time it wakes.
    pub fn call_synchronized(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.ensure_open()?;
        self.shared.jobs.lock().unwrap().push(Box::new(job));
        self.shared.send_byte(CTRL_CALL)?;
        Ok(())
    }

    pub(crate) fn inject(&self, token: u64, payload: InjectPayload) -> Result<()> {
        self.ensure_open()?;
        self.shared.injected.lock().unwrap().push((token, payload));
        self.shared.send_byte(CTRL_CALL)?;
        Ok(())
    }

    /// Begin an interrupt window. With `change_flags` on a robust or
    /// rock-solid backend this is free; otherwise the full handshake runs
    /// and the reactor is parked between polls when this returns.
    pub fn start_interrupt(&self, change_flags: bool) -> Result<()> {
        self.ensure_open()?;
        if change_flags && self.shared.grade != Grade::Fragile {
            return Ok(());
        }
        self.shared.send_byte(CTRL_START)?;
        // Blocks until the reactor acknowledges it is parked ('i'). A close
        // releases us with the same byte.
        self.shared.recv_byte()?;
        Ok(())
    }

    /// End an interrupt window; the reactor resumes and re-derives every
    /// interest mask from the transport flags.
    pub fn end_interrupt(&self, change_flags: bool) -> Result<()> {
        if change_flags && self.shared.grade != Grade::Fragile {
            self.ensure_open()?;
            self.shared.send_byte(CTRL_REFRESH)?;
            return Ok(());
        }
        self.shared.send_byte(CTRL_END)?;
        Ok(())
    }

    /// Run `mutate` inside an interrupt window. Windows are serialized
    /// against each other.
    pub fn interrupt<R>(&self, change_flags: bool, mutate: impl FnOnce() -> R) -> Result<R> {
        let _window = self.shared.handshake.lock().unwrap();
        self.start_interrupt(change_flags)?;
        let result = mutate();
        self.end_interrupt(change_flags)?;
        Ok(result)
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Waker")
            .field("grade", &self.shared.grade)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    /// Selector double that counts interest rewrites.
    #[derive(Debug, Default)]
    struct CountingSelector {
        reregisters: StdCell<usize>,
    }

    impl Selector for CountingSelector {
        fn register(&self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
            self.reregisters.set(self.reregisters.get() + 1);
            Ok(())
        }

        fn deregister(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }

        fn select(&self, _events: &mut Events, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn grade(&self) -> Grade {
            Grade::Robust
        }
    }

    fn counting_reactor() -> (Reactor, Rc<CountingSelector>) {
        // The selector is boxed by the reactor; keep a second handle for
        // assertions via Rc.
        #[derive(Debug)]
        struct Shim(Rc<CountingSelector>);
        impl Selector for Shim {
            fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
                self.0.register(fd, interest)
            }
            fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
                self.0.reregister(fd, interest)
            }
            fn deregister(&self, fd: RawFd) -> io::Result<()> {
                self.0.deregister(fd)
            }
            fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
                self.0.select(events, timeout)
            }
            fn grade(&self) -> Grade {
                self.0.grade()
            }
        }
        let counter = Rc::new(CountingSelector::default());
        let reactor = Reactor::from_selector(Box::new(Shim(Rc::clone(&counter)))).unwrap();
        (reactor, counter)
    }

    #[test]
    fn interest_setters_are_idempotent() {
        let (reactor, counter) = counting_reactor();
        let transport = SocketTransport::new(&reactor).unwrap();

        let baseline = counter.reregisters.get();
        transport.set_readable(true);
        transport.set_readable(true);
        assert_eq!(counter.reregisters.get(), baseline + 1);

        transport.set_writable(true);
        transport.set_writable(true);
        transport.set_writable(true);
        assert_eq!(counter.reregisters.get(), baseline + 2);

        transport.set_readable(false);
        assert_eq!(counter.reregisters.get(), baseline + 3);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (reactor, _) = counting_reactor();
        let transport = SocketTransport::new(&reactor).unwrap();
        let err = reactor
            .inner
            .register_transport(transport.rc())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(fd) if fd == transport.as_raw_fd()));
    }

    #[test]
    fn poll_after_close_fails() {
        let (reactor, _) = counting_reactor();
        reactor.close();
        assert!(matches!(
            reactor.poll(Some(Duration::from_millis(1))),
            Err(Error::ReactorClosed)
        ));
    }
}
