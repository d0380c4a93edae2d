// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use evio::{Backend, Handler, Reactor, SocketTransport};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// A reactor per available backend, the way the suite exercises every
/// demultiplexer the platform offers.
pub fn reactors() -> Vec<Reactor> {
    init();
    Backend::available()
        .iter()
        .map(|&backend| {
            Reactor::with_backend(backend)
                .unwrap_or_else(|err| panic!("creating {:?} reactor: {}", backend, err))
        })
        .collect()
}

/// Poll `reactor` until `done()` or the deadline passes.
pub fn poll_until(reactor: &Reactor, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        reactor
            .poll(Some(Duration::from_millis(100)))
            .expect("unable to poll");
    }
}

pub fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Creates a bound, listening transport on an ephemeral localhost port.
pub fn listener(reactor: &Reactor) -> (Rc<SocketTransport>, SocketAddr) {
    let listener = SocketTransport::new(reactor).expect("creating listener transport");
    listener.set_reuseaddr(true).expect("setting reuseaddr");
    listener.bind(any_local_address()).expect("binding");
    listener.listen(16).expect("listening");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// Event-counting handler used by the lifecycle tests.
#[derive(Debug, Default)]
pub struct Counts {
    pub readable: usize,
    pub writable: usize,
    pub connect: usize,
    pub connect_failed: usize,
    pub close: usize,
    pub cleanup: usize,
    pub errors: usize,
    pub last_connect_error: Option<io::ErrorKind>,
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub counts: Rc<RefCell<Counts>>,
}

impl Recorder {
    pub fn new() -> (Recorder, Rc<RefCell<Counts>>) {
        let counts = Rc::new(RefCell::new(Counts::default()));
        (
            Recorder {
                counts: Rc::clone(&counts),
            },
            counts,
        )
    }
}

impl Handler for Recorder {
    fn on_readable(&mut self, _: &SocketTransport) -> io::Result<()> {
        self.counts.borrow_mut().readable += 1;
        Ok(())
    }

    fn on_writable(&mut self, _: &SocketTransport) -> io::Result<()> {
        self.counts.borrow_mut().writable += 1;
        Ok(())
    }

    fn on_connect(&mut self, _: &SocketTransport) -> io::Result<()> {
        self.counts.borrow_mut().connect += 1;
        Ok(())
    }

    fn on_connect_failed(&mut self, _: &SocketTransport, err: io::Error) -> io::Result<()> {
        let mut counts = self.counts.borrow_mut();
        counts.connect_failed += 1;
        counts.last_connect_error = Some(err.kind());
        Ok(())
    }

    fn on_close(&mut self, _: &SocketTransport) -> io::Result<()> {
        self.counts.borrow_mut().close += 1;
        Ok(())
    }

    fn on_cleanup(&mut self, _: &SocketTransport) {
        self.counts.borrow_mut().cleanup += 1;
    }

    fn on_error(&mut self, _: &SocketTransport, _: io::Error) {
        self.counts.borrow_mut().errors += 1;
    }
}
