//! Composable I/O elements: lazy byte producers and consumers.
//!
//! An [`Input`] emits bytes into a [`Sink`] across multiple write-readiness
//! events; a [`Collector`] absorbs bytes from a [`Source`] across read
//! events. Both compose: queues concatenate elements (`a + b`), factories
//! generate them on demand, and delimiters bound them, so a streaming wire
//! format can be described declaratively instead of as a hand-written state
//! machine.
//!
//! Every element has idempotent `close` semantics with an optional
//! once-only `on_close` callback, and a lazy `init` that runs before the
//! first byte moves.

use std::cell::RefCell;
use std::io;

use bytes::{Buf, Bytes, BytesMut};

mod collector;
mod handler;
mod input;
mod layout;

pub use self::collector::{
    ByteArrayCollector, Collector, CollectorQueue, DelimitedCollector, FactoryCollector,
    FileCollector, KeepingCollectorQueue, StringCollector, StructCollector,
};
pub use self::handler::ElementHandler;
pub use self::input::{AutoFileInput, FactoryInput, FileInput, Input, InputQueue, StringInput};
pub use self::layout::{decode, encode, Layout};

/// What a single element step achieved.
///
/// `done` means the element will move no further bytes; `bytes` is how many
/// moved this step (possibly zero, e.g. on would-block).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub done: bool,
    pub bytes: usize,
}

impl Progress {
    pub(crate) fn new(done: bool, bytes: usize) -> Progress {
        Progress { done, bytes }
    }
}

/// Anything an [`Input`] can push bytes into.
///
/// A short write is normal; zero means try again on the next readiness
/// event.
pub trait Sink {
    fn send(&self, data: &[u8]) -> io::Result<usize>;
}

/// Anything a [`Collector`] can pull bytes from.
///
/// An empty return means no bytes are available right now (or the stream
/// ended; transports synthesize their own close dispatch for that).
pub trait Source {
    fn recv(&self, max: usize) -> io::Result<Bytes>;

    /// Receive directly into a caller buffer, avoiding the intermediate
    /// allocation.
    fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// In-memory stand-in for a transport: sends append to an output buffer,
/// receives drain an input buffer.
///
/// Useful for exercising element pipelines without sockets, exactly like a
/// loopback-connected transport that never blocks.
#[derive(Debug, Default)]
pub struct MockTransport {
    inbuf: RefCell<BytesMut>,
    outbuf: RefCell<BytesMut>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    pub fn with_input(input: impl AsRef<[u8]>) -> MockTransport {
        let mock = MockTransport::new();
        mock.push_input(input);
        mock
    }

    /// Append bytes for later `recv` calls.
    pub fn push_input(&self, input: impl AsRef<[u8]>) {
        self.inbuf.borrow_mut().extend_from_slice(input.as_ref());
    }

    /// Everything sent so far.
    pub fn output(&self) -> Bytes {
        Bytes::copy_from_slice(&self.outbuf.borrow()[..])
    }

    /// Bytes not yet consumed by `recv`.
    pub fn remaining_input(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inbuf.borrow()[..])
    }
}

impl Sink for MockTransport {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.outbuf.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }
}

impl Source for MockTransport {
    fn recv(&self, max: usize) -> io::Result<Bytes> {
        let mut inbuf = self.inbuf.borrow_mut();
        let n = max.min(inbuf.len());
        Ok(inbuf.split_to(n).freeze())
    }

    fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbuf = self.inbuf.borrow_mut();
        let n = buf.len().min(inbuf.len());
        buf[..n].copy_from_slice(&inbuf[..n]);
        inbuf.advance(n);
        Ok(n)
    }
}

/// Shared `inited`/`closed` bookkeeping for elements.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ElementState {
    pub(crate) inited: bool,
    pub(crate) closed: bool,
}
