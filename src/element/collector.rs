use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::ops;

use bytes::{Bytes, BytesMut};

use crate::element::{ElementState, Layout, Progress, Source};

/// A lazy byte consumer, the dual of [`Input`](crate::element::Input).
///
/// `add_data` pulls at most `max` bytes from the source and reports
/// progress; `done` means the collector is full and has closed itself.
/// `close` is idempotent and fires the collector's `on_close` callback
/// exactly once; compositions propagate it to every contained element.
pub trait Collector {
    /// Consume up to `max` bytes from `source`.
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress>;

    /// Close the collector, firing its `on_close` callback exactly once.
    fn close(&mut self);

    /// Downcasting access, for pulling typed values back out of
    /// heterogeneous compositions like [`KeepingCollectorQueue`].
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Collector {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Collector")
    }
}

/// `a + b` concatenates any two boxed collectors into a queue.
impl ops::Add for Box<dyn Collector> {
    type Output = Box<dyn Collector>;

    fn add(self, other: Box<dyn Collector>) -> Box<dyn Collector> {
        let mut queue = CollectorQueue::new();
        queue.push(self);
        queue.push(other);
        Box::new(queue)
    }
}

/// Accumulates everything it is fed into memory. Never reports done on its
/// own; bound it with a [`DelimitedCollector`] when the size is known.
pub struct StringCollector {
    state: ElementState,
    value: BytesMut,
    on_close: Option<Box<dyn FnOnce(&mut StringCollector)>>,
}

impl StringCollector {
    pub fn new() -> StringCollector {
        StringCollector {
            state: ElementState::default(),
            value: BytesMut::new(),
            on_close: None,
        }
    }

    pub fn on_close(
        mut self,
        callback: impl FnOnce(&mut StringCollector) + 'static,
    ) -> StringCollector {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// The bytes collected so far.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Bytes {
        self.value.freeze()
    }
}

impl Default for StringCollector {
    fn default() -> StringCollector {
        StringCollector::new()
    }
}

impl Collector for StringCollector {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        let received = source.recv(max)?;
        self.value.extend_from_slice(&received);
        Ok(Progress::new(false, received.len()))
    }

    fn close(&mut self) {
        if self.state.closed {
            return;
        }
        if let Some(callback) = self.on_close.take() {
            callback(self);
        }
        self.state.closed = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for StringCollector {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("StringCollector")
            .field("collected", &self.value.len())
            .field("closed", &self.state.closed)
            .finish()
    }
}

/// Writes everything it is fed into a file.
pub struct FileCollector {
    state: ElementState,
    file: Option<File>,
    closing: bool,
    autoflush: bool,
    on_close: Option<Box<dyn FnOnce(&mut FileCollector)>>,
}

impl FileCollector {
    /// `closing` controls whether `close` drops the file handle;
    /// `autoflush` flushes after every chunk so the on-disk size tracks the
    /// consumed byte count exactly.
    pub fn new(file: File, closing: bool, autoflush: bool) -> FileCollector {
        FileCollector {
            state: ElementState::default(),
            file: Some(file),
            closing,
            autoflush,
            on_close: None,
        }
    }

    pub fn on_close(
        mut self,
        callback: impl FnOnce(&mut FileCollector) + 'static,
    ) -> FileCollector {
        self.on_close = Some(Box::new(callback));
        self
    }

    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn into_file(self) -> Option<File> {
        self.file
    }
}

impl Collector for FileCollector {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        let received = source.recv(max)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        // A short or failed write must propagate, not vanish.
        file.write_all(&received)?;
        if self.autoflush {
            file.flush()?;
        }
        Ok(Progress::new(false, received.len()))
    }

    fn close(&mut self) {
        if self.state.closed {
            return;
        }
        if let Some(callback) = self.on_close.take() {
            callback(self);
        }
        if self.closing {
            self.file.take();
        }
        self.state.closed = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for FileCollector {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("FileCollector")
            .field("closing", &self.closing)
            .field("autoflush", &self.autoflush)
            .field("closed", &self.state.closed)
            .finish()
    }
}

/// Forwards exactly `size` bytes to the wrapped collector, then is full.
/// Residual bytes stay in the source regardless of its chunking.
pub struct DelimitedCollector<C> {
    state: ElementState,
    inner: C,
    remaining: usize,
    on_close: Option<Box<dyn FnOnce(&mut DelimitedCollector<C>)>>,
}

impl<C: Collector> DelimitedCollector<C> {
    pub fn new(inner: C, size: usize) -> DelimitedCollector<C> {
        DelimitedCollector {
            state: ElementState::default(),
            inner,
            remaining: size,
            on_close: None,
        }
    }

    pub fn on_close(
        mut self,
        callback: impl FnOnce(&mut DelimitedCollector<C>) + 'static,
    ) -> DelimitedCollector<C> {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// Bytes still to forward before the collector is full.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// The wrapped collector, where the value accumulates.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: Collector + 'static> Collector for DelimitedCollector<C> {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        let progress = self.inner.add_data(source, self.remaining.min(max))?;
        self.remaining -= progress.bytes.min(self.remaining);
        if self.remaining == 0 {
            self.close();
        }
        Ok(Progress::new(self.remaining == 0, progress.bytes))
    }

    fn close(&mut self) {
        if self.state.closed {
            return;
        }
        if let Some(callback) = self.on_close.take() {
            callback(self);
        }
        self.inner.close();
        self.state.closed = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<C: fmt::Debug> fmt::Debug for DelimitedCollector<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("DelimitedCollector")
            .field("inner", &self.inner)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Collects into a fixed-size byte buffer with `recv_into`, avoiding the
/// intermediate copy; full when the buffer is.
pub struct ByteArrayCollector {
    state: ElementState,
    buf: Box<[u8]>,
    filled: usize,
    on_close: Option<Box<dyn FnOnce(&mut ByteArrayCollector)>>,
}

impl ByteArrayCollector {
    pub fn new(size: usize) -> ByteArrayCollector {
        ByteArrayCollector {
            state: ElementState::default(),
            buf: vec![0u8; size].into_boxed_slice(),
            filled: 0,
            on_close: None,
        }
    }

    pub fn on_close(
        mut self,
        callback: impl FnOnce(&mut ByteArrayCollector) + 'static,
    ) -> ByteArrayCollector {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// The filled prefix of the buffer.
    pub fn value(&self) -> &[u8] {
        &self.buf[..self.filled]
    }
}

impl Collector for ByteArrayCollector {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        let want = max.min(self.buf.len() - self.filled);
        let n = source.recv_into(&mut self.buf[self.filled..self.filled + want])?;
        self.filled += n;

        let full = self.filled == self.buf.len();
        if full {
            self.close();
        }
        Ok(Progress::new(full, n))
    }

    fn close(&mut self) {
        if self.state.closed {
            return;
        }
        if let Some(callback) = self.on_close.take() {
            callback(self);
        }
        self.state.closed = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ByteArrayCollector {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ByteArrayCollector")
            .field("filled", &self.filled)
            .field("size", &self.buf.len())
            .finish()
    }
}

/// Feeds the head collector until it is full, discards it and advances.
///
/// Full when the last collector reports full and the `full` hook (if any)
/// returns false; a true return suppresses the queue's own fullness so more
/// collectors can be appended.
pub struct CollectorQueue {
    state: ElementState,
    collectors: VecDeque<Box<dyn Collector>>,
    keep_finished: bool,
    finished: Vec<Box<dyn Collector>>,
    full_hook: Option<Box<dyn FnMut() -> bool>>,
    on_close: Option<Box<dyn FnOnce(&mut CollectorQueue)>>,
}

impl CollectorQueue {
    pub fn new() -> CollectorQueue {
        CollectorQueue {
            state: ElementState::default(),
            collectors: VecDeque::new(),
            keep_finished: false,
            finished: Vec::new(),
            full_hook: None,
            on_close: None,
        }
    }

    /// Runs after the last collector completes; returning true keeps the
    /// queue open.
    pub fn full_hook(mut self, hook: impl FnMut() -> bool + 'static) -> CollectorQueue {
        self.full_hook = Some(Box::new(hook));
        self
    }

    pub fn on_close(
        mut self,
        callback: impl FnOnce(&mut CollectorQueue) + 'static,
    ) -> CollectorQueue {
        self.on_close = Some(Box::new(callback));
        self
    }

    pub fn push(&mut self, collector: Box<dyn Collector>) {
        self.collectors.push_back(collector);
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    fn finish_collector(&mut self, collector: Box<dyn Collector>) {
        if self.keep_finished {
            self.finished.push(collector);
        }
    }
}

impl Default for CollectorQueue {
    fn default() -> CollectorQueue {
        CollectorQueue::new()
    }
}

impl Collector for CollectorQueue {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        loop {
            let Some(head) = self.collectors.front_mut() else {
                self.close();
                return Ok(Progress::new(true, 0));
            };
            let progress = head.add_data(source, max)?;
            if progress.done {
                let done = self.collectors.pop_front().expect("head exists");
                self.finish_collector(done);
                if self.collectors.is_empty() {
                    let keep_open = match self.full_hook.as_mut() {
                        Some(hook) => hook(),
                        None => false,
                    };
                    if !keep_open {
                        self.close();
                        return Ok(Progress::new(true, progress.bytes));
                    }
                    return Ok(Progress::new(false, progress.bytes));
                }
            }
            if progress.bytes > 0 {
                return Ok(Progress::new(false, progress.bytes));
            }
        }
    }

    fn close(&mut self) {
        if self.state.closed {
            return;
        }
        if let Some(callback) = self.on_close.take() {
            callback(self);
        }
        for collector in self.collectors.iter_mut() {
            collector.close();
        }
        self.state.closed = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ops::Add<Box<dyn Collector>> for CollectorQueue {
    type Output = CollectorQueue;

    fn add(mut self, other: Box<dyn Collector>) -> CollectorQueue {
        self.push(other);
        self
    }
}

impl fmt::Debug for CollectorQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CollectorQueue")
            .field("queued", &self.collectors.len())
            .field("finished", &self.finished.len())
            .field("closed", &self.state.closed)
            .finish()
    }
}

/// [`CollectorQueue`] that retains finished collectors for later
/// inspection instead of discarding them.
pub struct KeepingCollectorQueue {
    queue: CollectorQueue,
}

impl KeepingCollectorQueue {
    pub fn new() -> KeepingCollectorQueue {
        let mut queue = CollectorQueue::new();
        queue.keep_finished = true;
        KeepingCollectorQueue { queue }
    }

    pub fn push(&mut self, collector: Box<dyn Collector>) {
        self.queue.push(collector);
    }

    /// Finished collectors, in completion order. Use
    /// [`Collector::as_any`] to get the concrete types back.
    pub fn collected(&self) -> &[Box<dyn Collector>] {
        &self.queue.finished
    }

    pub fn into_collected(self) -> Vec<Box<dyn Collector>> {
        self.queue.finished
    }
}

impl Default for KeepingCollectorQueue {
    fn default() -> KeepingCollectorQueue {
        KeepingCollectorQueue::new()
    }
}

impl Collector for KeepingCollectorQueue {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        self.queue.add_data(source, max)
    }

    fn close(&mut self) {
        self.queue.close();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for KeepingCollectorQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("KeepingCollectorQueue")
            .field("queue", &self.queue)
            .finish()
    }
}

/// Obtains each successive collector from a factory; the factory returning
/// `None` marks end-of-stream.
pub struct FactoryCollector {
    state: ElementState,
    factory: Box<dyn FnMut() -> Option<Box<dyn Collector>>>,
    current: Option<Box<dyn Collector>>,
}

impl FactoryCollector {
    pub fn new(factory: impl FnMut() -> Option<Box<dyn Collector>> + 'static) -> FactoryCollector {
        FactoryCollector {
            state: ElementState::default(),
            factory: Box::new(factory),
            current: None,
        }
    }

    /// Drive the factory from any iterator of collectors.
    pub fn from_iter<I>(collectors: I) -> FactoryCollector
    where
        I: IntoIterator<Item = Box<dyn Collector>>,
        I::IntoIter: 'static,
    {
        let mut iter = collectors.into_iter();
        FactoryCollector::new(move || iter.next())
    }
}

impl Collector for FactoryCollector {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        if !self.state.inited {
            self.state.inited = true;
            self.current = (self.factory)();
        }

        loop {
            let Some(current) = self.current.as_mut() else {
                self.close();
                return Ok(Progress::new(true, 0));
            };
            let progress = current.add_data(source, max)?;
            if progress.done {
                self.current = (self.factory)();
                if self.current.is_none() {
                    self.close();
                    return Ok(Progress::new(true, progress.bytes));
                }
            }
            if progress.bytes > 0 {
                return Ok(Progress::new(false, progress.bytes));
            }
        }
    }

    fn close(&mut self) {
        if self.state.closed {
            return;
        }
        if let Some(current) = self.current.as_mut() {
            current.close();
        }
        self.state.closed = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for FactoryCollector {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("FactoryCollector")
            .field("active", &self.current.is_some())
            .field("closed", &self.state.closed)
            .finish()
    }
}

/// Collects exactly `L::SIZE` bytes and decodes them as the layout `L` on
/// close; the decoded value is available from `value` and inside the
/// `on_close` callback.
pub struct StructCollector<L: Layout> {
    inner: DelimitedCollector<StringCollector>,
    value: Option<L>,
    on_close: Option<Box<dyn FnOnce(&mut StructCollector<L>)>>,
}

impl<L: Layout + 'static> StructCollector<L> {
    pub fn new() -> StructCollector<L> {
        StructCollector {
            inner: DelimitedCollector::new(StringCollector::new(), L::SIZE),
            value: None,
            on_close: None,
        }
    }

    pub fn on_close(
        mut self,
        callback: impl FnOnce(&mut StructCollector<L>) + 'static,
    ) -> StructCollector<L> {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// The decoded value; present once the collector is full.
    pub fn value(&self) -> Option<&L> {
        self.value.as_ref()
    }

    pub fn take_value(&mut self) -> Option<L> {
        self.value.take()
    }
}

impl<L: Layout + 'static> Default for StructCollector<L> {
    fn default() -> StructCollector<L> {
        StructCollector::new()
    }
}

impl<L: Layout + 'static> Collector for StructCollector<L> {
    fn add_data(&mut self, source: &dyn Source, max: usize) -> io::Result<Progress> {
        let progress = self.inner.add_data(source, max)?;
        if progress.done {
            self.close();
        }
        Ok(progress)
    }

    fn close(&mut self) {
        if self.value.is_none() && self.inner.remaining() == 0 {
            self.value = Some(L::unpack(self.inner.inner().value()));
        }
        if let Some(callback) = self.on_close.take() {
            callback(self);
        }
        self.inner.close();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<L: Layout + fmt::Debug> fmt::Debug for StructCollector<L> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("StructCollector")
            .field("value", &self.value)
            .field("remaining", &self.inner.remaining())
            .finish()
    }
}
