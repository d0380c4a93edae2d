use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops;
use std::path::Path;

use bytes::{Buf, Bytes, BytesMut};

use crate::element::{ElementState, Progress, Sink};
use crate::util::{GradualAverage, LimitedAverage};

/// Default refill size for file-backed inputs.
pub(crate) const FILE_BUFFER_SIZE: usize = 9096;

/// A lazy byte producer.
///
/// `tick` pushes some bytes into the sink and reports progress; once it
/// returns `done` the input has closed itself and will move nothing more.
/// `close` is idempotent and may be called before the input ever
/// initialized, so implementations clean up lazily acquired resources only
/// if they exist.
pub trait Input {
    /// Send some bytes into `sink`.
    fn tick(&mut self, sink: &dyn Sink) -> io::Result<Progress>;

    /// Close the input, firing its `on_close` callback exactly once.
    fn close(&mut self);

    /// Total bytes this input will produce, when knowable.
    fn length(&mut self) -> Option<u64> {
        None
    }
}

impl fmt::Debug for dyn Input {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Input")
    }
}

/// `a + b` concatenates any two boxed inputs into a queue.
impl ops::Add for Box<dyn Input> {
    type Output = Box<dyn Input>;

    fn add(self, other: Box<dyn Input>) -> Box<dyn Input> {
        let mut queue = InputQueue::new();
        queue.push(self);
        queue.push(other);
        Box::new(queue)
    }
}

/// Input that sends a byte string, buffered across ticks.
pub struct StringInput {
    state: ElementState,
    buf: Bytes,
    on_close: Option<Box<dyn FnOnce(&mut StringInput)>>,
}

impl StringInput {
    pub fn new(data: impl Into<Bytes>) -> StringInput {
        StringInput {
            state: ElementState::default(),
            buf: data.into(),
            on_close: None,
        }
    }

    pub fn on_close(mut self, callback: impl FnOnce(&mut StringInput) + 'static) -> StringInput {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// Bytes not yet sent.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

impl Input for StringInput {
    fn tick(&mut self, sink: &dyn Sink) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        let sent = sink.send(&self.buf)?;
        self.buf.advance(sent);

        if self.buf.is_empty() {
            self.close();
        }
        Ok(Progress::new(self.buf.is_empty(), sent))
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

    fn length(&mut self) -> Option<u64> {
        Some(self.buf.len() as u64)
    }
}

impl fmt::Debug for StringInput {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("StringInput")
            .field("remaining", &self.buf.len())
            .field("closed", &self.state.closed)
            .finish()
    }
}

/// Input that streams a file through a bounded refill buffer, so at most
/// `buffer_size` bytes sit in memory no matter how large the file is.
pub struct FileInput {
    state: ElementState,
    file: Option<File>,
    buf: BytesMut,
    buffer_size: usize,
    closing: bool,
    eof: bool,
    cached_len: Option<u64>,
    on_close: Option<Box<dyn FnOnce(&mut FileInput)>>,
}

impl FileInput {
    /// `length` may be given when known up front; otherwise it is computed
    /// lazily by seeking. `closing` controls whether `close` drops the file
    /// handle.
    pub fn new(file: File, length: Option<u64>, buffer_size: usize, closing: bool) -> FileInput {
        FileInput {
            state: ElementState::default(),
            file: Some(file),
            buf: BytesMut::new(),
            buffer_size: buffer_size.max(1),
            closing,
            eof: false,
            cached_len: length,
            on_close: None,
        }
    }

    /// Open `path` with the default buffer size, length from metadata.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<FileInput> {
        let length = std::fs::metadata(&path)?.len();
        let file = File::open(path)?;
        Ok(FileInput::new(file, Some(length), FILE_BUFFER_SIZE, true))
    }

    pub fn on_close(mut self, callback: impl FnOnce(&mut FileInput) + 'static) -> FileInput {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// The file handle, if still held (only after a non-closing `close`, or
    /// before one happened).
    pub fn into_file(self) -> Option<File> {
        self.file
    }

    pub(crate) fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size.max(1);
    }

    fn refill(&mut self) -> io::Result<()> {
        if self.eof || self.buf.len() >= self.buffer_size {
            return Ok(());
        }
        let want = self.buffer_size - self.buf.len();
        let mut chunk = vec![0u8; want];
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                self.eof = true;
                return Ok(());
            }
        };
        let n = file.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }
}

impl Input for FileInput {
    fn tick(&mut self, sink: &dyn Sink) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        self.refill()?;
        let sent = sink.send(&self.buf)?;
        self.buf.advance(sent);

        let done = self.eof && self.buf.is_empty();
        if done {
            self.close();
        }
        Ok(Progress::new(done, sent))
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

    fn length(&mut self) -> Option<u64> {
        if self.cached_len.is_none() {
            let file = self.file.as_mut()?;
            let length = (|| {
                let pos = file.stream_position()?;
                let end = file.seek(SeekFrom::End(0))?;
                file.seek(SeekFrom::Start(pos))?;
                Ok::<_, io::Error>(end - pos)
            })()
            .ok()?;
            self.cached_len = Some(length);
        }
        self.cached_len
    }
}

impl fmt::Debug for FileInput {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("FileInput")
            .field("buffer_size", &self.buffer_size)
            .field("eof", &self.eof)
            .field("closed", &self.state.closed)
            .finish()
    }
}

#[derive(Debug)]
enum Average {
    Gradual(GradualAverage),
    Limited(LimitedAverage),
}

impl Average {
    fn add_value(&mut self, value: f64) {
        match self {
            Average::Gradual(avg) => avg.add_value(value),
            Average::Limited(avg) => avg.add_value(value),
        }
    }

    fn avg(&self) -> f64 {
        match self {
            Average::Gradual(avg) => avg.avg(),
            Average::Limited(avg) => avg.avg(),
        }
    }
}

/// [`FileInput`] that sizes its refill buffer from a running average of the
/// per-tick send sizes, so the buffer tracks what the peer actually drains.
pub struct AutoFileInput {
    inner: FileInput,
    average: Average,
}

impl AutoFileInput {
    /// Average over every tick ever made.
    pub fn new(inner: FileInput) -> AutoFileInput {
        AutoFileInput {
            inner,
            average: Average::Gradual(GradualAverage::new()),
        }
    }

    /// Average over a window of the most recent `samples` ticks.
    pub fn with_samples(inner: FileInput, samples: usize) -> AutoFileInput {
        AutoFileInput {
            inner,
            average: Average::Limited(LimitedAverage::new(samples)),
        }
    }
}

impl Input for AutoFileInput {
    fn tick(&mut self, sink: &dyn Sink) -> io::Result<Progress> {
        let progress = self.inner.tick(sink)?;
        self.average.add_value(progress.bytes as f64);
        // Never let the average starve the buffer entirely.
        self.inner.set_buffer_size(self.average.avg().round().max(1.0) as usize);
        Ok(progress)
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn length(&mut self) -> Option<u64> {
        self.inner.length()
    }
}

impl fmt::Debug for AutoFileInput {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AutoFileInput")
            .field("inner", &self.inner)
            .finish()
    }
}

/// Sends the head input until it is done, discards it and advances; done
/// when empty. The identity of input concatenation.
pub struct InputQueue {
    state: ElementState,
    inputs: VecDeque<Box<dyn Input>>,
    on_close: Option<Box<dyn FnOnce(&mut InputQueue)>>,
}

impl InputQueue {
    pub fn new() -> InputQueue {
        InputQueue {
            state: ElementState::default(),
            inputs: VecDeque::new(),
            on_close: None,
        }
    }

    pub fn on_close(mut self, callback: impl FnOnce(&mut InputQueue) + 'static) -> InputQueue {
        self.on_close = Some(Box::new(callback));
        self
    }

    pub fn push(&mut self, input: Box<dyn Input>) {
        self.inputs.push_back(input);
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }
}

impl Default for InputQueue {
    fn default() -> InputQueue {
        InputQueue::new()
    }
}

impl Input for InputQueue {
    fn tick(&mut self, sink: &dyn Sink) -> io::Result<Progress> {
        if self.state.closed {
            return Ok(Progress::new(true, 0));
        }
        self.state.inited = true;

        loop {
            let Some(head) = self.inputs.front_mut() else {
                self.close();
                return Ok(Progress::new(true, 0));
            };
            let progress = head.tick(sink)?;
            if progress.done {
                self.inputs.pop_front();
                if self.inputs.is_empty() {
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
        if let Some(callback) = self.on_close.take() {
            callback(self);
        }
        for input in self.inputs.iter_mut() {
            input.close();
        }
        self.state.closed = true;
    }

    fn length(&mut self) -> Option<u64> {
        let mut total = 0;
        for input in self.inputs.iter_mut() {
            total += input.length()?;
        }
        Some(total)
    }
}

impl ops::Add<Box<dyn Input>> for InputQueue {
    type Output = InputQueue;

    fn add(mut self, other: Box<dyn Input>) -> InputQueue {
        self.push(other);
        self
    }
}

impl fmt::Debug for InputQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("InputQueue")
            .field("queued", &self.inputs.len())
            .field("closed", &self.state.closed)
            .finish()
    }
}

/// Obtains each successive input from a factory; the factory returning
/// `None` marks end-of-stream.
pub struct FactoryInput {
    state: ElementState,
    factory: Box<dyn FnMut() -> Option<Box<dyn Input>>>,
    current: Option<Box<dyn Input>>,
}

impl FactoryInput {
    pub fn new(factory: impl FnMut() -> Option<Box<dyn Input>> + 'static) -> FactoryInput {
        FactoryInput {
            state: ElementState::default(),
            factory: Box::new(factory),
            current: None,
        }
    }

    /// Drive the factory from any iterator of inputs.
    pub fn from_iter<I>(inputs: I) -> FactoryInput
    where
        I: IntoIterator<Item = Box<dyn Input>>,
        I::IntoIter: 'static,
    {
        let mut iter = inputs.into_iter();
        FactoryInput::new(move || iter.next())
    }
}

impl Input for FactoryInput {
    fn tick(&mut self, sink: &dyn Sink) -> io::Result<Progress> {
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
            let progress = current.tick(sink)?;
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
}

impl fmt::Debug for FactoryInput {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("FactoryInput")
            .field("active", &self.current.is_some())
            .field("closed", &self.state.closed)
            .finish()
    }
}
