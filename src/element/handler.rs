use std::fmt;
use std::io;

use crate::element::{Collector, Input, InputQueue, StringInput};
use crate::handler::Handler;
use crate::transport::SocketTransport;

/// Default per-read byte count handed to the collector.
const READ_BUFFER_SIZE: usize = 9046;

/// Handler that glues an input queue (outbound) and a collector (inbound)
/// to a transport.
///
/// Queueing data subscribes the transport for write readiness; the queue
/// running dry unsubscribes it. Symmetrically, a collector reporting done
/// unsubscribes from read readiness until a new one is set.
///
/// The handler is shared with the dispatcher, so user code keeps it as
/// `Rc<RefCell<ElementHandler>>` and borrows it to queue data:
///
/// ```no_run
/// # use std::cell::RefCell;
/// # use std::rc::Rc;
/// # use evio::element::{ElementHandler, StringCollector};
/// # use evio::{Reactor, SocketTransport};
/// # let reactor = Reactor::new().unwrap();
/// # let transport = SocketTransport::new(&reactor).unwrap();
/// let handler = Rc::new(RefCell::new(ElementHandler::new()));
/// transport.set_handler(handler.clone());
/// handler.borrow_mut().send_bytes(&transport, b"hello");
/// ```
pub struct ElementHandler {
    queue: InputQueue,
    collector: Option<Box<dyn Collector>>,
    buffer_size: usize,
}

impl ElementHandler {
    pub fn new() -> ElementHandler {
        ElementHandler {
            queue: InputQueue::new(),
            collector: None,
            buffer_size: READ_BUFFER_SIZE,
        }
    }

    /// Start with an inbound collector already in place; remember to
    /// subscribe the transport for read readiness.
    pub fn with_collector(collector: Box<dyn Collector>) -> ElementHandler {
        ElementHandler {
            queue: InputQueue::new(),
            collector: Some(collector),
            buffer_size: READ_BUFFER_SIZE,
        }
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> ElementHandler {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Swap the top-level collector. The previous one is closed unless
    /// `no_close`. Subscribes for read readiness.
    pub fn set_collector(
        &mut self,
        transport: &SocketTransport,
        collector: Box<dyn Collector>,
        no_close: bool,
    ) {
        if let Some(mut previous) = self.collector.take() {
            if !no_close {
                previous.close();
            }
        }
        self.collector = Some(collector);
        if !transport.readable() {
            transport.set_readable(true);
        }
    }

    /// Append an input to the outbound queue and subscribe for write
    /// readiness.
    pub fn send_input(&mut self, transport: &SocketTransport, input: Box<dyn Input>) {
        self.queue.push(input);
        if !transport.writable() {
            transport.set_writable(true);
        }
    }

    /// Sugar for queueing a byte string.
    pub fn send_bytes(&mut self, transport: &SocketTransport, data: impl AsRef<[u8]>) {
        self.send_input(
            transport,
            Box::new(StringInput::new(data.as_ref().to_vec())),
        );
    }

    /// Whether any outbound data is still queued.
    pub fn has_data(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The current top-level collector.
    pub fn collector(&self) -> Option<&dyn Collector> {
        self.collector.as_deref()
    }

    /// Close the top-level collector.
    pub fn close(&mut self) {
        if let Some(collector) = self.collector.as_mut() {
            collector.close();
        }
    }
}

impl Default for ElementHandler {
    fn default() -> ElementHandler {
        ElementHandler::new()
    }
}

impl Handler for ElementHandler {
    fn on_readable(&mut self, transport: &SocketTransport) -> io::Result<()> {
        let Some(collector) = self.collector.as_mut() else {
            return Ok(());
        };
        let progress = collector.add_data(transport, self.buffer_size)?;
        if progress.done {
            transport.set_readable(false);
        }
        Ok(())
    }

    fn on_writable(&mut self, transport: &SocketTransport) -> io::Result<()> {
        if !self.has_data() {
            transport.set_writable(false);
            return Ok(());
        }
        let progress = self.queue.tick(transport)?;
        if progress.done {
            // A drained queue has closed itself and closed queues are
            // terminal; start fresh for whatever is sent next.
            self.queue = InputQueue::new();
            transport.set_writable(false);
        }
        Ok(())
    }

    fn on_cleanup(&mut self, _transport: &SocketTransport) {
        self.close();
    }
}

impl fmt::Debug for ElementHandler {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ElementHandler")
            .field("queued_inputs", &self.queue.len())
            .field("has_collector", &self.collector.is_some())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}
