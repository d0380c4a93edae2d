//! Translation of low-level readiness into transport lifecycle events.
//!
//! The dispatcher owns the ordering and at-most-once rules: within one poll
//! iteration a transport sees read, then write, then except, then close.
//! Lifecycle callbacks run with the handler mutably borrowed, so anything a
//! callback triggers on its own transport (a `close()`, a synthesized close
//! from a failed send) is queued and delivered after the callback returns
//! rather than re-entered.

use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use log::{error, trace};

use crate::handler::Handler;
use crate::transport::{is_connection_lost, SocketTransport};
use crate::Event;

/// A transport lifecycle event, in dispatch order.
#[derive(Debug)]
pub(crate) enum Lifecycle {
    Read,
    Write,
    Connect,
    ConnectFailed(io::Error),
    Except,
    Close,
    Cleanup,
}

/// Queue `event` for `transport` and deliver it unless a dispatch is
/// already running further up the stack.
pub(crate) fn deliver(transport: &Rc<SocketTransport>, event: Lifecycle) {
    match event {
        // Close fires at most once, cleanup exactly once; claim before
        // queueing so duplicates are never queued at all.
        Lifecycle::Close => {
            if !transport.flags().claim_close_dispatch() {
                return;
            }
        }
        Lifecycle::Cleanup => {
            if !transport.flags().claim_cleanup_dispatch() {
                return;
            }
        }
        _ => {}
    }
    transport.pending().borrow_mut().push_back(event);
    drain(transport);
}

/// Deliver every queued lifecycle event for `transport`.
pub(crate) fn drain(transport: &Rc<SocketTransport>) {
    if transport.in_dispatch().get() {
        return;
    }
    transport.in_dispatch().set(true);

    loop {
        let Some(event) = transport.pending().borrow_mut().pop_front() else {
            break;
        };
        let close_after = matches!(event, Lifecycle::Close);

        let Some(handler) = transport.handler_rc() else {
            trace!(
                "dropping {:?} for fd={} (no handler attached)",
                event,
                transport.as_raw_fd()
            );
            if close_after {
                transport.close();
            }
            continue;
        };

        match handler.try_borrow_mut() {
            Ok(mut callbacks) => {
                let result = invoke(&mut *callbacks, transport, event);
                drop(callbacks);
                if let Err(err) = result {
                    report_error(transport, err);
                }
            }
            Err(_) => {
                // The user holds their handler borrowed outside the
                // dispatcher; park the transport and let the reactor retry
                // at the end of the poll cycle.
                transport.pending().borrow_mut().push_front(event);
                if let Some(reactor) = transport.reactor_inner() {
                    reactor.park_for_drain(Rc::clone(transport));
                }
                break;
            }
        }

        if close_after {
            // Peer-observed close: tear the transport down now that
            // `on_close` has run; this queues the final cleanup event.
            transport.close();
        }
    }

    transport.in_dispatch().set(false);
}

fn invoke(
    callbacks: &mut dyn Handler,
    transport: &SocketTransport,
    event: Lifecycle,
) -> io::Result<()> {
    match event {
        Lifecycle::Read => callbacks.on_readable(transport),
        Lifecycle::Write => callbacks.on_writable(transport),
        Lifecycle::Connect => callbacks.on_connect(transport),
        Lifecycle::ConnectFailed(err) => callbacks.on_connect_failed(transport, err),
        Lifecycle::Except => callbacks.on_except(transport),
        Lifecycle::Close => callbacks.on_close(transport),
        Lifecycle::Cleanup => {
            callbacks.on_cleanup(transport);
            Ok(())
        }
    }
}

/// Route a callback error to the same handler's `on_error`.
fn report_error(transport: &Rc<SocketTransport>, err: io::Error) {
    match transport.handler_rc() {
        Some(handler) => match handler.try_borrow_mut() {
            Ok(mut callbacks) => callbacks.on_error(transport, err),
            Err(_) => error!("handler busy while reporting error: {}", err),
        },
        None => error!("no handler to report error to: {}", err),
    }
}

/// Fail an in-flight (or immediate) connect: `on_connect_failed` fires, the
/// close dispatch is suppressed so `on_close` can never follow, and the
/// transport is torn down (which still fires `on_cleanup` exactly once).
pub(crate) fn connect_failed(transport: &Rc<SocketTransport>, err: io::Error) {
    transport.flags().suppress_close_dispatch();
    deliver(transport, Lifecycle::ConnectFailed(err));
    transport.close();
}

/// Resolve an awaiting-connect transport from its pending `SO_ERROR`.
/// Returns whether the transport survived (connect succeeded).
fn finalize_connect(transport: &Rc<SocketTransport>) -> bool {
    let pending = transport.take_sock_error();
    transport.stop_awaiting_connect();
    match pending {
        None => {
            transport.flags().mark_connected();
            deliver(transport, Lifecycle::Connect);
            true
        }
        Some(err) => {
            connect_failed(transport, err);
            false
        }
    }
}

/// Translate one readiness event into lifecycle dispatches.
///
/// `wants_hup_peek` is the backend's word on whether peer hangup must be
/// probed with a peek on read-readiness (everything but kqueue, which
/// reports `EV_EOF` instead).
pub(crate) fn dispatch_event(
    transport: &Rc<SocketTransport>,
    event: &Event,
    wants_hup_peek: bool,
) {
    // Queue everything first, deliver in order at the end; this keeps
    // callbacks from running while this function still inspects the socket.
    let was_dispatching = transport.in_dispatch().replace(true);

    let flags = transport.flags();
    let mut hup = event.is_hup() || event.is_error();
    let read_ready = event.is_readable() || event.is_priority();

    // An in-flight connect resolves off any readiness at all.
    if flags.awaiting_connect() && (read_ready || event.is_writable() || hup) {
        if !finalize_connect(transport) {
            transport.in_dispatch().set(was_dispatching);
            drain(transport);
            return;
        }
        hup = event.is_hup();
    }

    if read_ready && !flags.closed() {
        if flags.listening() {
            if flags.readable() {
                deliver(transport, Lifecycle::Read);
            }
        } else if flags.connected() {
            let mut dispatch_read = true;
            if wants_hup_peek {
                // A readable, connected socket with nothing to peek has been
                // hung up by the peer: close instead of read.
                let mut probe = [0u8; 1];
                match transport.peek_raw(&mut probe) {
                    Ok(0) => {
                        hup = true;
                        dispatch_read = false;
                    }
                    Ok(_) => {}
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // Spurious readiness; nothing to read after all.
                        dispatch_read = false;
                    }
                    Err(ref err) if is_connection_lost(err) => {
                        hup = true;
                        dispatch_read = false;
                    }
                    Err(_) => {}
                }
            }
            if dispatch_read && flags.readable() {
                deliver(transport, Lifecycle::Read);
            }
        }
    }

    if event.is_writable() && !flags.closed() && !flags.awaiting_connect() {
        if transport.has_sendall_data() {
            match transport.flush_sendall() {
                // Only once the sendall buffer has drained does the normal
                // write dispatch resume.
                Ok(true) => {
                    if flags.writable() {
                        deliver(transport, Lifecycle::Write);
                    }
                }
                Ok(false) => {}
                Err(err) => report_error(transport, err),
            }
        } else if flags.writable() {
            deliver(transport, Lifecycle::Write);
        }
    }

    // Out-of-band data without ordinary readability.
    if event.is_priority() && !event.is_readable() && !flags.closed() {
        deliver(transport, Lifecycle::Except);
    }

    if hup && !flags.closed() {
        deliver(transport, Lifecycle::Close);
    }

    transport.in_dispatch().set(was_dispatching);
    drain(transport);
}
