//! Minimalist readiness-based networking.
//!
//! evio provides a single-threaded event loop ([`Reactor`]) over non-blocking
//! sockets, together with a small set of composable abstractions for writing
//! streaming protocol code without ad-hoc state machines:
//!
//! * [`Reactor`] — the event demultiplexer, with backends over `select(2)`,
//!   `poll(2)`, `epoll(7)` and `kqueue(2)`, a thread-safe wake-up channel and
//!   an interrupt protocol for batched cross-thread mutation.
//! * [`SocketTransport`] — a non-blocking socket plus the lifecycle state the
//!   reactor needs: interest flags, connect-in-progress tracking, and
//!   at-most-once close/cleanup dispatch to a bound [`Handler`].
//! * [`element`] — lazy byte producers ([`element::Input`]) and consumers
//!   ([`element::Collector`]) that concatenate, nest and delimit to describe
//!   streaming wire formats declaratively.
//! * [`defer`] — a callback-graph primitive ([`defer::Deferred`]) and a
//!   coroutine layer so I/O-bound logic can be written in direct style.
//!
//! All handler callbacks, element ticks and deferred firings run on the
//! reactor thread; the only blocking call is [`Reactor::poll`]. Foreign
//! threads interact exclusively through the [`Waker`] handle.
//!
//! # Examples
//!
//! An echo server in terms of [`element::ElementHandler`]:
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use evio::element::{ElementHandler, StringCollector};
//! use evio::{Reactor, Server, SocketTransport};
//!
//! fn main() -> evio::Result<()> {
//!     let reactor = Reactor::new()?;
//!     let listener = SocketTransport::new(&reactor)?;
//!     listener.set_reuseaddr(true)?;
//!     listener.bind("127.0.0.1:7777".parse().unwrap())?;
//!     listener.listen(128)?;
//!     listener.set_handler(Rc::new(RefCell::new(Server::new(|listener, sock, _addr| {
//!         let reactor = listener.reactor().expect("reactor gone");
//!         let conn = SocketTransport::with_socket(&reactor, sock).expect("register");
//!         let handler = ElementHandler::with_collector(Box::new(StringCollector::new()));
//!         conn.set_handler(Rc::new(RefCell::new(handler)));
//!         conn.set_readable(true);
//!         Ok(())
//!     }))));
//!     listener.set_readable(true);
//!     reactor.run()
//! }
//! ```

#![cfg(unix)]

#[macro_use]
mod sys;

mod dispatch;
mod error;
mod event;
mod interest;
mod net;
mod reactor;
mod transport;

pub mod defer;
pub mod element;
pub mod handler;
pub mod util;

pub use crate::error::{Error, Result};
pub use crate::event::{Event, Events};
pub use crate::handler::{AcceptHandler, Acceptor, Handler, Server};
pub use crate::interest::Interest;
pub use crate::net::{parse_ip, parse_ipv4, parse_ipv6, socket_pair, Socket};
pub use crate::reactor::{Backend, Grade, Reactor, Waker};
pub use crate::transport::{InterestHandle, SocketTransport};
