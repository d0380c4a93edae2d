mod util;

use std::cell::{Cell, RefCell};
use std::io;
use std::net::TcpListener;
use std::rc::Rc;

use rand::RngCore;

use evio::{Handler, Server, Socket, SocketTransport};

use util::{listener, poll_until, reactors, Recorder};

/// Collects inbound bytes, echoes them back, counts closes.
#[derive(Debug, Default)]
struct Echo {
    received: Rc<RefCell<Vec<u8>>>,
    closes: Rc<Cell<usize>>,
    cleanups: Rc<Cell<usize>>,
}

impl Handler for Echo {
    fn on_readable(&mut self, transport: &SocketTransport) -> io::Result<()> {
        let data = transport.recv(4096)?;
        if !data.is_empty() {
            self.received.borrow_mut().extend_from_slice(&data);
            transport.sendall(&data);
        }
        Ok(())
    }

    fn on_close(&mut self, _: &SocketTransport) -> io::Result<()> {
        self.closes.set(self.closes.get() + 1);
        Ok(())
    }

    fn on_cleanup(&mut self, _: &SocketTransport) {
        self.cleanups.set(self.cleanups.get() + 1);
    }
}

// S1: a client sends "Foo\n"; the server receives exactly that, echoes it
// back, and when the client closes, the server observes close at most once
// and cleanup exactly once.
#[test]
fn echo_round_trip_and_close_once() {
    for reactor in reactors() {
        let (listener, addr) = listener(&reactor);

        let server_echo = Echo::default();
        let received = Rc::clone(&server_echo.received);
        let closes = Rc::clone(&server_echo.closes);
        let cleanups = Rc::clone(&server_echo.cleanups);
        let server_echo = Rc::new(RefCell::new(server_echo));

        let connections = Rc::new(RefCell::new(Vec::new()));
        let accepted = Rc::clone(&connections);
        let server_handler = Rc::clone(&server_echo);
        listener.set_handler(Rc::new(RefCell::new(Server::new(
            move |listener: &SocketTransport, socket: Socket, _addr| {
                let reactor = listener.reactor().expect("reactor gone");
                let connection = SocketTransport::with_socket(&reactor, socket)
                    .expect("adopting accepted socket");
                connection.set_handler(server_handler.clone());
                connection.set_readable(true);
                accepted.borrow_mut().push(connection);
                Ok(())
            },
        ))));
        listener.set_readable(true);

        let client = SocketTransport::new(&reactor).expect("creating client");
        let client_echo = Echo::default();
        let client_received = Rc::clone(&client_echo.received);
        client.set_handler(Rc::new(RefCell::new(client_echo)));
        client.set_readable(true);
        client.connect(addr).expect("connecting");
        client.sendall(b"Foo\n");

        poll_until(&reactor, || received.borrow().as_slice() == b"Foo\n");
        poll_until(&reactor, || client_received.borrow().as_slice() == b"Foo\n");

        client.close();
        poll_until(&reactor, || cleanups.get() == 1);
        assert!(closes.get() <= 1);
        assert_eq!(received.borrow().as_slice(), b"Foo\n");
    }
}

// S6: connecting to a freshly closed port fires on_connect_failed with a
// refused-class error; neither on_connect nor on_close fires, cleanup does.
#[test]
fn connect_refused_is_exclusive() {
    for reactor in reactors() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("binding probe listener");
            listener.local_addr().expect("probe addr").port()
        };

        let client = SocketTransport::new(&reactor).expect("creating client");
        let (recorder, counts) = Recorder::new();
        client.set_handler(Rc::new(RefCell::new(recorder)));
        client
            .connect(format!("127.0.0.1:{}", port).parse().unwrap())
            .expect("initiating connect");

        poll_until(&reactor, || counts.borrow().connect_failed == 1);
        let counts = counts.borrow();
        assert_eq!(counts.connect, 0);
        assert_eq!(counts.close, 0);
        assert_eq!(counts.cleanup, 1);
        assert_eq!(
            counts.last_connect_error,
            Some(io::ErrorKind::ConnectionRefused)
        );
    }
}

#[test]
fn transport_close_is_idempotent() {
    for reactor in reactors() {
        let transport = SocketTransport::new(&reactor).expect("creating transport");
        let (recorder, counts) = Recorder::new();
        transport.set_handler(Rc::new(RefCell::new(recorder)));

        transport.close();
        transport.close();
        assert_eq!(counts.borrow().cleanup, 1);
        assert!(transport.is_closed());

        // Closing the reactor afterwards must not clean up again.
        reactor.close();
        assert_eq!(counts.borrow().cleanup, 1);
    }
}

// The sendall drain keeps the user-facing writable flag untouched while
// overriding the reactor-observed interest until the buffer empties.
#[test]
fn sendall_drains_without_touching_user_writable() {
    for reactor in reactors() {
        let (a, b) = evio::socket_pair().expect("creating pair");
        a.set_nonblocking(true).expect("nonblocking a");
        b.set_nonblocking(true).expect("nonblocking b");

        let sender = SocketTransport::with_socket(&reactor, a).expect("adopting sender");
        let (recorder, _counts) = Recorder::new();
        sender.set_handler(Rc::new(RefCell::new(recorder)));

        let mut payload = vec![0u8; 1_000_000];
        rand::rng().fill_bytes(&mut payload);
        sender.sendall(&payload);
        assert!(!sender.writable());

        let mut drained = Vec::with_capacity(payload.len());
        let mut chunk = [0u8; 65536];
        poll_until(&reactor, || {
            loop {
                match b.recv(&mut chunk, 0) {
                    Ok(0) => break,
                    Ok(n) => drained.extend_from_slice(&chunk[..n]),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => panic!("draining pair: {}", err),
                }
            }
            drained.len() == payload.len()
        });

        assert_eq!(drained, payload);
        assert!(!sender.writable());
    }
}

// A handler error is routed to on_error on the same handler.
#[test]
fn handler_errors_reach_on_error() {
    for reactor in reactors() {
        let (listener, addr) = listener(&reactor);

        struct Failing {
            errors: Rc<Cell<usize>>,
        }

        impl Handler for Failing {
            fn on_connect(&mut self, _: &SocketTransport) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            }

            fn on_error(&mut self, _: &SocketTransport, _: io::Error) {
                self.errors.set(self.errors.get() + 1);
            }
        }

        let errors = Rc::new(Cell::new(0));
        let client = SocketTransport::new(&reactor).expect("creating client");
        client.set_handler(Rc::new(RefCell::new(Failing {
            errors: Rc::clone(&errors),
        })));
        client.connect(addr).expect("connecting");

        poll_until(&reactor, || errors.get() == 1);
        drop(listener);
    }
}
