mod util;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use evio::{Error, SocketTransport};

use util::{listener, poll_until, reactors, Recorder};

#[test]
fn poll_after_close_fails() {
    for reactor in reactors() {
        reactor.close();
        assert!(matches!(
            reactor.poll(Some(Duration::from_millis(1))),
            Err(Error::ReactorClosed)
        ));
    }
}

#[test]
fn wake_unblocks_an_indefinite_poll() {
    for reactor in reactors() {
        let waker = reactor.waker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker.wake().expect("waking");
        });
        // Would hang forever without the wake.
        reactor.poll(None).expect("unable to poll");
        handle.join().unwrap();
    }
}

// The full handshake parks the reactor until the mutator releases it, so a
// poll that was blocked spans the whole interrupt window.
#[test]
fn full_interrupt_blocks_poll_until_released() {
    for reactor in reactors() {
        let waker = reactor.waker();
        let flag = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker
                .interrupt(false, || {
                    thread::sleep(Duration::from_millis(100));
                    seen.store(true, Ordering::SeqCst);
                })
                .expect("interrupting");
        });
        reactor.poll(None).expect("unable to poll");
        assert!(
            flag.load(Ordering::SeqCst),
            "poll returned before the interrupt window closed"
        );
        handle.join().unwrap();
    }
}

// A worker thread flips a transport's writable flag inside a change-flags
// interrupt; the reactor dispatches a write within the following cycles.
#[test]
fn change_flags_interrupt_triggers_write_dispatch() {
    for reactor in reactors() {
        let (_listener, addr) = listener(&reactor);

        let client = SocketTransport::new(&reactor).expect("creating client");
        let (recorder, counts) = Recorder::new();
        client.set_handler(Rc::new(RefCell::new(recorder)));
        client.connect(addr).expect("connecting");

        poll_until(&reactor, || counts.borrow().connect == 1);
        assert!(!client.writable());

        let waker = reactor.waker();
        let interest = client.interest_handle();
        // On the fragile backend the handshake completes only while the main
        // thread polls, so the join comes after the poll loop.
        let handle = thread::spawn(move || {
            waker
                .interrupt(true, || interest.set_writable(true))
                .expect("interrupting");
        });

        poll_until(&reactor, || counts.borrow().writable >= 1);
        handle.join().unwrap();
        assert!(client.writable());
    }
}

// call_synchronized runs the function on the reactor thread within one
// additional poll cycle, from any backend.
#[test]
fn call_synchronized_runs_on_reactor_thread() {
    for reactor in reactors() {
        let ran_on = Arc::new(std::sync::Mutex::new(None::<thread::ThreadId>));
        let waker = reactor.waker();
        let slot = Arc::clone(&ran_on);
        let handle = thread::spawn(move || {
            waker
                .call_synchronized(move || {
                    *slot.lock().unwrap() = Some(thread::current().id());
                })
                .expect("scheduling");
        });
        handle.join().unwrap();

        poll_until(&reactor, || ran_on.lock().unwrap().is_some());
        assert_eq!(
            ran_on.lock().unwrap().unwrap(),
            thread::current().id(),
            "synchronized call ran off the reactor thread"
        );
    }
}

#[test]
fn close_releases_thread_parked_in_handshake() {
    for reactor in reactors() {
        let waker = reactor.waker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            // Either the handshake completes against the still-open reactor
            // or the close releases it; it must not hang.
            let _ = waker.start_interrupt(false);
            let _ = waker.end_interrupt(false);
        });
        thread::sleep(Duration::from_millis(100));
        reactor.close();
        handle.join().unwrap();
    }
}

#[test]
fn reactor_close_cleans_up_registered_transports_once() {
    for reactor in reactors() {
        let transport = SocketTransport::new(&reactor).expect("creating transport");
        let (recorder, counts) = Recorder::new();
        transport.set_handler(Rc::new(RefCell::new(recorder)));

        reactor.close();
        assert_eq!(counts.borrow().cleanup, 1);

        // A later transport close must not clean up again.
        transport.close();
        assert_eq!(counts.borrow().cleanup, 1);
    }
}

#[test]
fn run_ends_when_a_handler_closes_the_reactor() {
    struct CloseOnConnect;

    impl evio::Handler for CloseOnConnect {
        fn on_connect(&mut self, transport: &SocketTransport) -> std::io::Result<()> {
            transport.reactor().expect("reactor gone").close();
            Ok(())
        }
    }

    for reactor in reactors() {
        let (_listener, addr) = listener(&reactor);
        let client = SocketTransport::new(&reactor).expect("creating client");
        client.set_handler(Rc::new(RefCell::new(CloseOnConnect)));
        client.connect(addr).expect("connecting");

        reactor.run().expect("run should end cleanly");
        assert!(reactor.is_closed());
    }
}
