mod util;

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use evio::defer::{failure, threaded, Blueprint, Chain, Coroutine, Deferred, Resume, Ret, Signal, Step};

use util::{poll_until, reactors};

#[derive(Debug)]
struct Http404;

impl fmt::Display for Http404 {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("not found")
    }
}

impl std::error::Error for Http404 {}

// Property 9: a callback added to a resolved deferred fires immediately.
#[test]
fn add_after_resolution_fires_immediately() {
    let ran = Rc::new(Cell::new(false));
    let deferred: Deferred<String> = Deferred::new();
    deferred.submit_success("foobar".to_owned());

    let seen = Rc::clone(&ran);
    deferred.add_map(move |value| {
        assert_eq!(value, "foobar");
        seen.set(true);
        value
    });
    assert!(ran.get());
}

#[test]
fn add_before_resolution_fires_on_submit() {
    let ran = Rc::new(Cell::new(false));
    let deferred: Deferred<String> = Deferred::new();

    let seen = Rc::clone(&ran);
    deferred.add_map(move |value| {
        seen.set(true);
        value
    });
    assert!(!ran.get());

    deferred.submit_success("foobar".to_owned());
    assert!(ran.get());
}

// Property 8: resolution is unique; later submissions are no-ops.
#[test]
fn resolution_is_cached_once() {
    let deferred: Deferred<i32> = Deferred::new();
    deferred.submit_success(1);
    deferred.submit_success(2);
    deferred.submit_error(failure(Http404));

    assert_eq!(deferred.outcome().unwrap().unwrap(), 1);
}

#[test]
fn default_errback_propagates_to_synchronize() {
    let deferred: Deferred<i32> = Deferred::new();
    let tail = deferred.add_map(|v| v + 1);
    deferred.submit_error(failure(Http404));

    let err = tail.synchronize(Some(Duration::ZERO)).unwrap().unwrap_err();
    assert!(err.downcast_ref::<Http404>().is_some());
}

// A callback returning `Ret::Chained` splices another deferred into the
// graph; children resolve with its eventual outcome, even when they were
// added after the original submission.
#[test]
fn chained_deferred_defers_downstream_callbacks() {
    let inner: Deferred<String> = Deferred::new();
    let outer: Deferred<String> = Deferred::new();

    let chained = inner.clone();
    let tail = outer
        .add(move |_hello| Ret::Chained(chained.clone()))
        .add_map(|v| v + "2")
        .add_map(|v| v + "2");

    outer.submit_success("hello".to_owned());
    assert!(tail.outcome().is_none(), "must wait for the inner deferred");

    inner.submit_success("world".to_owned());
    assert_eq!(tail.synchronize(None).unwrap().unwrap(), "world22");
    assert_eq!(
        tail.add_map(|v| v + "2").synchronize(None).unwrap().unwrap(),
        "world222"
    );
}

// S5: coroutine awaiting a coroutine; resolving the innermost deferred
// produces the doubled value at the outermost synchronize.
#[test]
fn coroutine_chain_round_trip() {
    let source: Deferred<String> = Deferred::new();

    let bar = Coroutine::spawn(Step::Await(
        source.clone(),
        Box::new(|resume| match resume {
            Resume::Success(value) => Step::Return(value),
            Resume::Error(err) => Step::Raise(err),
        }),
    ));
    let foo = Coroutine::spawn(Step::Await(
        bar,
        Box::new(|resume| match resume {
            Resume::Success(value) => Step::Return(format!("yay {}", value)),
            Resume::Error(err) => Step::Raise(err),
        }),
    ));

    source.submit_success("yay".to_owned());
    assert_eq!(foo.synchronize(None).unwrap().unwrap(), "yay yay");
}

// The error arm of an await is an ordinary continuation: a coroutine can
// catch a failure from the awaited coroutine and substitute a value.
#[test]
fn coroutine_catches_awaited_error() {
    let source: Deferred<String> = Deferred::new();

    let bar = Coroutine::spawn(Step::Await(
        source.clone(),
        Box::new(|resume| match resume {
            Resume::Success(_) => Step::Raise(failure(Http404)),
            Resume::Error(err) => Step::Raise(err),
        }),
    ));
    let foo = Coroutine::spawn(Step::Await(
        bar,
        Box::new(|resume| match resume {
            Resume::Success(value) => Step::Return(format!("yay {}", value)),
            Resume::Error(err) if err.downcast_ref::<Http404>().is_some() => {
                Step::Return("yay 404".to_owned())
            }
            Resume::Error(err) => Step::Raise(err),
        }),
    ));

    source.submit_success("yay".to_owned());
    assert_eq!(foo.synchronize(None).unwrap().unwrap(), "yay 404");
}

// Property 10: awaiting an already-resolved deferred resumes synchronously.
#[test]
fn coroutine_resumes_synchronously_from_resolved_deferred() {
    let source: Deferred<i32> = Deferred::new();
    source.submit_success(21);

    let doubled = Coroutine::spawn(Step::Await(
        source,
        Box::new(|resume| match resume {
            Resume::Success(value) => Step::Return(value * 2),
            Resume::Error(err) => Step::Raise(err),
        }),
    ));
    assert_eq!(doubled.outcome().unwrap().unwrap(), 42);
}

// Blueprint named refs survive instantiation (the original's test_ref).
#[test]
fn blueprint_refs_translate_to_instances() {
    let blueprint: Blueprint<i32> = Blueprint::new();
    let end = blueprint.add_map(|n| 2 * n).add_map(|n| 3 + n);
    assert!(blueprint.set_ref("end", &end));

    let deferred: Deferred<i32> = Deferred::new();
    let instance = deferred.add_blueprint(&blueprint);
    let tail = instance
        .by_ref("end")
        .expect("translated ref")
        .add_map(|x| 2 * x);
    deferred.submit_success(1);

    assert_eq!(tail.outcome().unwrap().unwrap(), 10);
}

// Each wrapinstance invocation gets a fresh graph (test_class_wrapinstance).
#[test]
fn wrapinstance_isolates_invocations() {
    let blueprint =
        Blueprint::with_callback(|value: String| Ret::Value(format!("foo{}", value)));
    blueprint.add_map(|value| value + "!");
    let call = blueprint.wrapinstance();

    let first = call("bar".to_owned());
    let second = call("baz".to_owned());

    assert_eq!(first.outcome().unwrap().unwrap(), "foobar");
    assert_eq!(second.outcome().unwrap().unwrap(), "foobaz");
}

// Chains are immutable templates: splicing one into another copies it, and
// both remain independently usable (test_immutability).
#[test]
fn chains_are_copied_when_spliced() {
    let base: Chain<i32> = Chain::new();
    base.add_map(|n| 2 * n)
        .unwrap()
        .add_map(|n| 3 + n)
        .unwrap();

    let extended: Chain<i32> = Chain::new();
    extended
        .add_chain(&base)
        .unwrap()
        .add_map(|n| 3 * n)
        .unwrap()
        .add_map(|n| 2 + n)
        .unwrap();

    let first: Deferred<i32> = Deferred::new();
    let end1 = first.add_chain(&extended);
    let second: Deferred<i32> = Deferred::new();
    let end2 = second.add_chain(&base);

    first.submit_success(1);
    second.submit_success(2);

    assert_eq!(end1.outcome().unwrap().unwrap(), 17);
    assert_eq!(end2.outcome().unwrap().unwrap(), 7);
}

#[test]
fn second_chain_link_is_rejected() {
    let chain: Chain<i32> = Chain::new();
    chain.add_map(|n| n).unwrap();
    assert!(matches!(
        chain.add_map(|n| n),
        Err(evio::Error::ChainOccupied)
    ));
}

#[test]
fn signal_fires_permanent_and_once_listeners() {
    let permanent = Rc::new(Cell::new(0));
    let once = Rc::new(Cell::new(0));

    let mut signal: Signal<i32> = Signal::new();
    let hits = Rc::clone(&permanent);
    signal.listen(move |value| hits.set(hits.get() + *value));
    let hit = Rc::clone(&once);
    signal.listen_once(move |value| hit.set(hit.get() + *value));

    signal.fire(&2);
    signal.fire(&3);

    assert_eq!(permanent.get(), 5);
    assert_eq!(once.get(), 2);
}

// Property 11 meets the threaded coroutine: the blocking result arrives on
// the reactor thread via the wake-up channel and resolves the deferred.
#[test]
fn threaded_work_resolves_on_reactor_thread() {
    for reactor in reactors() {
        let result = threaded(&reactor, || Ok(21 * 2));
        poll_until(&reactor, || result.outcome().is_some());
        assert_eq!(result.outcome().unwrap().unwrap(), 42);
    }
}

#[test]
fn threaded_errors_become_failures() {
    for reactor in reactors() {
        let result: Deferred<i32> = threaded(&reactor, || {
            Err(Box::new(Http404) as Box<dyn std::error::Error + Send + Sync>)
        });
        poll_until(&reactor, || result.outcome().is_some());
        let err = result.outcome().unwrap().unwrap_err();
        assert!(err.downcast_ref::<Http404>().is_some());
    }
}
