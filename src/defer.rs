//! Deferred results, callback graphs and coroutines.
//!
//! A [`Deferred`] is a value that will be resolved later, carrying a tree of
//! callback [`Node`]s that fire on resolution. [`Blueprint`]s are immutable
//! templates of such trees with named positions, [`Chain`]s are linear
//! templates, and [`Coroutine`] drives a continuation-style state machine so
//! I/O-bound logic reads top to bottom:
//!
//! ```
//! use evio::defer::{Coroutine, Deferred, Resume, Step};
//!
//! let source: Deferred<String> = Deferred::new();
//! let doubled = Coroutine::spawn(Step::Await(
//!     source.clone(),
//!     Box::new(|resume| match resume {
//!         Resume::Success(v) => Step::Return(format!("{} {}", v, v)),
//!         Resume::Error(e) => Step::Raise(e),
//!     }),
//! ));
//! source.submit_success("yay".to_owned());
//! assert_eq!(doubled.synchronize(None).unwrap().unwrap(), "yay yay");
//! ```
//!
//! Everything here is single-threaded (`!Send`) and runs on the reactor
//! thread; [`threaded`] bridges blocking work on foreign threads back into a
//! deferred through the reactor's injection queue.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};
use crate::reactor::{InjectPayload, Reactor};

/// A shared, cloneable error outcome.
pub type Failure = Rc<dyn std::error::Error>;

/// Wrap any error as a [`Failure`].
pub fn failure<E: std::error::Error + 'static>(err: E) -> Failure {
    Rc::new(err)
}

/// What a node callback returns.
///
/// `Value` caches the value, `Fail` caches the error, and `Chained` makes
/// the node adopt the outcome of another deferred once it resolves. A
/// deferred returned as a plain `Value` is cached as-is, so the dynamic
/// "escape" wrapper of callback-graph lore is simply `Ret::Value` here.
pub enum Ret<T> {
    Value(T),
    Fail(Failure),
    Chained(Deferred<T>),
}

type Callback<T> = Rc<dyn Fn(T) -> Ret<T>>;
type Errback<T> = Rc<dyn Fn(Failure) -> Ret<T>>;

enum State<T> {
    Pending,
    Success(T),
    Error(Failure),
}

/// Completion event; lives behind an `Arc` so `wait` can use a condvar.
struct Gate {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Gate> {
        Arc::new(Gate {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn open(&self) {
        *self.done.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = self.done.lock().unwrap();
        match timeout {
            None => {
                let mut guard = guard;
                while !*guard {
                    guard = self.cond.wait(guard).unwrap();
                }
                true
            }
            Some(timeout) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |done| !*done)
                    .unwrap();
                *guard
            }
        }
    }
}

struct NodeInner<T> {
    callback: Callback<T>,
    errback: Errback<T>,
    children: Vec<Node<T>>,
    state: State<T>,
    gate: Arc<Gate>,
}

/// One continuation in a callback tree.
///
/// A node holds a success callback (default: identity), an error callback
/// (default: re-raise), children fired with its cached outcome, and that
/// outcome itself, which is written at most once and immutable afterwards.
/// Adding a child to a resolved node fires the child immediately.
pub struct Node<T> {
    inner: Rc<RefCell<NodeInner<T>>>,
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Node<T> {
        Node {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Node<T> {
    fn with_callbacks(callback: Callback<T>, errback: Errback<T>) -> Node<T> {
        Node {
            inner: Rc::new(RefCell::new(NodeInner {
                callback,
                errback,
                children: Vec::new(),
                state: State::Pending,
                gate: Gate::new(),
            })),
        }
    }

    fn identity() -> Node<T> {
        Node::with_callbacks(Rc::new(Ret::Value), Rc::new(Ret::Fail))
    }

    /// Run the success callback on `value` and settle from its return.
    pub(crate) fn fire_success(&self, value: T) {
        let callback = self.inner.borrow().callback.clone();
        self.settle(callback(value));
    }

    /// Run the error callback on `err` and settle from its return.
    pub(crate) fn fire_error(&self, err: Failure) {
        let errback = self.inner.borrow().errback.clone();
        self.settle(errback(err));
    }

    fn settle(&self, ret: Ret<T>) {
        match ret {
            Ret::Value(value) => self.resolve_success(value),
            Ret::Fail(err) => self.resolve_error(err),
            Ret::Chained(deferred) => {
                // Adopt the other deferred's outcome without re-running our
                // own callbacks.
                let on_success = self.clone();
                let on_error = self.clone();
                deferred.add_pair(
                    move |value: T| {
                        on_success.resolve_success(value.clone());
                        Ret::Value(value)
                    },
                    move |err: Failure| {
                        on_error.resolve_error(err.clone());
                        Ret::Fail(err)
                    },
                );
            }
        }
    }

    /// Cache a success outcome and fan it out. A second resolution of
    /// either kind is a no-op.
    pub(crate) fn resolve_success(&self, value: T) {
        let (children, gate) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            inner.state = State::Success(value.clone());
            (inner.children.clone(), Arc::clone(&inner.gate))
        };
        for child in children {
            child.fire_success(value.clone());
        }
        gate.open();
    }

    pub(crate) fn resolve_error(&self, err: Failure) {
        let (children, gate) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            inner.state = State::Error(err.clone());
            (inner.children.clone(), Arc::clone(&inner.gate))
        };
        for child in children {
            child.fire_error(err.clone());
        }
        gate.open();
    }

    fn attach(&self, child: Node<T>) -> Node<T> {
        let fire = {
            let mut inner = self.inner.borrow_mut();
            match &inner.state {
                State::Pending => {
                    inner.children.push(child.clone());
                    None
                }
                State::Success(value) => Some(Ok(value.clone())),
                State::Error(err) => Some(Err(err.clone())),
            }
        };
        match fire {
            Some(Ok(value)) => child.fire_success(value),
            Some(Err(err)) => child.fire_error(err),
            None => {}
        }
        child
    }

    /// Append a child with the given success callback.
    pub fn add(&self, callback: impl Fn(T) -> Ret<T> + 'static) -> Node<T> {
        self.attach(Node::with_callbacks(Rc::new(callback), Rc::new(Ret::Fail)))
    }

    /// Append a child that plainly maps the success value.
    pub fn add_map(&self, callback: impl Fn(T) -> T + 'static) -> Node<T> {
        self.add(move |value| Ret::Value(callback(value)))
    }

    /// Append a child with only an error callback.
    pub fn add_err(&self, errback: impl Fn(Failure) -> Ret<T> + 'static) -> Node<T> {
        self.attach(Node::with_callbacks(Rc::new(Ret::Value), Rc::new(errback)))
    }

    /// Append a child with both callbacks.
    pub fn add_pair(
        &self,
        callback: impl Fn(T) -> Ret<T> + 'static,
        errback: impl Fn(Failure) -> Ret<T> + 'static,
    ) -> Node<T> {
        self.attach(Node::with_callbacks(Rc::new(callback), Rc::new(errback)))
    }

    fn child(&self, index: usize) -> Option<Node<T>> {
        self.inner.borrow().children.get(index).cloned()
    }

    /// The cached outcome, if resolved.
    pub fn outcome(&self) -> Option<std::result::Result<T, Failure>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Success(value) => Some(Ok(value.clone())),
            State::Error(err) => Some(Err(err.clone())),
        }
    }

    /// Block until resolved; with a timeout, returns whether it resolved.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let gate = Arc::clone(&self.inner.borrow().gate);
        gate.wait(timeout)
    }

    /// Wait, then return the outcome. `None` on timeout; the outcome is not
    /// latched by waiting.
    pub fn synchronize(&self, timeout: Option<Duration>) -> Option<std::result::Result<T, Failure>> {
        self.wait(timeout);
        self.outcome()
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.borrow().state {
            State::Pending => "pending",
            State::Success(..) => "success",
            State::Error(..) => "error",
        };
        fmt.debug_struct("Node")
            .field("state", &state)
            .field("children", &self.inner.borrow().children.len())
            .finish()
    }
}

/// A value resolved later, with a callback tree fired on resolution.
///
/// `Deferred` is a thin handle over a root [`Node`]: `submit_success` and
/// `submit_error` run the root's callbacks and fan the outcome out. Clones
/// share the same underlying graph. Instances produced from a
/// [`Blueprint`] additionally carry that blueprint's named refs.
pub struct Deferred<T> {
    node: Node<T>,
    refs: Rc<HashMap<String, Vec<usize>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Deferred<T> {
        Deferred {
            node: self.node.clone(),
            refs: Rc::clone(&self.refs),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// A pending deferred whose root passes values through unchanged.
    pub fn new() -> Deferred<T> {
        Deferred {
            node: Node::identity(),
            refs: Rc::new(HashMap::new()),
        }
    }

    /// A pending deferred whose root transforms the submitted value.
    pub fn with_callback(callback: impl Fn(T) -> Ret<T> + 'static) -> Deferred<T> {
        Deferred {
            node: Node::with_callbacks(Rc::new(callback), Rc::new(Ret::Fail)),
            refs: Rc::new(HashMap::new()),
        }
    }

    /// Resolve with a success value. Later submissions of either kind are
    /// no-ops.
    pub fn submit_success(&self, value: T) {
        self.node.fire_success(value);
    }

    /// Resolve with an error.
    pub fn submit_error(&self, err: Failure) {
        self.node.fire_error(err);
    }

    pub fn add(&self, callback: impl Fn(T) -> Ret<T> + 'static) -> Node<T> {
        self.node.add(callback)
    }

    pub fn add_map(&self, callback: impl Fn(T) -> T + 'static) -> Node<T> {
        self.node.add_map(callback)
    }

    pub fn add_err(&self, errback: impl Fn(Failure) -> Ret<T> + 'static) -> Node<T> {
        self.node.add_err(errback)
    }

    pub fn add_pair(
        &self,
        callback: impl Fn(T) -> Ret<T> + 'static,
        errback: impl Fn(Failure) -> Ret<T> + 'static,
    ) -> Node<T> {
        self.node.add_pair(callback, errback)
    }

    /// Instantiate `blueprint` as a child of this deferred; the returned
    /// instance carries the blueprint's refs. If this deferred is already
    /// resolved the whole instance fires immediately.
    pub fn add_blueprint(&self, blueprint: &Blueprint<T>) -> Deferred<T> {
        let instance = blueprint.instance();
        self.node.attach(instance.node.clone());
        instance
    }

    /// Instantiate `chain` as a child and return its tail node, the natural
    /// point to keep extending from.
    pub fn add_chain(&self, chain: &Chain<T>) -> Node<T> {
        let instance = chain.blueprint.instance();
        self.node.attach(instance.node.clone());
        let mut tail = instance.node;
        while let Some(next) = tail.child(0) {
            tail = next;
        }
        tail
    }

    /// Resolve a named position recorded by the originating blueprint.
    pub fn by_ref(&self, name: &str) -> Option<Node<T>> {
        let path = self.refs.get(name)?;
        let mut node = self.node.clone();
        for &index in path {
            node = node.child(index)?;
        }
        Some(node)
    }

    /// The root node.
    pub fn node(&self) -> &Node<T> {
        &self.node
    }

    /// A plain closure that resolves this deferred, for handing to code
    /// that expects a callback.
    pub fn resolver(&self) -> impl Fn(T) {
        let deferred = self.clone();
        move |value| deferred.submit_success(value)
    }

    pub fn outcome(&self) -> Option<std::result::Result<T, Failure>> {
        self.node.outcome()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.node.wait(timeout)
    }

    /// Wait for resolution, then return the outcome; `None` on timeout.
    pub fn synchronize(&self, timeout: Option<Duration>) -> Option<std::result::Result<T, Failure>> {
        self.node.synchronize(timeout)
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Deferred<T> {
        Deferred::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Deferred").field("node", &self.node).finish()
    }
}

struct BlueprintInner<T> {
    callback: Callback<T>,
    errback: Errback<T>,
    children: Vec<Blueprint<T>>,
    refs: HashMap<String, Vec<usize>>,
}

/// An immutable template of a callback tree with named positions.
///
/// Blueprints never fire; [`instance`](Blueprint::instance) clones the
/// template into a live [`Deferred`] graph, translating the named refs to
/// the fresh nodes. [`wrapinstance`](Blueprint::wrapinstance) turns a
/// blueprint into a callable that instantiates and fires per invocation.
pub struct Blueprint<T> {
    inner: Rc<RefCell<BlueprintInner<T>>>,
}

impl<T> Clone for Blueprint<T> {
    fn clone(&self) -> Blueprint<T> {
        Blueprint {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Blueprint<T> {
    pub fn new() -> Blueprint<T> {
        Blueprint::with_callbacks(Rc::new(Ret::Value), Rc::new(Ret::Fail))
    }

    pub fn with_callback(callback: impl Fn(T) -> Ret<T> + 'static) -> Blueprint<T> {
        Blueprint::with_callbacks(Rc::new(callback), Rc::new(Ret::Fail))
    }

    fn with_callbacks(callback: Callback<T>, errback: Errback<T>) -> Blueprint<T> {
        Blueprint {
            inner: Rc::new(RefCell::new(BlueprintInner {
                callback,
                errback,
                children: Vec::new(),
                refs: HashMap::new(),
            })),
        }
    }

    /// Append a child template and return a handle to it.
    pub fn add(&self, callback: impl Fn(T) -> Ret<T> + 'static) -> Blueprint<T> {
        self.add_child(Blueprint::with_callback(callback))
    }

    pub fn add_map(&self, callback: impl Fn(T) -> T + 'static) -> Blueprint<T> {
        self.add(move |value| Ret::Value(callback(value)))
    }

    pub fn add_pair(
        &self,
        callback: impl Fn(T) -> Ret<T> + 'static,
        errback: impl Fn(Failure) -> Ret<T> + 'static,
    ) -> Blueprint<T> {
        self.add_child(Blueprint::with_callbacks(
            Rc::new(callback),
            Rc::new(errback),
        ))
    }

    /// Append a deep copy of `template` as a child; returns the copy.
    pub fn add_node(&self, template: &Blueprint<T>) -> Blueprint<T> {
        self.add_child(template.deep_copy())
    }

    fn add_child(&self, child: Blueprint<T>) -> Blueprint<T> {
        self.inner.borrow_mut().children.push(child.clone());
        child
    }

    fn deep_copy(&self) -> Blueprint<T> {
        let inner = self.inner.borrow();
        Blueprint {
            inner: Rc::new(RefCell::new(BlueprintInner {
                callback: Rc::clone(&inner.callback),
                errback: Rc::clone(&inner.errback),
                children: inner.children.iter().map(Blueprint::deep_copy).collect(),
                refs: inner.refs.clone(),
            })),
        }
    }

    /// The child path leading to `target`, if it lives in this subtree.
    fn find_path(&self, target: &Blueprint<T>) -> Option<Vec<usize>> {
        for (index, child) in self.inner.borrow().children.iter().enumerate() {
            if Rc::ptr_eq(&child.inner, &target.inner) {
                return Some(vec![index]);
            }
            if let Some(mut rest) = child.find_path(target) {
                rest.insert(0, index);
                return Some(rest);
            }
        }
        None
    }

    /// Record `target`'s position under `name`. Returns false when `target`
    /// is not in this subtree.
    pub fn set_ref(&self, name: impl Into<String>, target: &Blueprint<T>) -> bool {
        match self.find_path(target) {
            Some(path) => {
                self.inner.borrow_mut().refs.insert(name.into(), path);
                true
            }
            None => false,
        }
    }

    fn instantiate_node(&self) -> Node<T> {
        let inner = self.inner.borrow();
        let node = Node::with_callbacks(Rc::clone(&inner.callback), Rc::clone(&inner.errback));
        for child in &inner.children {
            node.attach(child.instantiate_node());
        }
        node
    }

    /// Produce a live graph from this template. One pre-order traversal
    /// clones the nodes; the refs travel with the instance.
    pub fn instance(&self) -> Deferred<T> {
        Deferred {
            node: self.instantiate_node(),
            refs: Rc::new(self.inner.borrow().refs.clone()),
        }
    }

    /// A callable that, per invocation, instantiates this blueprint and
    /// drives the fresh root with the argument.
    pub fn wrapinstance(&self) -> impl Fn(T) -> Deferred<T> {
        let blueprint = self.clone();
        move |value| {
            let instance = blueprint.instance();
            instance.submit_success(value);
            instance
        }
    }
}

impl<T: Clone + 'static> Default for Blueprint<T> {
    fn default() -> Blueprint<T> {
        Blueprint::new()
    }
}

impl<T> fmt::Debug for Blueprint<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Blueprint")
            .field("children", &self.inner.borrow().children.len())
            .field("refs", &self.inner.borrow().refs.len())
            .finish()
    }
}

/// A linear pipeline template: each link holds at most one continuation.
///
/// Splice a chain into a live graph with [`Deferred::add_chain`]; the
/// template itself stays reusable.
pub struct Chain<T> {
    blueprint: Blueprint<T>,
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Chain<T> {
        Chain {
            blueprint: self.blueprint.clone(),
        }
    }
}

impl<T: Clone + 'static> Chain<T> {
    pub fn new() -> Chain<T> {
        Chain {
            blueprint: Blueprint::new(),
        }
    }

    pub fn with_callback(callback: impl Fn(T) -> Ret<T> + 'static) -> Chain<T> {
        Chain {
            blueprint: Blueprint::with_callback(callback),
        }
    }

    fn occupied(&self) -> bool {
        !self.blueprint.inner.borrow().children.is_empty()
    }

    /// Append the single continuation; fails if one is already present.
    pub fn add(&self, callback: impl Fn(T) -> Ret<T> + 'static) -> Result<Chain<T>> {
        if self.occupied() {
            return Err(Error::ChainOccupied);
        }
        Ok(Chain {
            blueprint: self.blueprint.add(callback),
        })
    }

    pub fn add_map(&self, callback: impl Fn(T) -> T + 'static) -> Result<Chain<T>> {
        self.add(move |value| Ret::Value(callback(value)))
    }

    /// Append a deep copy of another chain and return its tail, the point
    /// to keep extending from.
    pub fn add_chain(&self, other: &Chain<T>) -> Result<Chain<T>> {
        if self.occupied() {
            return Err(Error::ChainOccupied);
        }
        let copy = self.blueprint.add_node(&other.blueprint);
        let mut tail = Chain { blueprint: copy };
        while let Some(next) = {
            let children = tail.blueprint.inner.borrow().children.clone();
            children.first().cloned()
        } {
            tail = Chain { blueprint: next };
        }
        Ok(tail)
    }
}

impl<T: Clone + 'static> Default for Chain<T> {
    fn default() -> Chain<T> {
        Chain::new()
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Chain")
            .field("blueprint", &self.blueprint)
            .finish()
    }
}

/// The value a parked coroutine resumes with.
pub enum Resume<T> {
    Success(T),
    Error(Failure),
}

impl<T> Resume<T> {
    /// Unwrap into a plain result.
    pub fn into_result(self) -> std::result::Result<T, Failure> {
        match self {
            Resume::Success(value) => Ok(value),
            Resume::Error(err) => Err(err),
        }
    }
}

impl<T> fmt::Debug for Resume<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resume::Success(..) => fmt.write_str("Resume::Success"),
            Resume::Error(..) => fmt.write_str("Resume::Error"),
        }
    }
}

/// One step of a coroutine.
///
/// `Await` parks the coroutine on a deferred and names the continuation to
/// run with the tagged resumption value; `Return` and `Raise` finish it,
/// resolving the backing deferred exactly once.
pub enum Step<T> {
    Await(Deferred<T>, Box<dyn FnOnce(Resume<T>) -> Step<T>>),
    Return(T),
    Raise(Failure),
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Await(..) => fmt.write_str("Step::Await"),
            Step::Return(..) => fmt.write_str("Step::Return"),
            Step::Raise(..) => fmt.write_str("Step::Raise"),
        }
    }
}

/// Drives a [`Step`] state machine to completion.
///
/// Awaiting an already-resolved deferred resumes synchronously, without a
/// trip through the reactor.
#[derive(Debug)]
pub struct Coroutine<T> {
    deferred: Deferred<T>,
}

impl<T: Clone + 'static> Coroutine<T> {
    /// Start a coroutine.
    pub fn start(step: Step<T>) -> Coroutine<T> {
        let deferred = Deferred::new();
        advance(deferred.clone(), step);
        Coroutine { deferred }
    }

    /// Start a coroutine and return its backing deferred, resolved exactly
    /// once with the final value or error.
    pub fn spawn(step: Step<T>) -> Deferred<T> {
        Coroutine::start(step).deferred
    }

    /// The backing deferred.
    pub fn deferred(&self) -> &Deferred<T> {
        &self.deferred
    }

    pub fn synchronize(&self, timeout: Option<Duration>) -> Option<std::result::Result<T, Failure>> {
        self.deferred.synchronize(timeout)
    }
}

fn advance<T: Clone + 'static>(deferred: Deferred<T>, step: Step<T>) {
    match step {
        Step::Return(value) => deferred.submit_success(value),
        Step::Raise(err) => deferred.submit_error(err),
        Step::Await(target, continuation) => {
            // The continuation is one-shot but the target fires exactly one
            // of the two callbacks, so it is shared between them.
            let continuation = Rc::new(RefCell::new(Some(continuation)));
            let on_success = {
                let deferred = deferred.clone();
                let continuation = Rc::clone(&continuation);
                move |value: T| {
                    if let Some(k) = continuation.borrow_mut().take() {
                        advance(deferred.clone(), k(Resume::Success(value.clone())));
                    }
                    Ret::Value(value)
                }
            };
            let on_error = {
                let continuation = Rc::clone(&continuation);
                move |err: Failure| {
                    if let Some(k) = continuation.borrow_mut().take() {
                        advance(deferred.clone(), k(Resume::Error(err.clone())));
                    }
                    Ret::Fail(err)
                }
            };
            target.add_pair(on_success, on_error);
        }
    }
}

/// Fire-many publish/subscribe with permanent and one-shot listeners.
///
/// One-shot listeners are consumed by the fire that delivers to them.
pub struct Signal<T> {
    listeners: Vec<Box<dyn FnMut(&T)>>,
    once_listeners: Vec<Box<dyn FnOnce(&T)>>,
}

impl<T> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal {
            listeners: Vec::new(),
            once_listeners: Vec::new(),
        }
    }

    pub fn listen(&mut self, listener: impl FnMut(&T) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn listen_once(&mut self, listener: impl FnOnce(&T) + 'static) {
        self.once_listeners.push(Box::new(listener));
    }

    pub fn fire(&mut self, value: &T) {
        for listener in self.listeners.iter_mut() {
            listener(value);
        }
        for listener in self.once_listeners.drain(..) {
            listener(value);
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Signal<T> {
        Signal::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Signal")
            .field("listeners", &self.listeners.len())
            .field("once_listeners", &self.once_listeners.len())
            .finish()
    }
}

#[derive(Debug)]
struct PayloadTypeMismatch;

impl fmt::Display for PayloadTypeMismatch {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("threaded result had an unexpected type")
    }
}

impl std::error::Error for PayloadTypeMismatch {}

/// Run blocking `work` on a worker thread; the returned deferred resolves
/// on the reactor thread once the result is injected through the wake-up
/// channel.
pub fn threaded<T, F>(reactor: &Reactor, work: F) -> Deferred<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + 'static,
{
    let deferred = Deferred::new();
    let resolver = deferred.clone();
    let token = reactor.register_injection(Box::new(move |payload: InjectPayload| match payload {
        Ok(boxed) => match boxed.downcast::<T>() {
            Ok(value) => resolver.submit_success(*value),
            Err(_) => resolver.submit_error(failure(PayloadTypeMismatch)),
        },
        Err(err) => {
            let err: Box<dyn std::error::Error> = err;
            resolver.submit_error(Rc::from(err));
        }
    }));

    let waker = reactor.waker();
    thread::spawn(move || {
        let outcome = work().map(|value| Box::new(value) as Box<dyn Any + Send>);
        if let Err(err) = waker.inject(token, outcome) {
            warn!("dropping threaded coroutine result: {}", err);
        }
    });
    deferred
}
