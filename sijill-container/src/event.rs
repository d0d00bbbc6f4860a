//! Event bus.
//!
//! Listeners subscribe to an event type tag. An [`Event`] matches a
//! listener when its own type or one of its declared supertypes equals
//! that tag. Matching listeners run by ascending priority, ties in
//! subscription order.
//!
//! Sync listeners run on the publisher's thread. Their failures (errors
//! or panics) are collected while the remaining listeners still run, and
//! surface together as [`SijillError::Listener`]. Async listeners are
//! handed to the dispatch pool; their failures only reach the error sink.
//!
//! Transaction-phase listeners are skipped by `publish` and only run
//! through the matching `trigger_*` entry point.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::dispatch::{DispatchPool, DrainOutcome};
use crate::error::{BoxError, ListenerError, Result, SijillError};
use crate::key::TypeTag;
use crate::lifecycle::guarded;
use crate::settings::ContainerSettings;

type Payload = Arc<dyn Any + Send + Sync>;
type ViewFn = Arc<dyn Fn(&Payload) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Async failures kept for inspection; older ones are dropped first.
const ERROR_SINK_CAPACITY: usize = 1024;

/// Transaction boundary an external transaction manager reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    BeforeCommit,
    AfterCommit,
    AfterRollback,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionPhase::BeforeCommit => "before-commit",
            TransactionPhase::AfterCommit => "after-commit",
            TransactionPhase::AfterRollback => "after-rollback",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Inline, before `publish` returns.
    #[default]
    Sync,
    /// On the dispatch pool.
    Async,
}

/// How a listener is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListenerOptions {
    pub mode: DispatchMode,
    /// Lower runs first.
    pub priority: i32,
    /// Only run from the matching phase trigger.
    pub phase: Option<TransactionPhase>,
}

impl ListenerOptions {
    pub fn sync() -> Self {
        Self::default()
    }

    pub fn asynchronous() -> Self {
        Self {
            mode: DispatchMode::Async,
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn phase(mut self, phase: TransactionPhase) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Identifies a subscription. Ids increase in subscription order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One listener invocation that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub listener: ListenerId,
    /// Rendered event type
    pub event: String,
    pub reason: String,
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener {} on {}: {}", self.listener, self.event, self.reason)
    }
}

/// An immutable payload plus its type tags and metadata.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use sijill_container::event::Event;
///
/// trait Audited: Send + Sync {
///     fn actor(&self) -> &str;
/// }
///
/// struct OrderPlaced { by: String }
/// impl Audited for OrderPlaced {
///     fn actor(&self) -> &str { &self.by }
/// }
///
/// let event = Event::new(OrderPlaced { by: "ana".into() })
///     .with_supertype(|e: Arc<OrderPlaced>| e as Arc<dyn Audited>)
///     .with_metadata("correlation_id", "c-1");
///
/// assert_eq!(event.view::<dyn Audited>().unwrap().actor(), "ana");
/// assert_eq!(event.metadata("correlation_id"), Some("c-1"));
/// ```
#[derive(Clone)]
pub struct Event {
    tag: TypeTag,
    payload: Payload,
    views: Vec<(TypeTag, ViewFn)>,
    metadata: BTreeMap<String, String>,
    phase: Option<TransactionPhase>,
}

impl Event {
    pub fn new<P: Send + Sync + 'static>(payload: P) -> Self {
        let own: ViewFn = Arc::new(|payload: &Payload| {
            let concrete = payload.clone().downcast::<P>().ok()?;
            Some(Box::new(concrete) as Box<dyn Any + Send + Sync>)
        });
        Self {
            tag: TypeTag::of::<P>(),
            payload: Arc::new(payload),
            views: vec![(TypeTag::of::<P>(), own)],
            metadata: BTreeMap::new(),
            phase: None,
        }
    }

    /// Lets listeners of `S` receive this event, viewed through `upcast`.
    pub fn with_supertype<P, S, F>(mut self, upcast: F) -> Self
    where
        P: Send + Sync + 'static,
        S: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<P>) -> Arc<S> + Send + Sync + 'static,
    {
        let tag = TypeTag::of::<S>();
        if self.matches(&tag) {
            return self;
        }
        let view: ViewFn = Arc::new(move |payload: &Payload| {
            let concrete = payload.clone().downcast::<P>().ok()?;
            Some(Box::new(upcast(concrete)) as Box<dyn Any + Send + Sync>)
        });
        self.views.push((tag, view));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Declared supertypes, excluding the payload's own type.
    pub fn supertypes(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.views.iter().skip(1).map(|(tag, _)| *tag)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Phase this event was triggered in, if it came through a phase trigger.
    pub fn phase(&self) -> Option<TransactionPhase> {
        self.phase
    }

    /// The payload, if it is exactly a `P`.
    pub fn payload<P: 'static>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }

    /// The payload as `T`: its own type or a declared supertype.
    pub fn view<T: ?Sized + 'static>(&self) -> Option<Arc<T>> {
        let tag = TypeTag::of::<T>();
        let (_, view) = self.views.iter().find(|(t, _)| *t == tag)?;
        view(&self.payload)?.downcast::<Arc<T>>().ok().map(|b| *b)
    }

    pub fn matches(&self, tag: &TypeTag) -> bool {
        self.views.iter().any(|(t, _)| t == tag)
    }

    fn name(&self) -> String {
        self.tag.short_name()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("tag", &self.tag)
            .field("supertypes", &self.supertypes().collect::<Vec<_>>())
            .field("metadata", &self.metadata)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Something that reacts to events.
///
/// Implemented for every `Fn(&Event) -> Result<(), BoxError>`.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event) -> std::result::Result<(), BoxError>;
}

impl<F> Listener for F
where
    F: Fn(&Event) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> std::result::Result<(), BoxError> {
        self(event)
    }
}

struct Subscription {
    id: ListenerId,
    tag: TypeTag,
    listener: Arc<dyn Listener>,
    options: ListenerOptions,
}

/// Keeps async listener failures.
#[derive(Default)]
struct ErrorSink {
    failures: Mutex<VecDeque<ListenerFailure>>,
}

impl ErrorSink {
    fn record(&self, failure: ListenerFailure) {
        let mut failures = self.failures.lock();
        if failures.len() == ERROR_SINK_CAPACITY {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    fn snapshot(&self) -> Vec<ListenerFailure> {
        self.failures.lock().iter().cloned().collect()
    }
}

/// Routes events to subscribed listeners.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    pool: DispatchPool,
    sink: Arc<ErrorSink>,
}

impl EventBus {
    pub fn new(settings: &ContainerSettings) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            pool: DispatchPool::new(settings),
            sink: Arc::new(ErrorSink::default()),
        }
    }

    pub fn subscribe(
        &self,
        tag: TypeTag,
        listener: Arc<dyn Listener>,
        options: ListenerOptions,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(
            listener = %id,
            event = %tag,
            mode = ?options.mode,
            priority = options.priority,
            phase = ?options.phase,
            "Listener subscribed"
        );
        self.subscriptions.write().push(Subscription {
            id,
            tag,
            listener,
            options,
        });
        id
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Dispatches to every phase-less listener matching the event.
    ///
    /// # Errors
    /// - [`SijillError::Listener`] — one or more sync listeners failed
    /// - [`SijillError::DispatchQueueFull`] — an async listener could not be queued
    pub fn publish(&self, event: Event) -> Result<()> {
        self.dispatch(event, None)
    }

    pub fn trigger_before_commit(&self, event: Event) -> Result<()> {
        self.dispatch(event, Some(TransactionPhase::BeforeCommit))
    }

    pub fn trigger_after_commit(&self, event: Event) -> Result<()> {
        self.dispatch(event, Some(TransactionPhase::AfterCommit))
    }

    pub fn trigger_after_rollback(&self, event: Event) -> Result<()> {
        self.dispatch(event, Some(TransactionPhase::AfterRollback))
    }

    fn dispatch(&self, mut event: Event, phase: Option<TransactionPhase>) -> Result<()> {
        event.phase = phase;
        let name = event.name();

        // Snapshot so listeners may (un)subscribe while running.
        let mut matching: Vec<(ListenerId, Arc<dyn Listener>, ListenerOptions)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.options.phase == phase && event.matches(&s.tag))
            .map(|s| (s.id, s.listener.clone(), s.options))
            .collect();
        matching.sort_by_key(|(id, _, options)| (options.priority, *id));

        trace!(event = %name, listeners = matching.len(), phase = ?phase, "Dispatching event");

        let event = Arc::new(event);
        let mut failures = Vec::new();
        let mut queue_error = None;
        let mut unqueued = Vec::new();

        for (id, listener, options) in matching {
            match options.mode {
                DispatchMode::Sync => {
                    if let Err(reason) = guarded(|| listener.on_event(&event)) {
                        warn!(listener = %id, event = %name, reason = %reason, "Listener failed");
                        failures.push(ListenerFailure {
                            listener: id,
                            event: name.clone(),
                            reason,
                        });
                    }
                }
                DispatchMode::Async => {
                    let job = self.async_job(id, listener, event.clone(), name.clone());
                    match self.pool.submit(job) {
                        Ok(()) => {}
                        Err(SijillError::ContainerShutDown) => {
                            debug!(listener = %id, event = %name, "Dispatch pool closed, async listener skipped");
                        }
                        Err(err) => {
                            warn!(listener = %id, event = %name, error = %err, "Async listener not queued");
                            unqueued.push(ListenerFailure {
                                listener: id,
                                event: name.clone(),
                                reason: err.to_string(),
                            });
                            queue_error.get_or_insert(err);
                        }
                    }
                }
            }
        }

        // Sync failures win the return value; unqueued listeners ride along.
        if !failures.is_empty() {
            failures.extend(unqueued);
            return Err(SijillError::Listener(ListenerError {
                event: name,
                failures,
            }));
        }
        queue_error.map_or(Ok(()), Err)
    }

    fn async_job(
        &self,
        id: ListenerId,
        listener: Arc<dyn Listener>,
        event: Arc<Event>,
        name: String,
    ) -> Box<dyn FnOnce() + Send> {
        let sink = self.sink.clone();
        Box::new(move || {
            if let Err(reason) = guarded(|| listener.on_event(&event)) {
                warn!(listener = %id, event = %name, reason = %reason, "Async listener failed");
                sink.record(ListenerFailure {
                    listener: id,
                    event: name,
                    reason,
                });
            }
        })
    }

    /// Failures of async listeners so far, oldest first.
    pub fn async_failures(&self) -> Vec<ListenerFailure> {
        self.sink.snapshot()
    }

    /// Stops async dispatch. Pending work runs (`drain`) or is dropped,
    /// bounded by `timeout`.
    pub fn close(&self, timeout: Duration, drain: bool) -> DrainOutcome {
        self.pool.shutdown(timeout, drain)
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
