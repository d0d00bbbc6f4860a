//! End-to-end behaviour of the container through its public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sijill_container::error::ScopeError;
use sijill_container::lifecycle::InstanceRecord;
use sijill_container::prelude::*;
use sijill_support::logging::init_tracing;

// === Fixtures ===

trait Clock: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
}

#[derive(Debug)]
struct NamedClock(&'static str);

impl Clock for NamedClock {
    fn name(&self) -> &'static str {
        self.0
    }
}

#[derive(Debug)]
struct Config {
    url: String,
}

struct Repository {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

struct Service {
    repository: Arc<Repository>,
    plugins: Vec<Arc<dyn Clock>>,
}

fn clock(id: &'static str) -> DefinitionBuilder<NamedClock> {
    ComponentDefinition::builder(id, move |_| Ok(NamedClock(id)))
        .capability::<dyn Clock, _>(|c| c as Arc<dyn Clock>)
}

fn application() -> Container {
    init_tracing("sijill=debug");

    Container::builder()
        .definition(
            ComponentDefinition::builder("config", |_| {
                Ok(Config {
                    url: "postgres://localhost/app".into(),
                })
            })
            .build(),
        )
        .definition(clock("wall").build())
        .definition(
            ComponentDefinition::builder("repository", |deps| {
                Ok(Repository {
                    config: deps.get::<Config>(0)?,
                    clock: deps.get::<dyn Clock>(1)?,
                })
            })
            .depends_on(Requirement::of::<Config>())
            .depends_on(Requirement::of::<dyn Clock>())
            .build(),
        )
        .definition(
            ComponentDefinition::builder("service", |deps| {
                Ok(Service {
                    repository: deps.get::<Repository>(0)?,
                    plugins: deps.all::<dyn Clock>(1)?,
                })
            })
            .prototype()
            .depends_on(Requirement::of::<Repository>())
            .depends_on(Requirement::of::<dyn Clock>().collection())
            .build(),
        )
        .build()
        .expect("Failed to build container")
}

// === Resolution ===

#[test]
fn acyclic_graph_resolves_to_ready_instance() {
    let container = application();

    let record = container.get_instance(&Request::of::<Service>()).unwrap();
    assert_eq!(record.state(), LifecycleState::Ready);

    let service = record.get::<Service>().unwrap();
    assert_eq!(service.repository.config.url, "postgres://localhost/app");
    assert_eq!(service.repository.clock.name(), "wall");
    assert_eq!(service.plugins.len(), 1);

    assert_eq!(container.state_of("repository"), Some(LifecycleState::Ready));
    assert_eq!(container.state_of("config"), Some(LifecycleState::Ready));
}

#[test]
fn singleton_shared_prototype_fresh() {
    let container = application();

    let a = container.get::<Repository>().unwrap();
    let b = container.get_by_id::<Repository>("repository").unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let first = container.get::<Service>().unwrap();
    let second = container.get::<Service>().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first.repository, &second.repository));
}

#[test]
fn concurrent_first_access_creates_once() {
    let created = Arc::new(AtomicUsize::new(0));
    let container = Container::builder()
        .definition(
            ComponentDefinition::builder("slow", {
                let created = created.clone();
                move |_| {
                    created.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(Config { url: String::new() })
                }
            })
            .build(),
        )
        .build()
        .unwrap();

    let instances: Vec<Arc<Config>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| s.spawn(|| container.get::<Config>().unwrap()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
}

// === Cycles ===

#[derive(Debug)]
struct Alpha {
    beta: Deferred<Beta>,
}

struct Beta {
    alpha: Arc<Alpha>,
}

fn cyclic(lazy: bool) -> Container {
    let to_beta = if lazy {
        Requirement::of::<Beta>().lazy()
    } else {
        Requirement::of::<Beta>()
    };

    Container::builder()
        .definition(
            ComponentDefinition::builder("a", |deps| {
                Ok(Alpha {
                    beta: deps.lazy::<Beta>(0)?,
                })
            })
            .depends_on(to_beta)
            .build(),
        )
        .definition(
            ComponentDefinition::builder("b", |deps| {
                Ok(Beta {
                    alpha: deps.get::<Alpha>(0)?,
                })
            })
            .depends_on(Requirement::of::<Alpha>())
            .build(),
        )
        .build()
        .unwrap()
}

#[test]
fn cycle_without_lazy_edge_is_reported() {
    let container = cyclic(false);

    match container.get::<Alpha>() {
        Err(SijillError::CircularDependency(e)) => {
            assert!(e.involves("a"));
            assert!(e.involves("b"));
            assert_eq!(e.chain.first(), e.chain.last());
        }
        other => panic!("Expected CircularDependency, got: {other:?}"),
    }
    assert!(matches!(
        container.validate(),
        Err(SijillError::CircularDependency(_))
    ));
}

#[test]
fn cycle_with_lazy_edge_resolves() {
    let container = cyclic(true);
    container.validate().unwrap();
    container.start().unwrap();

    let alpha = container.get::<Alpha>().unwrap();
    let beta = alpha.beta.get().unwrap();
    assert!(Arc::ptr_eq(&beta.alpha, &alpha));
    assert!(alpha.beta.is_resolved());
}

// === Candidate selection ===

fn three_clocks(primary: bool) -> Container {
    let mono = if primary {
        clock("mono").primary().build()
    } else {
        clock("mono").build()
    };

    Container::builder()
        .definition(clock("wall").build())
        .definition(mono)
        .definition(clock("fake").qualifier("test").build())
        .build()
        .unwrap()
}

#[test]
fn primary_wins_among_three() {
    let container = three_clocks(true);
    assert_eq!(container.get::<dyn Clock>().unwrap().name(), "mono");
}

#[test]
fn three_without_primary_is_ambiguous() {
    let container = three_clocks(false);

    match container.get::<dyn Clock>() {
        Err(SijillError::AmbiguousDependency(e)) => {
            assert_eq!(e.candidates, vec!["wall", "mono", "fake"]);
        }
        other => panic!("Expected AmbiguousDependency, got: {other:?}"),
    }
}

#[test]
fn qualifier_and_collection_disambiguate() {
    let container = three_clocks(false);

    assert_eq!(container.get_qualified::<dyn Clock>("test").unwrap().name(), "fake");
    assert_eq!(container.get_qualified::<dyn Clock>("wall").unwrap().name(), "wall");

    let names: Vec<_> = container
        .get_all::<dyn Clock>()
        .unwrap()
        .iter()
        .map(|c| c.name())
        .collect();
    assert_eq!(names, vec!["wall", "mono", "fake"]);
}

#[test]
fn mark_primary_before_first_resolution() {
    let container = three_clocks(false);
    container.mark_primary("fake").unwrap();
    assert_eq!(container.get::<dyn Clock>().unwrap().name(), "fake");
    assert!(matches!(
        container.mark_primary("wall"),
        Err(SijillError::ContainerFrozen)
    ));
}

// === Lifecycle ===

#[test]
fn failed_singleton_is_not_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let container = Container::builder()
        .definition(
            ComponentDefinition::builder("flaky", {
                let attempts = attempts.clone();
                move |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(Config { url: String::new() })
                }
            })
            .on_init(|_| Err("connection refused".into()))
            .build(),
        )
        .build()
        .unwrap();

    for _ in 0..2 {
        match container.get::<Config>() {
            Err(SijillError::Lifecycle(e)) => {
                assert_eq!(e.id, "flaky");
                assert!(e.reason.contains("connection refused"));
            }
            other => panic!("Expected Lifecycle, got: {other:?}"),
        }
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(container.state_of("flaky"), Some(LifecycleState::Failed));
}

#[test]
fn shutdown_destroys_dependents_first() {
    struct Dependent;

    let destroyed = Arc::new(Mutex::new(Vec::new()));

    let container = Container::builder()
        .definition(
            ComponentDefinition::builder("s2", |deps| {
                deps.get::<Config>(0)?;
                Ok(Dependent)
            })
            .depends_on(Requirement::of::<Config>())
            .on_destroy({
                let destroyed = destroyed.clone();
                move |_| {
                    destroyed.lock().push("s2");
                    Ok(())
                }
            })
            .build(),
        )
        .definition(
            ComponentDefinition::builder("s1", |_| Ok(Config { url: String::new() }))
                .on_destroy({
                    let destroyed = destroyed.clone();
                    move |_| {
                        destroyed.lock().push("s1");
                        Ok(())
                    }
                })
                .build(),
        )
        .build()
        .unwrap();

    container.start().unwrap();
    let report = container.shutdown(Duration::from_secs(1)).unwrap();

    assert_eq!(*destroyed.lock(), vec!["s2", "s1"]);
    assert_eq!(report.destroyed, vec!["s2", "s1"]);
    assert!(report.is_clean());
}

#[test]
fn destroy_failure_does_not_stop_teardown() {
    let container = Container::builder()
        .definition(
            ComponentDefinition::builder("first", |_| Ok(Config { url: String::new() }))
                .on_destroy(|_| Ok(()))
                .build(),
        )
        .definition(
            ComponentDefinition::builder("second", |_| Ok(NamedClock("x")))
                .on_destroy(|_| Err("flush failed".into()))
                .build(),
        )
        .build()
        .unwrap();

    container.start().unwrap();
    let report = container.shutdown(Duration::from_secs(1)).unwrap();

    assert_eq!(report.destroyed, vec!["second", "first"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, "second");
    assert!(!report.is_clean());
}

#[test]
fn singleton_finishing_during_shutdown_is_destroyed() {
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let destroy_hooks = Arc::new(AtomicUsize::new(0));

    let container = Container::builder()
        .definition(
            ComponentDefinition::builder("slow", move |_| {
                let _ = started_tx.send(());
                let _ = gate_rx.lock().recv();
                Ok(Config { url: String::new() })
            })
            .on_destroy({
                let destroy_hooks = destroy_hooks.clone();
                move |_| {
                    destroy_hooks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build(),
        )
        .build()
        .unwrap();

    std::thread::scope(|s| {
        let late = s.spawn(|| container.get::<Config>());
        started_rx.recv().unwrap();

        // The instance is still being built, so the drain cannot see it.
        let report = container.shutdown(Duration::from_secs(1)).unwrap();
        assert!(report.destroyed.is_empty());

        gate_tx.send(()).unwrap();
        match late.join().unwrap() {
            Err(SijillError::ContainerShutDown) => {}
            other => panic!("Expected ContainerShutDown, got: {other:?}"),
        }
    });

    assert_eq!(destroy_hooks.load(Ordering::SeqCst), 1);
    assert_eq!(container.state_of("slow"), Some(LifecycleState::Destroyed));
}

// === Custom scopes ===

struct RequestState {
    id: usize,
}

#[test]
fn exit_scope_only_touches_its_context() {
    let next = Arc::new(AtomicUsize::new(0));
    let destroyed = Arc::new(Mutex::new(Vec::new()));

    let container = Container::builder()
        .custom_scope("request")
        .definition(
            ComponentDefinition::builder("request_state", {
                let next = next.clone();
                move |_| {
                    Ok(RequestState {
                        id: next.fetch_add(1, Ordering::SeqCst),
                    })
                }
            })
            .in_scope("request")
            .on_destroy({
                let destroyed = destroyed.clone();
                move |s| {
                    destroyed.lock().push(s.id);
                    Ok(())
                }
            })
            .build(),
        )
        .build()
        .unwrap();

    container.enter_scope("request", "req-42").unwrap();
    container.enter_scope("request", "req-7").unwrap();

    let req42 = container.in_context(ScopeContext::none().with("request", "req-42"));
    let req7 = container.in_context(ScopeContext::none().with("request", "req-7"));

    let a = req42.get::<RequestState>().unwrap();
    let again = req42.get::<RequestState>().unwrap();
    let b = req7.get::<RequestState>().unwrap();
    assert!(Arc::ptr_eq(&a, &again));
    assert!(!Arc::ptr_eq(&a, &b));

    let report = container.exit_scope("request", "req-42").unwrap();
    assert_eq!(report.destroyed, vec!["request_state"]);
    assert_eq!(*destroyed.lock(), vec![a.id]);

    // The other context is untouched and still serves its instance.
    assert!(Arc::ptr_eq(&req7.get::<RequestState>().unwrap(), &b));
    assert!(matches!(
        req42.get::<RequestState>(),
        Err(SijillError::Scope(ScopeError::UnknownContext { .. }))
    ));
}

/// Store that logs every insert into a log shared by all its contexts.
struct RecordingStore {
    records: Mutex<Vec<Arc<InstanceRecord>>>,
    inserted: Arc<Mutex<Vec<String>>>,
}

impl ScopeStore for RecordingStore {
    fn get(&self, definition_id: &str) -> Option<Arc<InstanceRecord>> {
        self.records
            .lock()
            .iter()
            .find(|r| r.id() == definition_id)
            .cloned()
    }

    fn insert(&self, record: Arc<InstanceRecord>) {
        self.inserted.lock().push(record.id().to_string());
        self.records.lock().push(record);
    }

    fn drain(&self) -> Vec<Arc<InstanceRecord>> {
        std::mem::take(&mut *self.records.lock())
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }
}

struct TraceId {
    state: Arc<RequestState>,
}

#[test]
fn custom_store_backs_each_context() {
    let stores_made = Arc::new(AtomicUsize::new(0));
    let inserted = Arc::new(Mutex::new(Vec::new()));
    let destroyed = Arc::new(Mutex::new(Vec::new()));

    let container = Container::builder()
        .custom_scope_with("request", {
            let stores_made = stores_made.clone();
            let inserted = inserted.clone();
            move || {
                stores_made.fetch_add(1, Ordering::SeqCst);
                Box::new(RecordingStore {
                    records: Mutex::new(Vec::new()),
                    inserted: inserted.clone(),
                }) as Box<dyn ScopeStore>
            }
        })
        .definition(
            ComponentDefinition::builder("request_state", |_| Ok(RequestState { id: 1 }))
                .in_scope("request")
                .on_destroy({
                    let destroyed = destroyed.clone();
                    move |_| {
                        destroyed.lock().push("request_state");
                        Ok(())
                    }
                })
                .build(),
        )
        .definition(
            ComponentDefinition::builder("trace_id", |deps| {
                Ok(TraceId {
                    state: deps.get::<RequestState>(0)?,
                })
            })
            .in_scope("request")
            .depends_on(Requirement::of::<RequestState>())
            .on_destroy({
                let destroyed = destroyed.clone();
                move |_| {
                    destroyed.lock().push("trace_id");
                    Ok(())
                }
            })
            .build(),
        )
        .build()
        .unwrap();

    container.enter_scope("request", "req-1").unwrap();
    assert_eq!(stores_made.load(Ordering::SeqCst), 1);
    container.enter_scope("request", "req-2").unwrap();
    assert_eq!(stores_made.load(Ordering::SeqCst), 2);

    let req1 = container.in_context(ScopeContext::none().with("request", "req-1"));
    let trace = req1.get::<TraceId>().unwrap();
    assert_eq!(trace.state.id, 1);
    assert_eq!(*inserted.lock(), vec!["request_state", "trace_id"]);

    // Served from the store, nothing new is inserted.
    assert!(Arc::ptr_eq(&req1.get::<TraceId>().unwrap(), &trace));
    assert_eq!(inserted.lock().len(), 2);

    let report = container.exit_scope("request", "req-1").unwrap();
    assert_eq!(report.destroyed, vec!["trace_id", "request_state"]);
    assert_eq!(*destroyed.lock(), vec!["trace_id", "request_state"]);

    // The untouched context still has an empty store of its own.
    let report = container.exit_scope("request", "req-2").unwrap();
    assert!(report.destroyed.is_empty());
    assert_eq!(stores_made.load(Ordering::SeqCst), 2);
}

#[test]
fn singleton_cannot_hold_request_scoped() {
    struct Cache;

    let container = Container::builder()
        .custom_scope("request")
        .definition(
            ComponentDefinition::builder("request_state", |_| Ok(RequestState { id: 0 }))
                .in_scope("request")
                .build(),
        )
        .definition(
            ComponentDefinition::builder("cache", |deps| {
                deps.get::<RequestState>(0)?;
                Ok(Cache)
            })
            .depends_on(Requirement::of::<RequestState>())
            .build(),
        )
        .build()
        .unwrap();

    assert!(matches!(
        container.validate(),
        Err(SijillError::Scope(ScopeError::InvalidNesting { .. }))
    ));
}

// === Events ===

struct OrderPlaced {
    id: u64,
}

#[test]
fn listeners_run_by_priority_and_failures_aggregate() {
    let container = Container::builder().build().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    for (label, priority, fail) in [("p2", 2, false), ("p1-first", 1, true), ("p1-second", 1, false)] {
        let calls = calls.clone();
        container.listen::<OrderPlaced, _>(
            move |order| {
                calls.lock().push((label, order.id));
                if fail {
                    return Err(format!("{label} rejected").into());
                }
                Ok(())
            },
            ListenerOptions::sync().priority(priority),
        );
    }

    match container.publish(Event::new(OrderPlaced { id: 9 })) {
        Err(SijillError::Listener(e)) => {
            assert_eq!(e.failures.len(), 1);
            assert!(e.failures[0].reason.contains("p1-first rejected"));
        }
        other => panic!("Expected Listener, got: {other:?}"),
    }
    assert_eq!(
        *calls.lock(),
        vec![("p1-first", 9), ("p1-second", 9), ("p2", 9)]
    );
}

#[test]
fn async_failures_go_to_the_sink() {
    let container = Container::builder().build().unwrap();
    container.listen::<OrderPlaced, _>(
        |_| Err("mail server down".into()),
        ListenerOptions::asynchronous(),
    );

    container.publish(Event::new(OrderPlaced { id: 1 })).unwrap();
    let report = container.shutdown(Duration::from_secs(5)).unwrap();
    assert!(report.drain.completed);

    let failures = container.async_listener_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].reason.contains("mail server down"));
}

#[test]
fn phase_listeners_wait_for_their_trigger() {
    let container = Container::builder().build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for phase in [TransactionPhase::AfterCommit, TransactionPhase::AfterRollback] {
        let seen = seen.clone();
        container.listen::<OrderPlaced, _>(
            move |order| {
                seen.lock().push((phase, order.id));
                Ok(())
            },
            ListenerOptions::sync().phase(phase),
        );
    }

    container.publish(Event::new(OrderPlaced { id: 1 })).unwrap();
    assert!(seen.lock().is_empty());

    container.trigger_after_commit(Event::new(OrderPlaced { id: 2 })).unwrap();
    container.trigger_after_rollback(Event::new(OrderPlaced { id: 3 })).unwrap();
    container.trigger_before_commit(Event::new(OrderPlaced { id: 4 })).unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            (TransactionPhase::AfterCommit, 2),
            (TransactionPhase::AfterRollback, 3),
        ]
    );
}

// === Sources ===

struct ClockSource;

impl DefinitionSource for ClockSource {
    fn definitions(&self) -> Vec<ComponentDefinition> {
        vec![clock("wall").build(), clock("mono").build()]
    }
}

#[test]
fn definitions_from_source() {
    let container = Container::builder()
        .add_source(&ClockSource)
        .primary("wall")
        .build()
        .unwrap();

    assert_eq!(container.find_by_type::<dyn Clock>(None).len(), 2);
    assert_eq!(container.get::<dyn Clock>().unwrap().name(), "wall");
}
