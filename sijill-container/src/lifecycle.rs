//! Instance lifecycle.
//!
//! Every managed object lives in an [`InstanceRecord`] that walks a
//! strictly sequential state machine:
//!
//! ```text
//! CREATED → DEPENDENCIES_BOUND → BEFORE_INIT_HOOKS → INITIALIZED
//!         → AFTER_INIT_HOOKS → READY → BEFORE_DESTROY_HOOKS → DESTROYED
//! ```
//!
//! Any failure before READY parks the record in `FAILED`, which is
//! terminal. [`PostProcessor`]s run around the init hook and may replace
//! the instance with a wrapped one of the same type.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::definition::{ComponentDefinition, Instance};
use crate::error::{BoxError, LifecycleError, Result, SijillError};
use crate::event::{Event, EventBus};
use crate::handle::Dependencies;
use crate::scope::ScopeName;

/// Lifecycle states of an [`InstanceRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    DependenciesBound,
    BeforeInitHooks,
    Initialized,
    AfterInitHooks,
    Ready,
    BeforeDestroyHooks,
    Destroyed,
    /// Initialization failed. Terminal, never retried.
    Failed,
}

impl LifecycleState {
    /// The only state this one may advance to on the happy path.
    pub fn successor(&self) -> Option<LifecycleState> {
        use LifecycleState::*;
        match self {
            Created => Some(DependenciesBound),
            DependenciesBound => Some(BeforeInitHooks),
            BeforeInitHooks => Some(Initialized),
            Initialized => Some(AfterInitHooks),
            AfterInitHooks => Some(Ready),
            Ready => Some(BeforeDestroyHooks),
            BeforeDestroyHooks => Some(Destroyed),
            Destroyed | Failed => None,
        }
    }

    /// Checks whether `next` is a legal move from this state.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        if next == LifecycleState::Failed {
            return self.is_initializing();
        }
        self.successor() == Some(next)
    }

    /// States between CREATED and READY (exclusive).
    pub fn is_initializing(&self) -> bool {
        use LifecycleState::*;
        matches!(
            self,
            Created | DependenciesBound | BeforeInitHooks | Initialized | AfterInitHooks
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Destroyed | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "CREATED",
            LifecycleState::DependenciesBound => "DEPENDENCIES_BOUND",
            LifecycleState::BeforeInitHooks => "BEFORE_INIT_HOOKS",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::AfterInitHooks => "AFTER_INIT_HOOKS",
            LifecycleState::Ready => "READY",
            LifecycleState::BeforeDestroyHooks => "BEFORE_DESTROY_HOOKS",
            LifecycleState::Destroyed => "DESTROYED",
            LifecycleState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Which store owns a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Lives until container shutdown.
    Container,
    /// Handed to the caller; the container keeps no reference.
    Caller,
    /// Lives until `exit_scope(scope, context)`.
    Context { scope: String, context: String },
}

/// A managed object together with its definition and lifecycle state.
pub struct InstanceRecord {
    definition: Arc<ComponentDefinition>,
    instance: RwLock<Instance>,
    state: Mutex<LifecycleState>,
    owner: Owner,
    sequence: u64,
}

impl InstanceRecord {
    fn new(
        definition: Arc<ComponentDefinition>,
        instance: Instance,
        owner: Owner,
        sequence: u64,
    ) -> Self {
        Self {
            definition,
            instance: RwLock::new(instance),
            state: Mutex::new(LifecycleState::Created),
            owner,
            sequence,
        }
    }

    pub fn id(&self) -> &str {
        self.definition.id()
    }

    pub fn definition(&self) -> &Arc<ComponentDefinition> {
        &self.definition
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Creation sequence number, unique per container.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The current (possibly post-processed) object.
    pub fn instance(&self) -> Instance {
        self.instance.read().clone()
    }

    /// Views the object as `T`.
    ///
    /// # Errors
    /// [`SijillError::TypeMismatch`] when the definition neither produces
    /// nor declares `T`.
    pub fn get<T: ?Sized + 'static>(&self) -> Result<Arc<T>> {
        let instance = self.instance();
        self.definition
            .cast::<T>(&instance)
            .ok_or_else(|| SijillError::TypeMismatch {
                id: self.id().to_string(),
                requested: type_name::<T>().to_string(),
                provided: self.definition.describe_capabilities(),
            })
    }

    fn advance(&self, next: LifecycleState) -> std::result::Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(LifecycleError {
                id: self.id().to_string(),
                stage: *state,
                reason: format!("illegal transition {} → {}", *state, next),
            });
        }
        trace!(id = %self.id(), from = %*state, to = %next, "Lifecycle transition");
        *state = next;
        Ok(())
    }

    fn replace(&self, instance: Instance) {
        *self.instance.write() = instance;
    }
}

impl fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("owner", &self.owner)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Inspects or wraps instances around the init hook.
///
/// Returning a different object substitutes it for every later step.
/// The substitute must have the definition's produced type.
pub trait PostProcessor: Send + Sync {
    /// Runs in BEFORE_INIT_HOOKS, before the definition's init hook.
    fn before_init(
        &self,
        _definition: &ComponentDefinition,
        instance: Instance,
    ) -> std::result::Result<Instance, BoxError> {
        Ok(instance)
    }

    /// Runs in AFTER_INIT_HOOKS, after the init hook.
    fn after_init(
        &self,
        _definition: &ComponentDefinition,
        instance: Instance,
    ) -> std::result::Result<Instance, BoxError> {
        Ok(instance)
    }

    /// Name used in logs and errors.
    fn name(&self) -> &str {
        type_name::<Self>()
    }
}

/// A post-processor that wraps every initialized `T`.
///
/// ```rust
/// use std::sync::Arc;
/// use sijill_container::lifecycle::Decorator;
///
/// struct Mailer { retries: u32 }
///
/// let _retrying = Decorator::<Mailer>::new(|_id, mailer| {
///     Arc::new(Mailer { retries: mailer.retries + 3 })
/// });
/// ```
pub struct Decorator<T> {
    wrap: Box<dyn Fn(&str, Arc<T>) -> Arc<T> + Send + Sync>,
    _target: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Decorator<T> {
    pub fn new(wrap: impl Fn(&str, Arc<T>) -> Arc<T> + Send + Sync + 'static) -> Self {
        Self {
            wrap: Box::new(wrap),
            _target: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> PostProcessor for Decorator<T> {
    fn after_init(
        &self,
        definition: &ComponentDefinition,
        instance: Instance,
    ) -> std::result::Result<Instance, BoxError> {
        match instance.downcast::<T>() {
            Ok(concrete) => Ok((self.wrap)(definition.id(), concrete) as Instance),
            Err(untouched) => Ok(untouched),
        }
    }
}

/// Published on READY and DESTROYED when lifecycle events are enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub definition_id: String,
    pub scope: ScopeName,
    pub state: LifecycleState,
}

/// Drives records through their state machine.
pub(crate) struct LifecycleManager {
    post_processors: Vec<Arc<dyn PostProcessor>>,
    bus: Arc<EventBus>,
    publish_events: bool,
    sequence: AtomicU64,
}

impl LifecycleManager {
    pub fn new(
        post_processors: Vec<Arc<dyn PostProcessor>>,
        bus: Arc<EventBus>,
        publish_events: bool,
    ) -> Self {
        Self {
            post_processors,
            bus,
            publish_events,
            sequence: AtomicU64::new(0),
        }
    }

    /// Runs the factory and every init step.
    ///
    /// Returns a READY record. A failing step leaves the record FAILED
    /// and surfaces as [`SijillError::Lifecycle`].
    pub fn create(
        &self,
        definition: &Arc<ComponentDefinition>,
        dependencies: &Dependencies,
        owner: Owner,
    ) -> Result<Arc<InstanceRecord>> {
        let id = definition.id();

        let instance = guarded(|| (definition.factory())(dependencies)).map_err(|reason| {
            warn!(id = %id, reason = %reason, "Factory failed");
            SijillError::Lifecycle(LifecycleError {
                id: id.to_string(),
                stage: LifecycleState::Created,
                reason,
            })
        })?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let record = Arc::new(InstanceRecord::new(definition.clone(), instance, owner, sequence));

        match self.initialize(&record) {
            Ok(()) => {
                debug!(id = %id, scope = %definition.scope(), sequence, "Instance ready");
                Ok(record)
            }
            Err(err) => {
                warn!(id = %id, stage = %err.stage, reason = %err.reason, "Initialization failed");
                *record.state.lock() = LifecycleState::Failed;
                Err(SijillError::Lifecycle(err))
            }
        }
    }

    fn initialize(&self, record: &InstanceRecord) -> std::result::Result<(), LifecycleError> {
        let definition = record.definition.clone();
        let fail = |stage: LifecycleState, reason: String| LifecycleError {
            id: definition.id().to_string(),
            stage,
            reason,
        };

        record.advance(LifecycleState::DependenciesBound)?;

        record.advance(LifecycleState::BeforeInitHooks)?;
        for processor in &self.post_processors {
            let current = record.instance();
            let next = guarded(|| processor.before_init(&definition, current))
                .map_err(|r| fail(LifecycleState::BeforeInitHooks, format!("{}: {r}", processor.name())))?;
            self.substitute(record, next, processor.as_ref())
                .map_err(|r| fail(LifecycleState::BeforeInitHooks, r))?;
        }

        if let Some(hook) = definition.init_hook() {
            let current = record.instance();
            guarded(|| hook(&current)).map_err(|r| fail(LifecycleState::BeforeInitHooks, r))?;
        }
        record.advance(LifecycleState::Initialized)?;

        record.advance(LifecycleState::AfterInitHooks)?;
        for processor in &self.post_processors {
            let current = record.instance();
            let next = guarded(|| processor.after_init(&definition, current))
                .map_err(|r| fail(LifecycleState::AfterInitHooks, format!("{}: {r}", processor.name())))?;
            self.substitute(record, next, processor.as_ref())
                .map_err(|r| fail(LifecycleState::AfterInitHooks, r))?;
        }

        record.advance(LifecycleState::Ready)
    }

    fn substitute(
        &self,
        record: &InstanceRecord,
        next: Instance,
        processor: &dyn PostProcessor,
    ) -> std::result::Result<(), String> {
        let current = record.instance();
        if Arc::ptr_eq(&current, &next) {
            return Ok(());
        }
        let produced = record.definition.produces();
        if (*next).type_id() != produced.type_id() {
            return Err(format!(
                "{} replaced the instance with a type other than {}",
                processor.name(),
                produced
            ));
        }
        trace!(id = %record.id(), processor = %processor.name(), "Instance substituted");
        record.replace(next);
        Ok(())
    }

    /// Runs the destroy sequence of a READY record.
    ///
    /// The record always ends DESTROYED; a failing hook is reported but
    /// does not stop the transition. Records that are not READY are left
    /// untouched.
    pub fn destroy(
        &self,
        record: &InstanceRecord,
        run_hook: bool,
    ) -> std::result::Result<(), LifecycleError> {
        if record.state() != LifecycleState::Ready || record.advance(LifecycleState::BeforeDestroyHooks).is_err() {
            trace!(id = %record.id(), state = %record.state(), "Skipping destroy");
            return Ok(());
        }

        let outcome = match record.definition.destroy_hook() {
            Some(hook) if run_hook => {
                let current = record.instance();
                guarded(|| hook(&current)).map_err(|reason| LifecycleError {
                    id: record.id().to_string(),
                    stage: LifecycleState::BeforeDestroyHooks,
                    reason,
                })
            }
            _ => Ok(()),
        };

        if let Err(ref err) = outcome {
            warn!(id = %err.id, reason = %err.reason, "Destroy hook failed");
        }

        let _ = record.advance(LifecycleState::Destroyed);
        debug!(id = %record.id(), "Instance destroyed");
        self.announce(record);
        outcome
    }

    /// Publishes a [`LifecycleEvent`] for the record's current state.
    ///
    /// Listener failures are logged and swallowed.
    pub fn announce(&self, record: &InstanceRecord) {
        if !self.publish_events {
            return;
        }
        let event = Event::new(LifecycleEvent {
            definition_id: record.id().to_string(),
            scope: record.definition.scope().clone(),
            state: record.state(),
        });
        if let Err(err) = self.bus.publish(event) {
            warn!(id = %record.id(), error = %err, "Lifecycle event listener failed");
        }
    }
}

/// Runs user code, turning both errors and panics into a message.
pub(crate) fn guarded<T>(f: impl FnOnce() -> std::result::Result<T, BoxError>) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::settings::ContainerSettings;
    use std::sync::atomic::AtomicUsize;

    struct Mailer {
        retries: u32,
    }

    fn manager(processors: Vec<Arc<dyn PostProcessor>>) -> LifecycleManager {
        let bus = Arc::new(EventBus::new(&ContainerSettings::default()));
        LifecycleManager::new(processors, bus, false)
    }

    fn mailer_def() -> Arc<ComponentDefinition> {
        Arc::new(ComponentDefinition::builder("mailer", |_| Ok(Mailer { retries: 1 })).build())
    }

    #[test]
    fn happy_path_reaches_ready() {
        let lm = manager(vec![]);
        let record = lm
            .create(&mailer_def(), &Dependencies::empty("mailer"), Owner::Container)
            .unwrap();
        assert_eq!(record.state(), LifecycleState::Ready);
        assert_eq!(record.get::<Mailer>().unwrap().retries, 1);
    }

    #[test]
    fn transitions_are_sequential() {
        use LifecycleState::*;
        assert!(Created.can_transition_to(DependenciesBound));
        assert!(!Created.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Failed));
        assert!(Initialized.can_transition_to(Failed));
        assert!(Destroyed.successor().is_none());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn decorator_substitutes_instance() {
        let decorator: Arc<dyn PostProcessor> =
            Arc::new(Decorator::<Mailer>::new(|_, m| Arc::new(Mailer { retries: m.retries + 3 })));
        let lm = manager(vec![decorator]);

        let record = lm
            .create(&mailer_def(), &Dependencies::empty("mailer"), Owner::Container)
            .unwrap();
        assert_eq!(record.get::<Mailer>().unwrap().retries, 4);
    }

    #[test]
    fn substitute_with_other_type_fails() {
        struct Swap;
        impl PostProcessor for Swap {
            fn before_init(
                &self,
                _: &ComponentDefinition,
                _: Instance,
            ) -> std::result::Result<Instance, BoxError> {
                Ok(Arc::new(17u64))
            }
        }

        let lm = manager(vec![Arc::new(Swap)]);
        let err = lm
            .create(&mailer_def(), &Dependencies::empty("mailer"), Owner::Container)
            .unwrap_err();
        match err {
            SijillError::Lifecycle(e) => assert_eq!(e.stage, LifecycleState::BeforeInitHooks),
            other => panic!("Expected Lifecycle, got: {other:?}"),
        }
    }

    #[test]
    fn init_hook_error_is_lifecycle_error() {
        let def = Arc::new(
            ComponentDefinition::builder("mailer", |_| Ok(Mailer { retries: 0 }))
                .on_init(|m| {
                    if m.retries == 0 {
                        Err("no retries configured".into())
                    } else {
                        Ok(())
                    }
                })
                .build(),
        );

        let err = manager(vec![])
            .create(&def, &Dependencies::empty("mailer"), Owner::Container)
            .unwrap_err();
        assert!(err.to_string().contains("no retries configured"));
    }

    #[test]
    fn factory_panic_is_caught() {
        let def = Arc::new(
            ComponentDefinition::builder::<Mailer, _>("mailer", |_| panic!("wiring bug")).build(),
        );
        let err = manager(vec![])
            .create(&def, &Dependencies::empty("mailer"), Owner::Container)
            .unwrap_err();
        assert!(err.to_string().contains("wiring bug"));
    }

    #[test]
    fn destroy_runs_hook_once_and_continues_on_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let def = Arc::new(
            ComponentDefinition::builder("mailer", |_| Ok(Mailer { retries: 1 }))
                .on_destroy({
                    let calls = calls.clone();
                    move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("flush failed".into())
                    }
                })
                .build(),
        );

        let lm = manager(vec![]);
        let record = lm
            .create(&def, &Dependencies::empty("mailer"), Owner::Container)
            .unwrap();

        assert!(lm.destroy(&record, true).is_err());
        assert_eq!(record.state(), LifecycleState::Destroyed);

        assert!(lm.destroy(&record, true).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_without_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let def = Arc::new(
            ComponentDefinition::builder("mailer", |_| Ok(Mailer { retries: 1 }))
                .on_destroy({
                    let calls = calls.clone();
                    move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build(),
        );

        let lm = manager(vec![]);
        let record = lm
            .create(&def, &Dependencies::empty("mailer"), Owner::Container)
            .unwrap();
        lm.destroy(&record, false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(record.state(), LifecycleState::Destroyed);
    }
}
