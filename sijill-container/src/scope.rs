//! Scopes and their instance stores.
//!
//! Scopes determine how long a managed instance lives:
//! - [`ScopeName::Singleton`] — one instance for the container lifetime
//! - [`ScopeName::Prototype`] — a fresh instance per request, owned by the caller
//! - [`ScopeName::Custom`] — one instance per externally supplied context id
//!   (a request, a session, a job run), destroyed on `exit_scope`
//!
//! # Ordering
//! Singleton outlives every custom scope, which outlives Prototype.
//! A longer-lived component never holds a direct reference into a
//! shorter-lived one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::definition::ComponentDefinition;
use crate::error::{LifecycleError, Result, ScopeError, SijillError};
use crate::lifecycle::{InstanceRecord, LifecycleState, Owner};

/// Names a scope.
///
/// # Examples
/// ```
/// use sijill_container::scope::ScopeName;
///
/// assert_eq!(ScopeName::parse("singleton"), ScopeName::Singleton);
/// assert_eq!(ScopeName::parse("request"), ScopeName::custom("request"));
/// assert!(ScopeName::Singleton.outlives(&ScopeName::custom("request")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum ScopeName {
    /// One shared instance, created at most once per container.
    Singleton,
    /// New instance on every request. Never cached.
    Prototype,
    /// One instance per active context of the named scope.
    Custom(String),
}

impl ScopeName {
    pub fn custom(name: impl Into<String>) -> Self {
        ScopeName::Custom(name.into())
    }

    /// Maps the two built-in names and treats anything else as custom.
    pub fn parse(name: &str) -> Self {
        match name {
            "singleton" => ScopeName::Singleton,
            "prototype" => ScopeName::Prototype,
            other => ScopeName::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ScopeName::Singleton => "singleton",
            ScopeName::Prototype => "prototype",
            ScopeName::Custom(name) => name,
        }
    }

    /// Singleton and custom scopes keep their instances.
    #[inline]
    pub fn is_cached(&self) -> bool {
        !matches!(self, ScopeName::Prototype)
    }

    #[inline]
    fn rank(&self) -> u8 {
        match self {
            ScopeName::Singleton => 2,
            ScopeName::Custom(_) => 1,
            ScopeName::Prototype => 0,
        }
    }

    /// Returns `true` if instances of `self` live strictly longer.
    pub fn outlives(&self, other: &ScopeName) -> bool {
        self.rank() > other.rank()
    }
}

impl From<String> for ScopeName {
    fn from(name: String) -> Self {
        ScopeName::parse(&name)
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The custom-scope contexts a resolution runs in.
///
/// Maps a scope name to the context id active for this caller, e.g.
/// `request → "req-42"`. There is no ambient "current" context; it is
/// always passed explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeContext {
    active: BTreeMap<String, String>,
}

impl ScopeContext {
    /// A context with no custom scopes.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, scope: impl Into<String>, context: impl Into<String>) -> Self {
        self.active.insert(scope.into(), context.into());
        self
    }

    pub fn context_for(&self, scope: &str) -> Option<&str> {
        self.active.get(scope).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Storage for the records of one custom-scope context.
///
/// The scope manager serialises creation per context, so a store only
/// needs to be safe for concurrent reads alongside single writers.
pub trait ScopeStore: Send + Sync {
    fn get(&self, definition_id: &str) -> Option<Arc<InstanceRecord>>;

    fn insert(&self, record: Arc<InstanceRecord>);

    /// Removes every record, oldest first.
    fn drain(&self) -> Vec<Arc<InstanceRecord>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default in-memory [`ScopeStore`].
#[derive(Default)]
pub struct MemoryScopeStore {
    records: RwLock<Vec<Arc<InstanceRecord>>>,
}

impl ScopeStore for MemoryScopeStore {
    fn get(&self, definition_id: &str) -> Option<Arc<InstanceRecord>> {
        self.records
            .read()
            .iter()
            .find(|r| r.id() == definition_id)
            .cloned()
    }

    fn insert(&self, record: Arc<InstanceRecord>) {
        self.records.write().push(record);
    }

    fn drain(&self) -> Vec<Arc<InstanceRecord>> {
        std::mem::take(&mut *self.records.write())
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

/// Creates a fresh store for each entered context.
pub type StoreFactory = Arc<dyn Fn() -> Box<dyn ScopeStore> + Send + Sync>;

/// Outcome cached in a singleton slot.
enum SlotState {
    Ready(Arc<InstanceRecord>),
    Failed(LifecycleError),
}

/// Per-definition exclusive section for singleton creation.
#[derive(Default)]
struct SingletonSlot {
    state: OnceCell<SlotState>,
    guard: ReentrantMutex<()>,
    creating: AtomicBool,
}

/// One active context of a custom scope.
struct ContextStore {
    store: Box<dyn ScopeStore>,
    guard: ReentrantMutex<()>,
    creating: Mutex<Vec<String>>,
    /// Definitions whose own creation failed in this context; terminal.
    failed: DashMap<String, LifecycleError>,
    closed: AtomicBool,
}

struct CustomScope {
    store_factory: StoreFactory,
    contexts: DashMap<String, Arc<ContextStore>>,
}

/// Owns the singleton slots and every custom-scope context.
pub(crate) struct ScopeManager {
    singletons: DashMap<String, Arc<SingletonSlot>>,
    creation_order: Mutex<Vec<Arc<InstanceRecord>>>,
    custom: HashMap<String, CustomScope>,
}

impl ScopeManager {
    pub fn new(custom_scopes: Vec<(String, StoreFactory)>) -> Self {
        let custom = custom_scopes
            .into_iter()
            .map(|(name, store_factory)| {
                (
                    name,
                    CustomScope {
                        store_factory,
                        contexts: DashMap::new(),
                    },
                )
            })
            .collect();

        Self {
            singletons: DashMap::new(),
            creation_order: Mutex::new(Vec::new()),
            custom,
        }
    }

    /// Checks that a definition's scope can be served.
    pub fn check_known(&self, scope: &ScopeName) -> Result<()> {
        match scope {
            ScopeName::Custom(name) if !self.custom.contains_key(name) => {
                Err(ScopeError::UnknownScope { scope: name.clone() }.into())
            }
            _ => Ok(()),
        }
    }

    pub fn custom_scope_names(&self) -> Vec<String> {
        self.custom.keys().cloned().collect()
    }

    /// Returns the cached READY singleton, if any.
    pub fn cached_singleton(&self, id: &str) -> Option<Arc<InstanceRecord>> {
        let slot = self.singletons.get(id)?.clone();
        match slot.state.get() {
            Some(SlotState::Ready(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// State of a singleton, if its creation was ever attempted.
    pub fn singleton_state(&self, id: &str) -> Option<LifecycleState> {
        let slot = self.singletons.get(id)?.clone();
        match slot.state.get() {
            Some(SlotState::Ready(record)) => Some(record.state()),
            Some(SlotState::Failed(_)) => Some(LifecycleState::Failed),
            None => None,
        }
    }

    /// Returns the instance for `definition` in `context`, creating it
    /// with `create` when the scope has none yet.
    ///
    /// The flag is `true` when this call created the record.
    pub fn obtain<F>(
        &self,
        definition: &ComponentDefinition,
        context: &ScopeContext,
        create: F,
    ) -> Result<(Arc<InstanceRecord>, bool)>
    where
        F: FnOnce(Owner) -> Result<Arc<InstanceRecord>>,
    {
        match definition.scope() {
            ScopeName::Singleton => self.obtain_singleton(definition.id(), create),
            ScopeName::Prototype => create(Owner::Caller).map(|r| (r, true)),
            ScopeName::Custom(scope) => self.obtain_scoped(scope, definition.id(), context, create),
        }
    }

    fn obtain_singleton<F>(&self, id: &str, create: F) -> Result<(Arc<InstanceRecord>, bool)>
    where
        F: FnOnce(Owner) -> Result<Arc<InstanceRecord>>,
    {
        let slot = self
            .singletons
            .entry(id.to_string())
            .or_default()
            .value()
            .clone();

        // Fast path: already published.
        if let Some(state) = slot.state.get() {
            return Self::read_slot(state).map(|r| (r, false));
        }

        let _guard = slot.guard.lock();
        if let Some(state) = slot.state.get() {
            return Self::read_slot(state).map(|r| (r, false));
        }
        if slot.creating.swap(true, Ordering::SeqCst) {
            return Err(Self::reentrant(id));
        }

        trace!(id = %id, "Creating singleton");
        let outcome = create(Owner::Container);
        slot.creating.store(false, Ordering::SeqCst);

        match outcome {
            Ok(record) => {
                let _ = slot.state.set(SlotState::Ready(record.clone()));
                self.creation_order.lock().push(record.clone());
                Ok((record, true))
            }
            // Only this definition's own failure is terminal; a failing
            // dependency leaves the slot empty.
            Err(SijillError::Lifecycle(err)) if err.id == id => {
                let _ = slot.state.set(SlotState::Failed(err.clone()));
                Err(SijillError::Lifecycle(err))
            }
            Err(other) => Err(other),
        }
    }

    fn read_slot(state: &SlotState) -> Result<Arc<InstanceRecord>> {
        match state {
            SlotState::Ready(record) => Ok(record.clone()),
            SlotState::Failed(err) => Err(SijillError::Lifecycle(err.clone())),
        }
    }

    fn reentrant(id: &str) -> SijillError {
        SijillError::Lifecycle(LifecycleError {
            id: id.to_string(),
            stage: LifecycleState::Created,
            reason: "instance requested again while it is still being created; \
                     use a lazy dependency and dereference it after start-up"
                .to_string(),
        })
    }

    fn obtain_scoped<F>(
        &self,
        scope: &str,
        id: &str,
        context: &ScopeContext,
        create: F,
    ) -> Result<(Arc<InstanceRecord>, bool)>
    where
        F: FnOnce(Owner) -> Result<Arc<InstanceRecord>>,
    {
        let context_id = context.context_for(scope).ok_or_else(|| ScopeError::NoActiveContext {
            id: id.to_string(),
            scope: scope.to_string(),
        })?;
        let store = self.context_store(scope, context_id)?;

        if let Some(record) = store.store.get(id) {
            return Ok((record, false));
        }

        let _guard = store.guard.lock();
        if store.closed.load(Ordering::SeqCst) {
            return Err(Self::unknown_context(scope, context_id));
        }
        if let Some(record) = store.store.get(id) {
            return Ok((record, false));
        }
        if let Some(err) = store.failed.get(id) {
            return Err(SijillError::Lifecycle(err.value().clone()));
        }
        {
            let mut creating = store.creating.lock();
            if creating.iter().any(|c| c == id) {
                return Err(Self::reentrant(id));
            }
            creating.push(id.to_string());
        }

        trace!(id = %id, scope = %scope, context = %context_id, "Creating scoped instance");
        let outcome = create(Owner::Context {
            scope: scope.to_string(),
            context: context_id.to_string(),
        });
        store.creating.lock().retain(|c| c != id);

        match outcome {
            Ok(record) => {
                store.store.insert(record.clone());
                Ok((record, true))
            }
            Err(SijillError::Lifecycle(err)) if err.id == id => {
                store.failed.insert(id.to_string(), err.clone());
                Err(SijillError::Lifecycle(err))
            }
            Err(other) => Err(other),
        }
    }

    fn context_store(&self, scope: &str, context_id: &str) -> Result<Arc<ContextStore>> {
        let custom = self.custom.get(scope).ok_or_else(|| ScopeError::UnknownScope {
            scope: scope.to_string(),
        })?;
        custom
            .contexts
            .get(context_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Self::unknown_context(scope, context_id))
    }

    fn unknown_context(scope: &str, context_id: &str) -> SijillError {
        ScopeError::UnknownContext {
            scope: scope.to_string(),
            context: context_id.to_string(),
        }
        .into()
    }

    /// Opens a context of a custom scope.
    pub fn enter(&self, scope: &str, context_id: &str) -> Result<()> {
        let custom = self.custom.get(scope).ok_or_else(|| {
            if scope == "singleton" || scope == "prototype" {
                ScopeError::Reserved { scope: scope.to_string() }
            } else {
                ScopeError::UnknownScope { scope: scope.to_string() }
            }
        })?;

        match custom.contexts.entry(context_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ScopeError::ContextAlreadyActive {
                scope: scope.to_string(),
                context: context_id.to_string(),
            }
            .into()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(ContextStore {
                    store: (custom.store_factory)(),
                    guard: ReentrantMutex::new(()),
                    creating: Mutex::new(Vec::new()),
                    failed: DashMap::new(),
                    closed: AtomicBool::new(false),
                }));
                debug!(scope = %scope, context = %context_id, "Entered scope");
                Ok(())
            }
        }
    }

    /// Closes a context and hands back its records, oldest first.
    pub fn exit(&self, scope: &str, context_id: &str) -> Result<Vec<Arc<InstanceRecord>>> {
        let custom = self.custom.get(scope).ok_or_else(|| ScopeError::UnknownScope {
            scope: scope.to_string(),
        })?;
        let (_, store) = custom
            .contexts
            .remove(context_id)
            .ok_or_else(|| Self::unknown_context(scope, context_id))?;

        let _guard = store.guard.lock();
        store.closed.store(true, Ordering::SeqCst);
        let records = store.store.drain();
        debug!(scope = %scope, context = %context_id, records = records.len(), "Exited scope");
        Ok(records)
    }

    /// Every active `(scope, context)` pair.
    pub fn active_contexts(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (name, custom) in &self.custom {
            for entry in custom.contexts.iter() {
                pairs.push((name.clone(), entry.key().clone()));
            }
        }
        pairs.sort();
        pairs
    }

    /// Takes every READY singleton in creation order.
    pub fn drain_singletons(&self) -> Vec<Arc<InstanceRecord>> {
        std::mem::take(&mut *self.creation_order.lock())
    }
}
