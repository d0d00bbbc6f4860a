//! # The Container — heart of Sijill
//!
//! Ties the registry, resolver, scope manager, lifecycle manager and
//! event bus together behind one API.
//!
//! # Architecture
//! ```text
//! ContainerBuilder  ──build()──>  Container ──in_context(ctx)──> ScopedContainer
//!                                    │
//!                 get / get_instance │
//!                                    ▼
//!          Planner (graph) ──plan──> materialize ──> ScopeManager::obtain
//!                                                       │
//!                                                       ▼
//!                                             LifecycleManager::create
//! ```
//!
//! # Examples
//! ```rust
//! use sijill_container::prelude::*;
//! use std::sync::Arc;
//!
//! trait Logger: Send + Sync {
//!     fn log(&self, msg: &str) -> String;
//! }
//!
//! struct ConsoleLogger;
//! impl Logger for ConsoleLogger {
//!     fn log(&self, msg: &str) -> String { format!("[LOG] {msg}") }
//! }
//!
//! struct UserService {
//!     logger: Arc<dyn Logger>,
//! }
//!
//! let container = Container::builder()
//!     .definition(
//!         ComponentDefinition::builder("logger", |_| Ok(ConsoleLogger))
//!             .capability::<dyn Logger, _>(|l| l as Arc<dyn Logger>)
//!             .build(),
//!     )
//!     .definition(
//!         ComponentDefinition::builder("users", |deps| {
//!             Ok(UserService { logger: deps.get::<dyn Logger>(0)? })
//!         })
//!         .prototype()
//!         .depends_on(Requirement::of::<dyn Logger>())
//!         .build(),
//!     )
//!     .build()
//!     .expect("Failed to build container");
//!
//! let service = container.get::<UserService>().expect("Failed to resolve");
//! assert_eq!(service.logger.log("hi"), "[LOG] hi");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, trace, warn};

use crate::definition::ComponentDefinition;
use crate::dispatch::DrainOutcome;
use crate::error::{BoxError, LifecycleError, Result, ScopeError, SijillError};
use crate::event::{Event, EventBus, Listener, ListenerFailure, ListenerId, ListenerOptions};
use crate::graph::{Binding, InstantiationPlan, Planner, Request};
use crate::handle::{Bound, Dependencies, HandleTarget};
use crate::key::TypeTag;
use crate::lifecycle::{InstanceRecord, LifecycleManager, LifecycleState, PostProcessor};
use crate::registry::Registry;
use crate::scope::{MemoryScopeStore, ScopeContext, ScopeManager, ScopeName, ScopeStore, StoreFactory};
use crate::settings::ContainerSettings;
use crate::source::DefinitionSource;

// ============================================================
// ContainerBuilder
// ============================================================

/// Builds a [`Container`].
///
/// Collect definitions, custom scopes and post-processors, then call
/// [`build()`](ContainerBuilder::build).
///
/// # Examples
/// ```rust,ignore
/// let container = Container::builder()
///     .settings(settings)
///     .custom_scope("request")
///     .add_source(&PersistenceSource)
///     .definition(audit_definition)
///     .post_processor(Decorator::<Mailer>::new(with_retries))
///     .build()?;
/// ```
pub struct ContainerBuilder {
    definitions: Vec<ComponentDefinition>,
    primaries: Vec<String>,
    custom_scopes: Vec<(String, StoreFactory)>,
    post_processors: Vec<Arc<dyn PostProcessor>>,
    settings: ContainerSettings,
}

impl ContainerBuilder {
    fn new() -> Self {
        Self {
            definitions: Vec::new(),
            primaries: Vec::new(),
            custom_scopes: Vec::new(),
            post_processors: Vec::new(),
            settings: ContainerSettings::default(),
        }
    }

    pub fn settings(mut self, settings: ContainerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn definition(mut self, definition: ComponentDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Marks `id` primary once everything is registered.
    pub fn primary(mut self, id: impl Into<String>) -> Self {
        self.primaries.push(id.into());
        self
    }

    /// Adds every definition a [`DefinitionSource`] produces.
    pub fn add_source(mut self, source: &dyn DefinitionSource) -> Self {
        let definitions = source.definitions();
        debug!(source = %source.name(), definitions = definitions.len(), "Adding definition source");
        self.definitions.extend(definitions);
        self
    }

    /// Registers a custom scope backed by the in-memory store.
    pub fn custom_scope(self, name: impl Into<String>) -> Self {
        self.custom_scope_with(name, || Box::new(MemoryScopeStore::default()))
    }

    /// Registers a custom scope with its own store per context.
    pub fn custom_scope_with<F>(mut self, name: impl Into<String>, store_factory: F) -> Self
    where
        F: Fn() -> Box<dyn ScopeStore> + Send + Sync + 'static,
    {
        self.custom_scopes.push((name.into(), Arc::new(store_factory)));
        self
    }

    /// Appends a post-processor. They run in the order added.
    pub fn post_processor(mut self, processor: impl PostProcessor + 'static) -> Self {
        self.post_processors.push(Arc::new(processor));
        self
    }

    /// Builds the container.
    ///
    /// Checks ids and scopes only; the dependency graph is checked by
    /// [`Container::validate`] (also run by [`Container::start`]) or on
    /// first resolution.
    ///
    /// # Errors
    /// - [`SijillError::DuplicateDefinition`]
    /// - [`SijillError::Scope`] — unknown scope on a definition, or a
    ///   built-in name registered as a custom scope
    /// - [`SijillError::DefinitionNotFound`] — a `primary(..)` id that is not registered
    #[instrument(skip(self), name = "container_build")]
    pub fn build(self) -> Result<Container> {
        info!(definitions = self.definitions.len(), "Building container");

        let mut custom_scopes: Vec<(String, StoreFactory)> = Vec::new();
        for (name, store_factory) in self.custom_scopes {
            if name == "singleton" || name == "prototype" {
                return Err(ScopeError::Reserved { scope: name }.into());
            }
            if custom_scopes.iter().any(|(existing, _)| *existing == name) {
                warn!(scope = %name, "Custom scope registered twice, keeping the first");
                continue;
            }
            custom_scopes.push((name, store_factory));
        }
        let scopes = ScopeManager::new(custom_scopes);

        let mut registry = Registry::new();
        for definition in self.definitions {
            scopes.check_known(definition.scope())?;
            registry.register(definition)?;
        }
        for id in &self.primaries {
            registry.mark_primary(id)?;
        }

        let bus = Arc::new(EventBus::new(&self.settings));
        let lifecycle = LifecycleManager::new(
            self.post_processors,
            bus.clone(),
            self.settings.publish_lifecycle_events,
        );
        let settings = self.settings;

        let core = Arc::new_cyclic(|this| Core {
            this: this.clone(),
            registry: RwLock::new(registry),
            frozen: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            scopes,
            lifecycle,
            bus,
            settings,
        });

        info!(custom_scopes = ?core.scopes.custom_scope_names(), "Container built successfully ✓");
        Ok(Container { core })
    }
}

// ═══════════════════════════════════════════
// Core (shared with handles)
// ═══════════════════════════════════════════

/// Published on the bus at start-up and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    Started,
    ShuttingDown,
}

/// Everything a resolution needs. Handles hold it weakly.
pub(crate) struct Core {
    this: Weak<Core>,
    registry: RwLock<Registry>,
    /// Set by the first resolution; registration is closed afterwards.
    frozen: AtomicBool,
    shut_down: AtomicBool,
    scopes: ScopeManager,
    lifecycle: LifecycleManager,
    bus: Arc<EventBus>,
    settings: ContainerSettings,
}

type Memo = HashMap<usize, Arc<InstanceRecord>>;

impl Core {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SijillError::ContainerShutDown);
        }
        Ok(())
    }

    fn plan(&self, request: &Request) -> Result<InstantiationPlan> {
        // Recursive read: a factory may resolve a handle while an outer
        // resolution is planning on the same thread.
        let registry = self.registry.read_recursive();
        Planner::new(&registry).plan(request)
    }

    fn resolve(&self, request: &Request, context: &ScopeContext) -> Result<Arc<InstanceRecord>> {
        self.ensure_running()?;
        self.frozen.store(true, Ordering::SeqCst);

        if let Request::Id(id) = request {
            if let Some(record) = self.scopes.cached_singleton(id) {
                trace!(id = %id, "Singleton cache hit");
                return Ok(record);
            }
        }

        let plan = self.plan(request)?;
        let mut memo = Memo::new();
        self.materialize(&plan, plan.roots()[0], context, &mut memo)
    }

    /// Resolves exactly this definition, e.g. for a handle.
    pub(crate) fn instantiate(
        &self,
        definition: &ComponentDefinition,
        context: &ScopeContext,
    ) -> Result<Arc<InstanceRecord>> {
        self.resolve(&Request::Id(definition.id().to_string()), context)
    }

    fn resolve_all(&self, tag: TypeTag, context: &ScopeContext) -> Result<Vec<Arc<InstanceRecord>>> {
        self.ensure_running()?;
        self.frozen.store(true, Ordering::SeqCst);

        let plan = {
            let registry = self.registry.read_recursive();
            Planner::new(&registry).plan_all(tag)?
        };
        let mut memo = Memo::new();
        plan.roots()
            .iter()
            .map(|&root| self.materialize(&plan, root, context, &mut memo))
            .collect()
    }

    /// Returns the record for one plan step, creating it (and, inside its
    /// scope's exclusive section, its dependencies) when needed.
    fn materialize(
        &self,
        plan: &InstantiationPlan,
        index: usize,
        context: &ScopeContext,
        memo: &mut Memo,
    ) -> Result<Arc<InstanceRecord>> {
        if let Some(record) = memo.get(&index) {
            return Ok(record.clone());
        }
        let definition = &plan.steps()[index].definition;
        trace!(id = %definition.id(), scope = %definition.scope(), "Materializing");

        let (record, created) = self.scopes.obtain(definition, context, |owner| {
            let dependencies = self.bind(plan, index, context, memo)?;
            self.lifecycle.create(definition, &dependencies, owner)
        })?;

        // Shutdown may have drained the singletons while this one was being
        // built; the record is already in the creation order, so either the
        // drain saw it or the flag is visible here.
        if created
            && *definition.scope() == ScopeName::Singleton
            && self.shut_down.load(Ordering::SeqCst)
        {
            warn!(id = %definition.id(), "Singleton finished after shutdown began, destroying it");
            let run_hook = !definition.skips_shutdown_hooks();
            if let Err(err) = self.lifecycle.destroy(&record, run_hook) {
                warn!(id = %err.id, reason = %err.reason, "Late singleton teardown failed");
            }
            return Err(SijillError::ContainerShutDown);
        }

        // Outside the exclusive section, so listeners may resolve.
        if created {
            self.lifecycle.announce(&record);
        }
        if definition.scope().is_cached() {
            memo.insert(index, record.clone());
        }
        Ok(record)
    }

    fn bind(
        &self,
        plan: &InstantiationPlan,
        index: usize,
        context: &ScopeContext,
        memo: &mut Memo,
    ) -> Result<Dependencies> {
        let step = &plan.steps()[index];
        // A singleton must not capture a caller's custom-scope contexts.
        let handle_context = match step.definition.scope() {
            ScopeName::Singleton => ScopeContext::none(),
            _ => context.clone(),
        };

        let mut slots = Vec::with_capacity(step.bindings.len());
        for binding in &step.bindings {
            slots.push(self.bound(plan, binding, context, &handle_context, memo)?);
        }
        Ok(Dependencies::new(
            step.definition.id(),
            slots,
            self.this.clone(),
            handle_context,
        ))
    }

    fn bound(
        &self,
        plan: &InstantiationPlan,
        binding: &Binding,
        context: &ScopeContext,
        handle_context: &ScopeContext,
        memo: &mut Memo,
    ) -> Result<Bound> {
        Ok(match binding {
            Binding::Step(index) => Bound::Record(self.materialize(plan, *index, context, memo)?),
            Binding::Many(all) => {
                let mut many = Vec::with_capacity(all.len());
                for binding in all {
                    many.push(self.bound(plan, binding, context, handle_context, memo)?);
                }
                Bound::Many(many)
            }
            Binding::Deferred(definition) => Bound::Deferred(HandleTarget::new(
                self.this.clone(),
                definition.clone(),
                handle_context.clone(),
            )),
            Binding::Factory(definition) => Bound::Factory(HandleTarget::new(
                self.this.clone(),
                definition.clone(),
                handle_context.clone(),
            )),
            Binding::Absent => Bound::Absent,
        })
    }

    /// Destroys newest first. Errors are collected, never fatal.
    fn destroy_all(
        &self,
        records: Vec<Arc<InstanceRecord>>,
        honour_skip: bool,
    ) -> (Vec<String>, Vec<LifecycleError>) {
        let mut destroyed = Vec::with_capacity(records.len());
        let mut failures = Vec::new();

        for record in records.into_iter().rev() {
            let run_hook = !(honour_skip && record.definition().skips_shutdown_hooks());
            if let Err(err) = self.lifecycle.destroy(&record, run_hook) {
                failures.push(err);
            }
            if record.state() == LifecycleState::Destroyed {
                destroyed.push(record.id().to_string());
            }
        }
        (destroyed, failures)
    }

    fn close_context(&self, scope: &str, context: &str) -> Result<ScopeExitReport> {
        let records = self.scopes.exit(scope, context)?;
        let (destroyed, failures) = self.destroy_all(records, false);
        Ok(ScopeExitReport {
            scope: scope.to_string(),
            context: context.to_string(),
            destroyed,
            failures,
        })
    }

    fn announce(&self, event: ContainerEvent) {
        if !self.settings.publish_lifecycle_events {
            return;
        }
        if let Err(err) = self.bus.publish(Event::new(event)) {
            warn!(event = ?event, error = %err, "Container event listener failed");
        }
    }
}

// ═══════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════

/// Result of closing one custom-scope context.
#[derive(Debug, Clone, Default)]
pub struct ScopeExitReport {
    pub scope: String,
    pub context: String,
    /// Ids in destruction order (newest first).
    pub destroyed: Vec<String>,
    /// Destroy hooks that failed. Teardown continued past each.
    pub failures: Vec<LifecycleError>,
}

impl ScopeExitReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of [`Container::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub drain: DrainOutcome,
    /// Contexts that were still active.
    pub contexts: Vec<ScopeExitReport>,
    /// Singleton ids in destruction order.
    pub destroyed: Vec<String>,
    pub failures: Vec<LifecycleError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.drain.completed
            && self.failures.is_empty()
            && self.contexts.iter().all(ScopeExitReport::is_clean)
    }
}

// ═══════════════════════════════════════════
// Container
// ═══════════════════════════════════════════

/// Thread-safe dependency injection container.
///
/// Created by [`ContainerBuilder::build()`].
pub struct Container {
    core: Arc<Core>,
}

impl Container {
    /// Create a new builder.
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.core.settings
    }

    // ── Registry ──

    /// Registers one more definition.
    ///
    /// # Errors
    /// [`SijillError::ContainerFrozen`] once anything has been resolved.
    pub fn register(&self, definition: ComponentDefinition) -> Result<()> {
        self.core.ensure_running()?;
        if self.core.frozen.load(Ordering::SeqCst) {
            return Err(SijillError::ContainerFrozen);
        }
        self.core.scopes.check_known(definition.scope())?;
        self.core.registry.write().register(definition).map(|_| ())
    }

    /// Makes `id` the tie-break choice among equal candidates.
    pub fn mark_primary(&self, id: &str) -> Result<()> {
        self.core.ensure_running()?;
        if self.core.frozen.load(Ordering::SeqCst) {
            return Err(SijillError::ContainerFrozen);
        }
        self.core.registry.write().mark_primary(id)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<ComponentDefinition>> {
        self.core.registry.read().lookup(id).cloned()
    }

    /// Definitions providing `T`, optionally narrowed by qualifier.
    pub fn find_by_type<T: ?Sized + 'static>(
        &self,
        qualifier: Option<&str>,
    ) -> Vec<Arc<ComponentDefinition>> {
        self.core
            .registry
            .read()
            .find_by_type(&TypeTag::of::<T>(), qualifier)
    }

    // ── Resolution ──

    /// The single component providing `T`.
    ///
    /// ```rust,ignore
    /// let db: Arc<Database> = container.get()?;
    /// let clock = container.get::<dyn Clock>()?;
    /// ```
    pub fn get<T: ?Sized + 'static>(&self) -> Result<Arc<T>> {
        self.get_instance(&Request::of::<T>())?.get::<T>()
    }

    pub fn get_qualified<T: ?Sized + 'static>(&self, qualifier: &str) -> Result<Arc<T>> {
        self.get_instance(&Request::qualified::<T>(qualifier))?.get::<T>()
    }

    pub fn get_by_id<T: ?Sized + 'static>(&self, id: &str) -> Result<Arc<T>> {
        self.get_instance(&Request::id(id))?.get::<T>()
    }

    /// Resolves a request to its record (instance, state, owner).
    pub fn get_instance(&self, request: &Request) -> Result<Arc<InstanceRecord>> {
        self.core.resolve(request, &ScopeContext::none())
    }

    /// Every component providing `T`, in registration order.
    pub fn get_all<T: ?Sized + 'static>(&self) -> Result<Vec<Arc<T>>> {
        self.core
            .resolve_all(TypeTag::of::<T>(), &ScopeContext::none())?
            .iter()
            .map(|record| record.get::<T>())
            .collect()
    }

    /// A view resolving custom-scoped components in `context`.
    pub fn in_context(&self, context: ScopeContext) -> ScopedContainer<'_> {
        ScopedContainer {
            container: self,
            context,
        }
    }

    /// Lifecycle state of a singleton, if it was ever created.
    pub fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.core.scopes.singleton_state(id)
    }

    // ── Scopes ──

    /// Opens `context` in a custom scope.
    pub fn enter_scope(&self, scope: &str, context: &str) -> Result<()> {
        self.core.ensure_running()?;
        self.core.scopes.enter(scope, context)
    }

    /// Closes `context` and destroys every record it owns, newest first.
    ///
    /// Destroy-hook failures are reported, not returned as errors.
    pub fn exit_scope(&self, scope: &str, context: &str) -> Result<ScopeExitReport> {
        self.core.ensure_running()?;
        let report = self.core.close_context(scope, context)?;
        debug!(
            scope = %scope,
            context = %context,
            destroyed = report.destroyed.len(),
            failures = report.failures.len(),
            "Scope context closed"
        );
        Ok(report)
    }

    // ── Events ──

    pub fn publish(&self, event: Event) -> Result<()> {
        self.core.ensure_running()?;
        self.core.bus.publish(event)
    }

    /// Subscribes to events of type `E` (own type or declared supertype).
    pub fn subscribe<E: ?Sized + 'static>(
        &self,
        listener: impl Listener + 'static,
        options: ListenerOptions,
    ) -> ListenerId {
        self.core
            .bus
            .subscribe(TypeTag::of::<E>(), Arc::new(listener), options)
    }

    /// Subscribes a handler that receives the payload viewed as `P`.
    ///
    /// ```rust,ignore
    /// container.listen::<OrderPlaced, _>(|order| {
    ///     audit.record(order.id);
    ///     Ok(())
    /// }, ListenerOptions::sync().priority(10));
    /// ```
    pub fn listen<P, F>(&self, handler: F, options: ListenerOptions) -> ListenerId
    where
        P: ?Sized + Send + Sync + 'static,
        F: Fn(&P) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.subscribe::<P>(
            move |event: &Event| match event.view::<P>() {
                Some(payload) => handler(&payload),
                None => Ok(()),
            },
            options,
        )
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.core.bus.unsubscribe(id)
    }

    /// Called by a transaction manager just before it commits.
    pub fn trigger_before_commit(&self, event: Event) -> Result<()> {
        self.core.ensure_running()?;
        self.core.bus.trigger_before_commit(event)
    }

    pub fn trigger_after_commit(&self, event: Event) -> Result<()> {
        self.core.ensure_running()?;
        self.core.bus.trigger_after_commit(event)
    }

    pub fn trigger_after_rollback(&self, event: Event) -> Result<()> {
        self.core.ensure_running()?;
        self.core.bus.trigger_after_rollback(event)
    }

    /// Failures reported by async listeners so far.
    pub fn async_listener_failures(&self) -> Vec<ListenerFailure> {
        self.core.bus.async_failures()
    }

    // ── Whole-container operations ──

    /// Checks that every definition can be planned: all dependencies
    /// registered, no ambiguity, no cycle without a lazy edge, valid
    /// scope nesting. Instantiates nothing.
    pub fn validate(&self) -> Result<()> {
        let registry = self.core.registry.read_recursive();
        for definition in registry.iter() {
            Planner::new(&registry).plan(&Request::Id(definition.id().to_string()))?;
        }
        debug!(definitions = registry.len(), "Dependency graph valid");
        Ok(())
    }

    /// The instantiation plan for `request`, without creating anything.
    pub fn plan(&self, request: &Request) -> Result<InstantiationPlan> {
        self.core.plan(request)
    }

    /// Validates, then creates every non-lazy singleton in registration
    /// order and publishes [`ContainerEvent::Started`].
    #[instrument(skip(self), name = "container_start")]
    pub fn start(&self) -> Result<()> {
        self.core.ensure_running()?;
        self.validate()?;

        let eager: Vec<Arc<ComponentDefinition>> = self
            .core
            .registry
            .read()
            .iter()
            .filter(|d| *d.scope() == ScopeName::Singleton && !d.is_lazy())
            .cloned()
            .collect();
        info!(eager = eager.len(), "Starting container");

        let none = ScopeContext::none();
        for definition in &eager {
            self.core.instantiate(definition, &none)?;
        }

        self.core.announce(ContainerEvent::Started);
        info!("Container started ✓");
        Ok(())
    }

    /// Shuts the container down.
    ///
    /// 1. stops async dispatch, draining or discarding queued work
    ///    within `timeout`
    /// 2. closes every active custom-scope context
    /// 3. destroys singletons in reverse creation order
    ///
    /// Every later call returns [`SijillError::ContainerShutDown`].
    #[instrument(skip(self), name = "container_shutdown")]
    pub fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport> {
        let core = &self.core;
        if core.shut_down.swap(true, Ordering::SeqCst) {
            return Err(SijillError::ContainerShutDown);
        }
        info!("Shutting down container");
        core.announce(ContainerEvent::ShuttingDown);

        let drain = core.bus.close(timeout, core.settings.drain_on_shutdown);

        let mut contexts = Vec::new();
        for (scope, context) in core.scopes.active_contexts() {
            match core.close_context(&scope, &context) {
                Ok(report) => contexts.push(report),
                Err(err) => warn!(scope = %scope, context = %context, error = %err, "Could not close context"),
            }
        }

        let (destroyed, failures) = core.destroy_all(core.scopes.drain_singletons(), true);

        let report = ShutdownReport {
            drain,
            contexts,
            destroyed,
            failures,
        };
        info!(
            destroyed = report.destroyed.len(),
            failures = report.failures.len(),
            drained = report.drain.completed,
            "Container shut down"
        );
        Ok(report)
    }

    /// [`shutdown`](Self::shutdown) with the configured timeout.
    pub fn close(&self) -> Result<ShutdownReport> {
        self.shutdown(self.core.settings.shutdown_timeout())
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.shut_down.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("registered", &self.core.registry.read().len())
            .field("listeners", &self.core.bus.listener_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// ═══════════════════════════════════════════
// ScopedContainer
// ═══════════════════════════════════════════

/// Resolves within a set of custom-scope contexts.
///
/// ```rust,ignore
/// container.enter_scope("request", "req-42")?;
/// let scoped = container.in_context(ScopeContext::none().with("request", "req-42"));
/// let user = scoped.get::<CurrentUser>()?;
/// ```
pub struct ScopedContainer<'a> {
    container: &'a Container,
    context: ScopeContext,
}

impl ScopedContainer<'_> {
    pub fn context(&self) -> &ScopeContext {
        &self.context
    }

    pub fn get<T: ?Sized + 'static>(&self) -> Result<Arc<T>> {
        self.get_instance(&Request::of::<T>())?.get::<T>()
    }

    pub fn get_qualified<T: ?Sized + 'static>(&self, qualifier: &str) -> Result<Arc<T>> {
        self.get_instance(&Request::qualified::<T>(qualifier))?.get::<T>()
    }

    pub fn get_by_id<T: ?Sized + 'static>(&self, id: &str) -> Result<Arc<T>> {
        self.get_instance(&Request::id(id))?.get::<T>()
    }

    pub fn get_instance(&self, request: &Request) -> Result<Arc<InstanceRecord>> {
        self.container.core.resolve(request, &self.context)
    }

    pub fn get_all<T: ?Sized + 'static>(&self) -> Result<Vec<Arc<T>>> {
        self.container
            .core
            .resolve_all(TypeTag::of::<T>(), &self.context)?
            .iter()
            .map(|record| record.get::<T>())
            .collect()
    }
}

impl fmt::Debug for ScopedContainer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedContainer")
            .field("context", &self.context)
            .finish()
    }
}

// ═══════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════

pub mod prelude {
    pub use super::{
        Container, ContainerBuilder, ContainerEvent, ScopeExitReport, ScopedContainer,
        ShutdownReport,
    };
    pub use crate::definition::{ComponentDefinition, DefinitionBuilder, Requirement};
    pub use crate::error::{BoxError, Result, SijillError};
    pub use crate::event::{
        DispatchMode, Event, Listener, ListenerId, ListenerOptions, TransactionPhase,
    };
    pub use crate::graph::Request;
    pub use crate::handle::{Deferred, Dependencies, InstanceFactory};
    pub use crate::key::TypeTag;
    pub use crate::lifecycle::{Decorator, LifecycleEvent, LifecycleState, PostProcessor};
    pub use crate::scope::{ScopeContext, ScopeName, ScopeStore};
    pub use crate::settings::{ContainerSettings, QueueFullPolicy};
    pub use crate::source::DefinitionSource;
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════
