//! Resolved dependencies and the handles that stand in for them.
//!
//! A factory receives [`Dependencies`], one slot per declared
//! requirement, and reads them by index with a typed accessor.
//!
//! Two handles replace a direct reference where holding one would be
//! wrong:
//! - [`Deferred`] for lazy edges: resolved the first time it is used,
//!   then cached. This is how dependency cycles are broken.
//! - [`InstanceFactory`] for prototypes held by a cached component:
//!   every `get()` creates a fresh instance.
//!
//! Handles keep only a weak reference to the container, so they never
//! extend its life; using one after the container is gone returns
//! [`SijillError::ContainerShutDown`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

use crate::container::Core;
use crate::definition::ComponentDefinition;
use crate::error::{DefinitionNotFoundError, Result, SijillError};
use crate::lifecycle::InstanceRecord;
use crate::scope::ScopeContext;

/// What a handle resolves to.
#[derive(Clone)]
pub(crate) struct HandleTarget {
    core: Weak<Core>,
    definition: Arc<ComponentDefinition>,
    context: ScopeContext,
}

impl HandleTarget {
    pub fn new(core: Weak<Core>, definition: Arc<ComponentDefinition>, context: ScopeContext) -> Self {
        Self {
            core,
            definition,
            context,
        }
    }

    fn resolve(&self) -> Result<Arc<InstanceRecord>> {
        let core = self.core.upgrade().ok_or(SijillError::ContainerShutDown)?;
        core.instantiate(&self.definition, &self.context)
    }

    fn id(&self) -> &str {
        self.definition.id()
    }
}

/// One resolved requirement.
pub(crate) enum Bound {
    Record(Arc<InstanceRecord>),
    Many(Vec<Bound>),
    Deferred(HandleTarget),
    Factory(HandleTarget),
    Absent,
}

/// The resolved dependencies of one instance, in declaration order.
pub struct Dependencies {
    owner: String,
    slots: Vec<Bound>,
    core: Weak<Core>,
    context: ScopeContext,
}

impl Dependencies {
    pub(crate) fn new(owner: &str, slots: Vec<Bound>, core: Weak<Core>, context: ScopeContext) -> Self {
        Self {
            owner: owner.to_string(),
            slots,
            core,
            context,
        }
    }

    /// No dependencies and no container behind them.
    pub(crate) fn empty(owner: &str) -> Self {
        Self::new(owner, Vec::new(), Weak::new(), ScopeContext::none())
    }

    /// Id of the definition being built.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&Bound> {
        self.slots.get(index).ok_or_else(|| SijillError::DependencyIndex {
            id: self.owner.clone(),
            index,
            declared: self.slots.len(),
        })
    }

    fn absent(&self, index: usize) -> SijillError {
        SijillError::DefinitionNotFound(DefinitionNotFoundError {
            requested: format!("dependency #{index}"),
            required_by: Some(self.owner.clone()),
            suggestions: Vec::new(),
        })
    }

    fn target_of(&self, record: &InstanceRecord) -> HandleTarget {
        HandleTarget::new(self.core.clone(), record.definition().clone(), self.context.clone())
    }

    /// The single instance bound at `index`, as `T`.
    ///
    /// A deferred slot is resolved now; a factory slot creates a fresh
    /// instance.
    pub fn get<T: ?Sized + 'static>(&self, index: usize) -> Result<Arc<T>> {
        match self.slot(index)? {
            Bound::Record(record) => record.get::<T>(),
            Bound::Deferred(target) | Bound::Factory(target) => target.resolve()?.get::<T>(),
            Bound::Many(all) => match all.as_slice() {
                [only] => Self::read(only, &self.owner, index),
                _ => Err(SijillError::TypeMismatch {
                    id: self.owner.clone(),
                    requested: format!("a single {}", std::any::type_name::<T>()),
                    provided: format!("a collection of {} at #{index}", all.len()),
                }),
            },
            Bound::Absent => Err(self.absent(index)),
        }
    }

    fn read<T: ?Sized + 'static>(bound: &Bound, owner: &str, index: usize) -> Result<Arc<T>> {
        match bound {
            Bound::Record(record) => record.get::<T>(),
            Bound::Deferred(target) | Bound::Factory(target) => target.resolve()?.get::<T>(),
            Bound::Many(_) | Bound::Absent => Err(SijillError::TypeMismatch {
                id: owner.to_string(),
                requested: std::any::type_name::<T>().to_string(),
                provided: format!("nested binding at #{index}"),
            }),
        }
    }

    /// Like [`get`](Self::get), but `None` for an optional dependency
    /// with no match.
    pub fn optional<T: ?Sized + 'static>(&self, index: usize) -> Result<Option<Arc<T>>> {
        match self.slot(index)? {
            Bound::Absent => Ok(None),
            _ => self.get::<T>(index).map(Some),
        }
    }

    /// Every instance of a collection requirement, in registration order.
    pub fn all<T: ?Sized + 'static>(&self, index: usize) -> Result<Vec<Arc<T>>> {
        match self.slot(index)? {
            Bound::Many(all) => all.iter().map(|b| Self::read::<T>(b, &self.owner, index)).collect(),
            Bound::Absent => Ok(Vec::new()),
            _ => self.get::<T>(index).map(|one| vec![one]),
        }
    }

    /// A deferred handle for the dependency at `index`.
    pub fn lazy<T: ?Sized + 'static>(&self, index: usize) -> Result<Deferred<T>> {
        match self.slot(index)? {
            Bound::Deferred(target) | Bound::Factory(target) => Ok(Deferred::new(target.clone())),
            Bound::Record(record) => {
                let deferred = Deferred::new(self.target_of(record));
                let _ = deferred.cell.set(record.get::<T>()?);
                Ok(deferred)
            }
            Bound::Many(_) => Err(SijillError::TypeMismatch {
                id: self.owner.clone(),
                requested: format!("a deferred {}", std::any::type_name::<T>()),
                provided: format!("a collection at #{index}"),
            }),
            Bound::Absent => Err(self.absent(index)),
        }
    }

    /// A factory handle for the dependency at `index`.
    pub fn provider<T: ?Sized + 'static>(&self, index: usize) -> Result<InstanceFactory<T>> {
        match self.slot(index)? {
            Bound::Deferred(target) | Bound::Factory(target) => Ok(InstanceFactory::new(target.clone())),
            Bound::Record(record) => Ok(InstanceFactory::new(self.target_of(record))),
            Bound::Many(_) => Err(SijillError::TypeMismatch {
                id: self.owner.clone(),
                requested: format!("a provider of {}", std::any::type_name::<T>()),
                provided: format!("a collection at #{index}"),
            }),
            Bound::Absent => Err(self.absent(index)),
        }
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("owner", &self.owner)
            .field("len", &self.slots.len())
            .finish()
    }
}

/// Deferred-resolution handle.
///
/// Resolves its target the first time [`get`](Self::get) succeeds and
/// returns the same instance afterwards. Do not call `get` from inside
/// the factory of a component the target depends on: that target is
/// still being created and the call fails.
pub struct Deferred<T: ?Sized> {
    target: HandleTarget,
    cell: OnceCell<Arc<T>>,
}

impl<T: ?Sized + 'static> Deferred<T> {
    pub(crate) fn new(target: HandleTarget) -> Self {
        Self {
            target,
            cell: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Result<Arc<T>> {
        self.cell
            .get_or_try_init(|| self.target.resolve()?.get::<T>())
            .cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Id of the target definition.
    pub fn id(&self) -> &str {
        self.target.id()
    }
}

impl<T: ?Sized> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.target.definition.id())
            .field("resolved", &self.cell.get().is_some())
            .finish()
    }
}

/// Factory handle: every [`get`](Self::get) runs the target's full
/// lifecycle again.
pub struct InstanceFactory<T: ?Sized> {
    target: HandleTarget,
    _produces: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + 'static> InstanceFactory<T> {
    pub(crate) fn new(target: HandleTarget) -> Self {
        Self {
            target,
            _produces: PhantomData,
        }
    }

    pub fn get(&self) -> Result<Arc<T>> {
        self.target.resolve()?.get::<T>()
    }

    pub fn id(&self) -> &str {
        self.target.id()
    }
}

impl<T: ?Sized> Clone for InstanceFactory<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            _produces: PhantomData,
        }
    }
}

impl<T: ?Sized> fmt::Debug for InstanceFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("id", &self.target.definition.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reports_index_errors() {
        let deps = Dependencies::empty("audit");
        assert!(deps.is_empty());
        match deps.get::<String>(0) {
            Err(SijillError::DependencyIndex { id, index, declared }) => {
                assert_eq!(id, "audit");
                assert_eq!(index, 0);
                assert_eq!(declared, 0);
            }
            other => panic!("Expected DependencyIndex, got: {other:?}"),
        }
    }

    #[test]
    fn absent_slot_is_none_or_empty() {
        let deps = Dependencies::new("audit", vec![Bound::Absent], Weak::new(), ScopeContext::none());
        assert!(deps.optional::<String>(0).unwrap().is_none());
        assert!(deps.all::<String>(0).unwrap().is_empty());
        assert!(matches!(deps.get::<String>(0), Err(SijillError::DefinitionNotFound(_))));
    }

    #[test]
    fn handle_after_container_dropped() {
        let def = Arc::new(ComponentDefinition::builder("clock", |_| Ok(1u8)).build());
        let target = HandleTarget::new(Weak::new(), def, ScopeContext::none());

        let deferred: Deferred<u8> = Deferred::new(target.clone());
        assert!(matches!(deferred.get(), Err(SijillError::ContainerShutDown)));
        assert!(!deferred.is_resolved());

        let factory: InstanceFactory<u8> = InstanceFactory::new(target);
        assert_eq!(factory.id(), "clock");
        assert!(matches!(factory.get(), Err(SijillError::ContainerShutDown)));
    }
}
