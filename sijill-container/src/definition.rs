//! Component definitions.
//!
//! A [`ComponentDefinition`] is the declarative description of one
//! managed component: its id, the type it produces, the capabilities it
//! can be viewed as, its scope, its ordered dependency requirements and
//! its lifecycle hooks. Definitions are immutable once built.
//!
//! # Examples
//! ```rust
//! use std::sync::Arc;
//! use sijill_container::prelude::*;
//!
//! trait Clock: Send + Sync {
//!     fn now(&self) -> u64;
//! }
//!
//! struct FixedClock(u64);
//! impl Clock for FixedClock {
//!     fn now(&self) -> u64 { self.0 }
//! }
//!
//! struct Audit {
//!     clock: Arc<dyn Clock>,
//! }
//!
//! let clock = ComponentDefinition::builder("clock", |_| Ok(FixedClock(7)))
//!     .capability::<dyn Clock, _>(|c| c as Arc<dyn Clock>)
//!     .build();
//!
//! let audit = ComponentDefinition::builder("audit", |deps| {
//!         Ok(Audit { clock: deps.get::<dyn Clock>(0)? })
//!     })
//!     .prototype()
//!     .depends_on(Requirement::of::<dyn Clock>())
//!     .build();
//!
//! assert_eq!(audit.requirements().len(), 1);
//! assert!(clock.provides(&TypeTag::of::<dyn Clock>()));
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;
use crate::handle::Dependencies;
use crate::key::TypeTag;
use crate::scope::ScopeName;

/// A type-erased managed object.
pub type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) type FactoryFn = Arc<dyn Fn(&Dependencies) -> Result<Instance, BoxError> + Send + Sync>;
pub(crate) type HookFn = Arc<dyn Fn(&Instance) -> Result<(), BoxError> + Send + Sync>;
type CastFn = Arc<dyn Fn(&Instance) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// A type the produced object can be viewed as.
///
/// Every definition has at least one: its concrete produced type.
#[derive(Clone)]
pub struct Capability {
    tag: TypeTag,
    cast: CastFn,
}

impl Capability {
    /// The tag this capability answers to.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({})", self.tag)
    }
}

/// One dependency declared by a definition.
///
/// Requirements are matched by type tag against produced types and
/// declared capabilities.
#[derive(Debug, Clone)]
pub struct Requirement {
    target: TypeTag,
    qualifier: Option<String>,
    prefer_primary: bool,
    collection: bool,
    optional: bool,
    lazy: bool,
}

impl Requirement {
    /// Requires exactly one component providing `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            target: TypeTag::of::<T>(),
            qualifier: None,
            prefer_primary: true,
            collection: false,
            optional: false,
            lazy: false,
        }
    }

    /// Keeps only candidates carrying this qualifier (or with this id).
    pub fn qualified(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Injects every match, in registration order.
    pub fn collection(mut self) -> Self {
        self.collection = true;
        self
    }

    /// Supplies an absent value instead of failing when nothing matches.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Injects a deferred handle instead of the instance.
    ///
    /// Lazy edges are not followed during cycle detection.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Ignores the primary flag when several candidates match.
    pub fn ignore_primary(mut self) -> Self {
        self.prefer_primary = false;
        self
    }

    pub fn target(&self) -> TypeTag {
        self.target
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    pub fn prefers_primary(&self) -> bool {
        self.prefer_primary
    }

    pub fn is_collection(&self) -> bool {
        self.collection
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type {}", self.target)?;
        if let Some(ref q) = self.qualifier {
            write!(f, " qualified '{q}'")?;
        }
        Ok(())
    }
}

/// Declarative description of one managed component.
#[derive(Clone)]
pub struct ComponentDefinition {
    id: String,
    produces: TypeTag,
    capabilities: Vec<Capability>,
    qualifiers: Vec<String>,
    scope: ScopeName,
    requirements: Vec<Requirement>,
    factory: FactoryFn,
    init: Option<HookFn>,
    destroy: Option<HookFn>,
    lazy: bool,
    primary: bool,
    skip_shutdown_hooks: bool,
}

impl ComponentDefinition {
    /// Starts a definition whose factory builds a `T`.
    ///
    /// The factory receives the resolved dependencies in declaration
    /// order. The scope defaults to singleton.
    pub fn builder<T, F>(id: impl Into<String>, factory: F) -> DefinitionBuilder<T>
    where
        T: Send + Sync + 'static,
        F: Fn(&Dependencies) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self::builder_shared(id, move |deps| factory(deps).map(Arc::new))
    }

    /// Like [`builder`](Self::builder), for factories that already hand
    /// out an `Arc<T>`.
    pub fn builder_shared<T, F>(id: impl Into<String>, factory: F) -> DefinitionBuilder<T>
    where
        T: Send + Sync + 'static,
        F: Fn(&Dependencies) -> Result<Arc<T>, BoxError> + Send + Sync + 'static,
    {
        DefinitionBuilder::new(
            id.into(),
            Arc::new(move |deps: &Dependencies| factory(deps).map(|v| v as Instance)),
        )
    }

    /// Wraps an already built value. It is handed out as-is.
    pub fn instance<T: Send + Sync + 'static>(
        id: impl Into<String>,
        value: Arc<T>,
    ) -> DefinitionBuilder<T> {
        Self::builder_shared(id, move |_| Ok(value.clone()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The concrete type the factory produces.
    pub fn produces(&self) -> TypeTag {
        self.produces
    }

    pub fn scope(&self) -> &ScopeName {
        &self.scope
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn qualifiers(&self) -> &[String] {
        &self.qualifiers
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Excluded from eager start-up.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Primary flag as declared. See also `Container::mark_primary`.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn skips_shutdown_hooks(&self) -> bool {
        self.skip_shutdown_hooks
    }

    /// Returns `true` if the produced type or a capability matches `tag`.
    pub fn provides(&self, tag: &TypeTag) -> bool {
        self.capabilities.iter().any(|c| c.tag == *tag)
    }

    /// Returns `true` if `qualifier` is the id or a declared qualifier.
    pub fn has_qualifier(&self, qualifier: &str) -> bool {
        self.id == qualifier || self.qualifiers.iter().any(|q| q == qualifier)
    }

    /// Views `instance` as `T`, if this definition provides `T`.
    pub fn cast<T: ?Sized + 'static>(&self, instance: &Instance) -> Option<Arc<T>> {
        let tag = TypeTag::of::<T>();
        let capability = self.capabilities.iter().find(|c| c.tag == tag)?;
        let boxed = (capability.cast)(instance)?;
        boxed.downcast::<Arc<T>>().ok().map(|b| *b)
    }

    /// Renders the capability list for diagnostics.
    pub(crate) fn describe_capabilities(&self) -> String {
        let names: Vec<String> = self.capabilities.iter().map(|c| c.tag.to_string()).collect();
        names.join(", ")
    }

    pub(crate) fn factory(&self) -> &FactoryFn {
        &self.factory
    }

    pub(crate) fn init_hook(&self) -> Option<&HookFn> {
        self.init.as_ref()
    }

    pub(crate) fn destroy_hook(&self) -> Option<&HookFn> {
        self.destroy.as_ref()
    }
}

impl fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("id", &self.id)
            .field("produces", &self.produces)
            .field("scope", &self.scope)
            .field("requirements", &self.requirements)
            .field("qualifiers", &self.qualifiers)
            .field("lazy", &self.lazy)
            .field("primary", &self.primary)
            .finish()
    }
}

/// Builds a [`ComponentDefinition`] producing `T`.
pub struct DefinitionBuilder<T> {
    definition: ComponentDefinition,
    _produces: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> DefinitionBuilder<T> {
    fn new(id: String, factory: FactoryFn) -> Self {
        let own = Capability {
            tag: TypeTag::of::<T>(),
            cast: Arc::new(|instance: &Instance| {
                instance
                    .clone()
                    .downcast::<T>()
                    .ok()
                    .map(|v| Box::new(v) as Box<dyn Any + Send + Sync>)
            }),
        };

        Self {
            definition: ComponentDefinition {
                id,
                produces: TypeTag::of::<T>(),
                capabilities: vec![own],
                qualifiers: Vec::new(),
                scope: ScopeName::Singleton,
                requirements: Vec::new(),
                factory,
                init: None,
                destroy: None,
                lazy: false,
                primary: false,
                skip_shutdown_hooks: false,
            },
            _produces: std::marker::PhantomData,
        }
    }

    pub fn scope(mut self, scope: ScopeName) -> Self {
        self.definition.scope = scope;
        self
    }

    pub fn singleton(self) -> Self {
        self.scope(ScopeName::Singleton)
    }

    pub fn prototype(self) -> Self {
        self.scope(ScopeName::Prototype)
    }

    /// Places the component in a custom scope such as `"request"`.
    pub fn in_scope(self, name: impl Into<String>) -> Self {
        self.scope(ScopeName::custom(name))
    }

    /// Appends a dependency. Its index is the order of these calls.
    pub fn depends_on(mut self, requirement: Requirement) -> Self {
        self.definition.requirements.push(requirement);
        self
    }

    /// Declares that the produced object can be viewed as `C`.
    pub fn capability<C, F>(mut self, upcast: F) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<T>) -> Arc<C> + Send + Sync + 'static,
    {
        let tag = TypeTag::of::<C>();
        if self.definition.capabilities.iter().any(|c| c.tag == tag) {
            return self;
        }
        self.definition.capabilities.push(Capability {
            tag,
            cast: Arc::new(move |instance: &Instance| {
                let concrete = instance.clone().downcast::<T>().ok()?;
                Some(Box::new(upcast(concrete)) as Box<dyn Any + Send + Sync>)
            }),
        });
        self
    }

    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.definition.qualifiers.push(qualifier.into());
        self
    }

    pub fn primary(mut self) -> Self {
        self.definition.primary = true;
        self
    }

    /// Keeps the singleton out of eager start-up.
    pub fn lazy(mut self) -> Self {
        self.definition.lazy = true;
        self
    }

    /// Container shutdown will not run this component's destroy hook.
    pub fn skip_shutdown_hooks(mut self) -> Self {
        self.definition.skip_shutdown_hooks = true;
        self
    }

    /// Runs after the before-init post-processors.
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.definition.init = Some(typed_hook(hook));
        self
    }

    /// Runs when the owning scope ends or the container shuts down.
    pub fn on_destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.definition.destroy = Some(typed_hook(hook));
        self
    }

    pub fn build(self) -> ComponentDefinition {
        self.definition
    }
}

fn typed_hook<T, F>(hook: F) -> HookFn
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(move |instance: &Instance| match instance.downcast_ref::<T>() {
        Some(value) => hook(value),
        None => Err(format!("hook expected {}", std::any::type_name::<T>()).into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    fn english() -> ComponentDefinition {
        ComponentDefinition::builder("english", |_| Ok(English))
            .capability::<dyn Greeter, _>(|e| e as Arc<dyn Greeter>)
            .qualifier("en")
            .build()
    }

    #[test]
    fn defaults() {
        let def = english();
        assert_eq!(def.id(), "english");
        assert_eq!(*def.scope(), ScopeName::Singleton);
        assert!(!def.is_lazy());
        assert!(!def.is_primary());
        assert_eq!(def.produces(), TypeTag::of::<English>());
    }

    #[test]
    fn provides_own_type_and_capability() {
        let def = english();
        assert!(def.provides(&TypeTag::of::<English>()));
        assert!(def.provides(&TypeTag::of::<dyn Greeter>()));
        assert!(!def.provides(&TypeTag::of::<String>()));
    }

    #[test]
    fn qualifier_matches_id_too() {
        let def = english();
        assert!(def.has_qualifier("en"));
        assert!(def.has_qualifier("english"));
        assert!(!def.has_qualifier("fr"));
    }

    #[test]
    fn cast_to_capability() {
        let def = english();
        let instance: Instance = Arc::new(English);

        let greeter = def.cast::<dyn Greeter>(&instance).unwrap();
        assert_eq!(greeter.greet(), "hello");
        assert!(def.cast::<English>(&instance).is_some());
        assert!(def.cast::<String>(&instance).is_none());
    }

    #[test]
    fn duplicate_capability_ignored() {
        let def = ComponentDefinition::builder("english", |_| Ok(English))
            .capability::<dyn Greeter, _>(|e| e as Arc<dyn Greeter>)
            .capability::<dyn Greeter, _>(|e| e as Arc<dyn Greeter>)
            .build();
        assert_eq!(def.capabilities().len(), 2);
    }

    #[test]
    fn requirement_flags() {
        let req = Requirement::of::<dyn Greeter>()
            .qualified("en")
            .collection()
            .optional()
            .lazy()
            .ignore_primary();

        assert_eq!(req.qualifier(), Some("en"));
        assert!(req.is_collection());
        assert!(req.is_optional());
        assert!(req.is_lazy());
        assert!(!req.prefers_primary());
        assert_eq!(req.to_string(), "type dyn Greeter qualified 'en'");
    }

    #[test]
    fn typed_hook_rejects_other_type() {
        let hook = typed_hook::<English, _>(|_| Ok(()));
        let wrong: Instance = Arc::new(5u8);
        assert!(hook(&wrong).is_err());
        let right: Instance = Arc::new(English);
        assert!(hook(&right).is_ok());
    }
}
