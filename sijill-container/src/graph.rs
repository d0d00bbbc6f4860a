//! Dependency resolution.
//!
//! Turns a request into an [`InstantiationPlan`]: the ordered list of
//! definitions to instantiate, dependencies first, with every
//! dependency edge bound to a concrete candidate.
//!
//! # Algorithm
//! Depth-first traversal over the requirement edges, keeping the
//! current path to detect cycles. Two kinds of edges are not followed:
//! - lazy edges, bound to a deferred-resolution handle
//! - edges from a cached scope into a prototype, bound to a factory handle
//!
//! so a cycle that passes through either is broken instead of reported.
//!
//! Candidate selection for one requirement:
//! 1. keep exact qualifier matches when a qualifier is given
//! 2. collection requests take every match, in registration order
//! 3. a single match, or a single primary match, is selected
//! 4. anything else is ambiguous

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sijill_support::rendering::{PlanLine, render_plan};
use tracing::{debug, instrument, warn};

use crate::definition::{ComponentDefinition, Requirement};
use crate::error::{
    AmbiguousDependencyError, CircularDependencyError, DefinitionNotFoundError, Result,
    ScopeError, SijillError,
};
use crate::key::TypeTag;
use crate::registry::Registry;
use crate::scope::ScopeName;

/// What a caller asks the container for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A definition by id.
    Id(String),
    /// The single definition providing a type, optionally qualified.
    Type {
        tag: TypeTag,
        qualifier: Option<String>,
    },
}

impl Request {
    pub fn id(id: impl Into<String>) -> Self {
        Request::Id(id.into())
    }

    pub fn of<T: ?Sized + 'static>() -> Self {
        Request::Type {
            tag: TypeTag::of::<T>(),
            qualifier: None,
        }
    }

    pub fn qualified<T: ?Sized + 'static>(qualifier: impl Into<String>) -> Self {
        Request::Type {
            tag: TypeTag::of::<T>(),
            qualifier: Some(qualifier.into()),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Id(id) => write!(f, "id '{id}'"),
            Request::Type { tag, qualifier: None } => write!(f, "type {tag}"),
            Request::Type {
                tag,
                qualifier: Some(q),
            } => write!(f, "type {tag} qualified '{q}'"),
        }
    }
}

/// How one dependency of a plan step is satisfied.
#[derive(Debug, Clone)]
pub enum Binding {
    /// The instance produced by an earlier step.
    Step(usize),
    /// A collection request, one binding per match.
    Many(Vec<Binding>),
    /// A deferred-resolution handle for the target.
    Deferred(Arc<ComponentDefinition>),
    /// A factory handle producing a fresh target on each use.
    Factory(Arc<ComponentDefinition>),
    /// Optional dependency with no match.
    Absent,
}

/// One definition to instantiate.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub definition: Arc<ComponentDefinition>,
    /// One binding per requirement, in declaration order.
    pub bindings: Vec<Binding>,
}

/// Ordered instantiation plan. Every step comes after the steps it binds.
#[derive(Debug, Clone, Default)]
pub struct InstantiationPlan {
    steps: Vec<PlanStep>,
    roots: Vec<usize>,
}

impl InstantiationPlan {
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Steps answering the request itself.
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    /// Ids in instantiation order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.definition.id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn bound_ids(&self, binding: &Binding, out: &mut Vec<String>) {
        match binding {
            Binding::Step(i) => out.push(self.steps[*i].definition.id().to_string()),
            Binding::Many(all) => all.iter().for_each(|b| self.bound_ids(b, out)),
            Binding::Deferred(def) => out.push(format!("lazy {}", def.id())),
            Binding::Factory(def) => out.push(format!("factory {}", def.id())),
            Binding::Absent => out.push("none".to_string()),
        }
    }
}

impl fmt::Display for InstantiationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<PlanLine> = self
            .steps
            .iter()
            .map(|step| {
                let mut binds = Vec::new();
                for binding in &step.bindings {
                    self.bound_ids(binding, &mut binds);
                }
                PlanLine {
                    id: step.definition.id().to_string(),
                    scope: step.definition.scope().to_string(),
                    type_name: step.definition.produces().short_name(),
                    binds,
                }
            })
            .collect();
        f.write_str(&render_plan(&lines))
    }
}

/// Picks the candidate(s) for a type request.
enum Selection {
    One(Arc<ComponentDefinition>),
    All(Vec<Arc<ComponentDefinition>>),
    Nothing,
}

/// Builds plans against a registry snapshot.
pub(crate) struct Planner<'r> {
    registry: &'r Registry,
    steps: Vec<PlanStep>,
    /// Step index of each cached-scope definition already planned
    memo: HashMap<String, usize>,
    /// Current DFS path (for cycle reporting)
    path: Vec<String>,
}

impl<'r> Planner<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            steps: Vec::new(),
            memo: HashMap::new(),
            path: Vec::new(),
        }
    }

    /// Plans a single-instance request.
    ///
    /// # Errors
    /// - [`SijillError::DefinitionNotFound`] — nothing matches
    /// - [`SijillError::AmbiguousDependency`] — several match, none selected
    /// - [`SijillError::CircularDependency`] — cycle without a deferred edge
    /// - [`SijillError::Scope`] — invalid scope nesting
    #[instrument(skip(self), name = "plan", fields(request = %request))]
    pub fn plan(mut self, request: &Request) -> Result<InstantiationPlan> {
        let root = match request {
            Request::Id(id) => self
                .registry
                .lookup(id)
                .cloned()
                .ok_or_else(|| self.not_found(request.to_string(), None, id))?,
            Request::Type { tag, qualifier } => {
                match self.select(*tag, qualifier.as_deref(), true, false) {
                    Selection::One(def) => def,
                    Selection::Nothing => {
                        return Err(self.not_found(request.to_string(), None, &tag.short_name()));
                    }
                    Selection::All(candidates) => {
                        return Err(self.ambiguous(request.to_string(), None, &candidates));
                    }
                }
            }
        };

        let index = self.visit(&root)?;
        debug!(steps = self.steps.len(), "Plan built");
        Ok(InstantiationPlan {
            steps: self.steps,
            roots: vec![index],
        })
    }

    /// Plans every definition providing `tag`, in registration order.
    pub fn plan_all(mut self, tag: TypeTag) -> Result<InstantiationPlan> {
        let candidates = self.registry.find_by_type(&tag, None);
        let mut roots = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            roots.push(self.visit(candidate)?);
        }
        Ok(InstantiationPlan {
            steps: self.steps,
            roots,
        })
    }

    fn visit(&mut self, definition: &Arc<ComponentDefinition>) -> Result<usize> {
        let id = definition.id();

        if definition.scope().is_cached() {
            if let Some(&index) = self.memo.get(id) {
                return Ok(index);
            }
        }

        if let Some(start) = self.path.iter().position(|p| p == id) {
            let mut chain: Vec<String> = self.path[start..].to_vec();
            chain.push(id.to_string());
            warn!(cycle = ?chain, "Circular dependency detected");
            return Err(SijillError::CircularDependency(CircularDependencyError { chain }));
        }

        self.path.push(id.to_string());
        let mut bindings = Vec::with_capacity(definition.requirements().len());
        for requirement in definition.requirements() {
            bindings.push(self.bind(definition, requirement)?);
        }
        self.path.pop();

        let index = self.steps.len();
        self.steps.push(PlanStep {
            definition: definition.clone(),
            bindings,
        });
        if definition.scope().is_cached() {
            self.memo.insert(id.to_string(), index);
        }
        Ok(index)
    }

    fn bind(&mut self, consumer: &Arc<ComponentDefinition>, requirement: &Requirement) -> Result<Binding> {
        let selection = self.select(
            requirement.target(),
            requirement.qualifier(),
            requirement.prefers_primary(),
            requirement.is_collection(),
        );

        match selection {
            Selection::One(def) => self.edge(consumer, &def, requirement.is_lazy()),
            Selection::All(candidates) if requirement.is_collection() => {
                let mut all = Vec::with_capacity(candidates.len());
                for def in &candidates {
                    all.push(self.edge(consumer, def, requirement.is_lazy())?);
                }
                Ok(Binding::Many(all))
            }
            Selection::All(candidates) => Err(self.ambiguous(
                requirement.to_string(),
                Some(consumer.id()),
                &candidates,
            )),
            Selection::Nothing if requirement.is_collection() => Ok(Binding::Many(Vec::new())),
            Selection::Nothing if requirement.is_optional() => Ok(Binding::Absent),
            Selection::Nothing => Err(self.not_found(
                requirement.to_string(),
                Some(consumer.id()),
                &requirement.target().short_name(),
            )),
        }
    }

    /// Binds one consumer → dependency edge, applying the scope rules.
    fn edge(
        &mut self,
        consumer: &Arc<ComponentDefinition>,
        dependency: &Arc<ComponentDefinition>,
        lazy: bool,
    ) -> Result<Binding> {
        let consumer_scope = consumer.scope();
        let dependency_scope = dependency.scope();

        if let ScopeName::Custom(dep_scope) = dependency_scope {
            let nested_ok = match consumer_scope {
                ScopeName::Prototype => true,
                ScopeName::Custom(own) => own == dep_scope,
                ScopeName::Singleton => false,
            };
            if !nested_ok {
                warn!(
                    consumer = %consumer.id(),
                    consumer_scope = %consumer_scope,
                    dependency = %dependency.id(),
                    dependency_scope = %dependency_scope,
                    "Scope mismatch detected"
                );
                return Err(ScopeError::InvalidNesting {
                    consumer: consumer.id().to_string(),
                    consumer_scope: consumer_scope.to_string(),
                    dependency: dependency.id().to_string(),
                    dependency_scope: dependency_scope.to_string(),
                }
                .into());
            }
        }

        if lazy {
            return Ok(Binding::Deferred(dependency.clone()));
        }
        if consumer_scope.is_cached() && *dependency_scope == ScopeName::Prototype {
            return Ok(Binding::Factory(dependency.clone()));
        }
        self.visit(dependency).map(Binding::Step)
    }

    fn select(
        &self,
        tag: TypeTag,
        qualifier: Option<&str>,
        prefer_primary: bool,
        collection: bool,
    ) -> Selection {
        let mut candidates = self.registry.find_by_type(&tag, qualifier);

        if collection {
            return Selection::All(candidates);
        }

        match candidates.len() {
            0 => Selection::Nothing,
            1 => Selection::One(candidates.remove(0)),
            _ => {
                if prefer_primary {
                    let mut primaries = candidates
                        .iter()
                        .filter(|d| self.registry.is_primary(d.id()));
                    if let (Some(only), None) = (primaries.next(), primaries.next()) {
                        return Selection::One(only.clone());
                    }
                }
                Selection::All(candidates)
            }
        }
    }

    fn not_found(&self, requested: String, required_by: Option<&str>, hint: &str) -> SijillError {
        SijillError::DefinitionNotFound(DefinitionNotFoundError {
            requested,
            required_by: required_by.map(str::to_string),
            suggestions: self.registry.suggestions(hint),
        })
    }

    fn ambiguous(
        &self,
        requested: String,
        required_by: Option<&str>,
        candidates: &[Arc<ComponentDefinition>],
    ) -> SijillError {
        SijillError::AmbiguousDependency(AmbiguousDependencyError {
            requested,
            required_by: required_by.map(str::to_string),
            candidates: candidates.iter().map(|d| d.id().to_string()).collect(),
        })
    }
}
