//! Error types for Sijill container operations.
//!
//! Every failure names the definition ids involved and, where it helps,
//! a hint on how to fix it.

use std::fmt;

use sijill_support::rendering::{render_cycle, render_id_list};

use crate::event::ListenerFailure;
use crate::lifecycle::LifecycleState;

/// Error type returned by user factories, hooks and listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for all Sijill operations.
#[derive(Debug, thiserror::Error)]
pub enum SijillError {
    /// A definition with the same id is already registered.
    #[error("{}", .0)]
    DuplicateDefinition(DuplicateDefinitionError),

    /// No definition matches the requested id or type.
    #[error("{}", .0)]
    DefinitionNotFound(DefinitionNotFoundError),

    /// Several definitions match and nothing picks one of them.
    #[error("{}", .0)]
    AmbiguousDependency(AmbiguousDependencyError),

    /// The non-deferred dependency edges form a cycle.
    #[error("{}", .0)]
    CircularDependency(CircularDependencyError),

    /// A factory, hook or post-processor failed.
    #[error("{}", .0)]
    Lifecycle(LifecycleError),

    /// Invalid scope nesting, unknown scope or unknown context id.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// One or more sync listeners failed while handling an event.
    #[error("{}", .0)]
    Listener(ListenerError),

    /// The async dispatch queue is saturated and the policy is `fail`.
    #[error("Async dispatch queue is full (capacity {capacity})")]
    DispatchQueueFull { capacity: usize },

    /// The async worker runtime could not be started.
    #[error("Async dispatch unavailable: {reason}")]
    DispatchUnavailable { reason: String },

    /// A factory asked for a dependency index it never declared.
    #[error("'{id}' has no dependency #{index} ({declared} declared)")]
    DependencyIndex {
        id: String,
        index: usize,
        declared: usize,
    },

    /// A typed accessor asked for a type the definition does not provide.
    #[error("Definition '{id}' does not provide {requested}\n  Provided: {provided}")]
    TypeMismatch {
        id: String,
        requested: String,
        provided: String,
    },

    /// Registration attempted after the first resolution.
    #[error("Container is frozen. Register definitions before the first resolution")]
    ContainerFrozen,

    /// The container was shut down (or dropped) before this call.
    #[error("Container has been shut down")]
    ContainerShutDown,
}

/// Error when a definition id is registered twice.
#[derive(Debug, Clone)]
pub struct DuplicateDefinitionError {
    pub id: String,
}

impl fmt::Display for DuplicateDefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Definition already registered: '{}'", self.id)?;
        write!(f, "\n  Hint: Definition ids must be unique; pick another id")
    }
}

/// Error when nothing matches a request.
#[derive(Debug, Clone)]
pub struct DefinitionNotFoundError {
    /// Rendered request (id, or type with optional qualifier)
    pub requested: String,
    /// The definition whose dependency could not be satisfied
    pub required_by: Option<String>,
    /// Registered ids that look similar
    pub suggestions: Vec<String>,
}

impl fmt::Display for DefinitionNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "No definition found for {}", self.requested)?;

        if let Some(ref parent) = self.required_by {
            write!(f, "\n  Required by: '{parent}'")?;
        }

        if !self.suggestions.is_empty() {
            write!(f, "\n  Did you mean: {}", render_id_list(&self.suggestions))?;
        }

        write!(
            f,
            "\n  Hint: Register it, or mark the dependency optional"
        )
    }
}

/// Error when several candidates match and none is selected.
#[derive(Debug, Clone)]
pub struct AmbiguousDependencyError {
    pub requested: String,
    pub required_by: Option<String>,
    /// Every matching definition id, in registration order
    pub candidates: Vec<String>,
}

impl fmt::Display for AmbiguousDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ambiguous dependency {}: {} candidates match ({})",
            self.requested,
            self.candidates.len(),
            render_id_list(&self.candidates),
        )?;

        if let Some(ref parent) = self.required_by {
            write!(f, "\n  Required by: '{parent}'")?;
        }

        write!(
            f,
            "\n  Hint: Add a qualifier, mark one candidate primary, or request a collection"
        )
    }
}

/// Error when a dependency cycle has no deferred edge.
///
/// The chain starts and ends with the same id.
#[derive(Debug, Clone)]
pub struct CircularDependencyError {
    /// Example: ["a", "b", "a"]
    pub chain: Vec<String>,
}

impl CircularDependencyError {
    /// Returns `true` if `id` takes part in the cycle.
    pub fn involves(&self, id: &str) -> bool {
        self.chain.iter().any(|c| c == id)
    }
}

impl fmt::Display for CircularDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circular dependency detected:\n  {}", render_cycle(&self.chain))?;
        write!(
            f,
            "\n  Hint: Mark one edge of the cycle lazy to inject a deferred handle"
        )
    }
}

/// Error raised by a factory, hook or post-processor.
///
/// Kept `Clone` so a `FAILED` singleton can report the same failure to
/// every later caller.
#[derive(Debug, Clone)]
pub struct LifecycleError {
    /// Definition whose instance failed
    pub id: String,
    /// Stage the record was in when the failure happened
    pub stage: LifecycleState,
    pub reason: String,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lifecycle failure for '{}' during {}: {}",
            self.id, self.stage, self.reason
        )
    }
}

/// Scope related failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScopeError {
    /// The scope name was never registered with the container.
    #[error("Unknown scope '{scope}'\n  Hint: Register it with .custom_scope(\"{scope}\")")]
    UnknownScope { scope: String },

    /// `exit_scope` or a lookup named a context that is not active.
    #[error("No active context '{context}' in scope '{scope}'")]
    UnknownContext { scope: String, context: String },

    /// `enter_scope` for a context that is already active.
    #[error("Context '{context}' is already active in scope '{scope}'")]
    ContextAlreadyActive { scope: String, context: String },

    /// A scoped definition was requested without a context for its scope.
    #[error(
        "'{id}' lives in scope '{scope}' but no context of that scope was supplied\n  Hint: Resolve it through container.in_context(..)"
    )]
    NoActiveContext { id: String, scope: String },

    /// A longer-lived definition depends on a shorter-lived scoped one.
    #[error(
        "Scope mismatch: '{consumer}' ({consumer_scope}) cannot hold '{dependency}' ({dependency_scope})\n  Hint: Inject it lazily from a shorter-lived component, or widen its scope"
    )]
    InvalidNesting {
        consumer: String,
        consumer_scope: String,
        dependency: String,
        dependency_scope: String,
    },

    /// A built-in scope name was registered as a custom scope.
    #[error("Scope '{scope}' is built in and cannot be registered as a custom scope")]
    Reserved { scope: String },
}

/// Aggregated sync-listener failures for a single publish.
#[derive(Debug, Clone)]
pub struct ListenerError {
    /// Rendered event type
    pub event: String,
    pub failures: Vec<ListenerFailure>,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listener(s) failed while handling {}",
            self.failures.len(),
            self.event
        )?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

/// Convenient Result type for Sijill operations.
pub type Result<T> = std::result::Result<T, SijillError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ListenerId;

    #[test]
    fn not_found_display() {
        let err = SijillError::DefinitionNotFound(DefinitionNotFoundError {
            requested: "id 'user_servise'".into(),
            required_by: Some("controller".into()),
            suggestions: vec!["user_service".into()],
        });

        let msg = format!("{err}");
        assert!(msg.contains("No definition found"));
        assert!(msg.contains("'controller'"));
        assert!(msg.contains("'user_service'"));
    }

    #[test]
    fn circular_display_names_chain() {
        let err = CircularDependencyError {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(err.involves("a"));
        assert!(err.involves("b"));
        assert!(!err.involves("c"));

        let msg = SijillError::CircularDependency(err).to_string();
        assert!(msg.contains("a → b → a"));
    }

    #[test]
    fn ambiguous_display_lists_candidates() {
        let err = SijillError::AmbiguousDependency(AmbiguousDependencyError {
            requested: "type Clock".into(),
            required_by: None,
            candidates: vec!["wall".into(), "mono".into(), "fake".into()],
        });

        let msg = err.to_string();
        assert!(msg.contains("3 candidates"));
        assert!(msg.contains("'wall', 'mono', 'fake'"));
    }

    #[test]
    fn scope_nesting_display() {
        let err = SijillError::from(ScopeError::InvalidNesting {
            consumer: "cache".into(),
            consumer_scope: "singleton".into(),
            dependency: "session_user".into(),
            dependency_scope: "session".into(),
        });

        let msg = err.to_string();
        assert!(msg.contains("Scope mismatch"));
        assert!(msg.contains("singleton"));
        assert!(msg.contains("session"));
    }

    #[test]
    fn listener_error_lists_failures() {
        let err = ListenerError {
            event: "OrderPlaced".into(),
            failures: vec![ListenerFailure {
                listener: ListenerId(3),
                event: "OrderPlaced".into(),
                reason: "boom".into(),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 listener(s) failed"));
        assert!(msg.contains("boom"));
    }
}
