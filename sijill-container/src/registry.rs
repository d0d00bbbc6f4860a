//! Definition registry: every registered definition, indexed by id and type.
//!
//! Definitions are kept in registration order; that order is what
//! collection requests and eager start-up observe. Registration is
//! expected to finish before the first resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::definition::ComponentDefinition;
use crate::error::{DefinitionNotFoundError, DuplicateDefinitionError, Result, SijillError};
use crate::key::TypeTag;

/// Stores all component definitions.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    definitions: Vec<Arc<ComponentDefinition>>,
    by_id: HashMap<String, usize>,
    by_type: HashMap<TypeTag, Vec<usize>>,
    primary: HashSet<String>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition.
    ///
    /// # Errors
    /// Returns [`SijillError::DuplicateDefinition`] if the id is taken.
    pub fn register(&mut self, definition: ComponentDefinition) -> Result<Arc<ComponentDefinition>> {
        let id = definition.id().to_string();

        if self.by_id.contains_key(&id) {
            return Err(SijillError::DuplicateDefinition(DuplicateDefinitionError { id }));
        }

        let index = self.definitions.len();
        for capability in definition.capabilities() {
            self.by_type.entry(capability.tag()).or_default().push(index);
        }
        if definition.is_primary() {
            self.primary.insert(id.clone());
        }

        debug!(
            id = %id,
            produces = %definition.produces(),
            scope = %definition.scope(),
            "Registered definition"
        );

        let definition = Arc::new(definition);
        self.definitions.push(definition.clone());
        self.by_id.insert(id, index);
        Ok(definition)
    }

    /// Looks up a definition by id.
    pub fn lookup(&self, id: &str) -> Option<&Arc<ComponentDefinition>> {
        self.by_id.get(id).map(|&i| &self.definitions[i])
    }

    /// Definitions producing or declaring `tag`, in registration order,
    /// keeping only those that carry `qualifier` when one is given.
    pub fn find_by_type(&self, tag: &TypeTag, qualifier: Option<&str>) -> Vec<Arc<ComponentDefinition>> {
        let Some(indices) = self.by_type.get(tag) else {
            trace!(tag = %tag, "No definitions for type");
            return Vec::new();
        };

        indices
            .iter()
            .map(|&i| &self.definitions[i])
            .filter(|def| qualifier.is_none_or(|q| def.has_qualifier(q)))
            .cloned()
            .collect()
    }

    /// Sets the primary tie-break preference for `id`.
    pub fn mark_primary(&mut self, id: &str) -> Result<()> {
        if !self.by_id.contains_key(id) {
            return Err(SijillError::DefinitionNotFound(DefinitionNotFoundError {
                requested: format!("id '{id}'"),
                required_by: None,
                suggestions: self.suggestions(id),
            }));
        }
        debug!(id = %id, "Marked primary");
        self.primary.insert(id.to_string());
        Ok(())
    }

    pub fn is_primary(&self, id: &str) -> bool {
        self.primary.contains(id)
    }

    /// All definitions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ComponentDefinition>> {
        self.definitions.iter()
    }

    /// Returns the number of registered definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Registered ids that look like `id`.
    pub fn suggestions(&self, id: &str) -> Vec<String> {
        let ids: Vec<&str> = self.definitions.iter().map(|d| d.id()).collect();
        sijill_support::rendering::suggest_similar(id, &ids, 3)
    }
}
