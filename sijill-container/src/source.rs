//! Definition sources.
//!
//! A source produces a batch of related definitions before registration:
//! a module of code-built definitions, or a loader that turns some
//! configuration document into definitions. The container only sees the
//! resulting [`ComponentDefinition`]s.
//!
//! # Examples
//! ```rust
//! use sijill_container::prelude::*;
//!
//! struct Database { url: String }
//!
//! struct PersistenceSource {
//!     url: String,
//! }
//!
//! impl DefinitionSource for PersistenceSource {
//!     fn definitions(&self) -> Vec<ComponentDefinition> {
//!         let url = self.url.clone();
//!         vec![ComponentDefinition::builder("database", move |_| {
//!             Ok(Database { url: url.clone() })
//!         })
//!         .build()]
//!     }
//! }
//!
//! let container = Container::builder()
//!     .add_source(&PersistenceSource { url: "postgres://localhost".into() })
//!     .build()
//!     .unwrap();
//! assert!(container.lookup("database").is_some());
//! ```

use crate::definition::ComponentDefinition;

/// Produces definitions for the container to register.
///
/// Split registrations by concern (persistence, mail, auth) rather than
/// building one long list in `main`.
pub trait DefinitionSource: Send + Sync {
    /// Definitions to register, in order.
    ///
    /// Called once, while the container is being built.
    fn definitions(&self) -> Vec<ComponentDefinition>;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A fixed list of definitions is itself a source.
impl DefinitionSource for Vec<ComponentDefinition> {
    fn definitions(&self) -> Vec<ComponentDefinition> {
        self.clone()
    }

    fn name(&self) -> &str {
        "definition list"
    }
}
