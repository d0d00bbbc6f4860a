//! Core container implementation for Sijill.
//!
//! Definitions go into a [`Container`](container::Container); the
//! resolver plans each request, scopes decide instance sharing, the
//! lifecycle manager drives every record to READY and back down, and the
//! event bus delivers application and lifecycle events.

pub mod container;
pub mod definition;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod graph;
pub mod handle;
pub mod key;
pub mod lifecycle;
mod registry;
pub mod scope;
pub mod settings;
pub mod source;

pub use container::prelude;
pub use error::{Result, SijillError};
pub use key::TypeTag;
pub use scope::ScopeName;
