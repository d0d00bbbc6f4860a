//! # Sijill — Inversion-of-Control Container for Rust
//!
//! Register component definitions, let the container work out the
//! dependency graph, and get back fully initialized instances with the
//! sharing their scope asks for.
//!
//! - singleton, prototype and custom scopes (request, session, ...)
//! - init and destroy hooks, plus post-processors that may wrap instances
//! - cycle detection, broken by lazy edges
//! - an event bus with priorities, async listeners and transaction phases
//!
//! ```rust
//! use sijill::prelude::*;
//!
//! struct Greeting(String);
//!
//! let container = Container::builder()
//!     .definition(ComponentDefinition::builder("greeting", |_| Ok(Greeting("salaam".into()))).build())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(container.get::<Greeting>().unwrap().0, "salaam");
//! ```

pub use sijill_container::*;
pub use sijill_support::logging;
