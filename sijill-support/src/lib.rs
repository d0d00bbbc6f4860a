//! # Sijill Support
//!
//! Shared utilities for the Sijill container crates.
//!
//! This crate provides:
//! - Text rendering for diagnostics (cycles, plans, suggestions)
//! - A `tracing-subscriber` bootstrap for binaries and tests

pub mod logging;
pub mod rendering;
