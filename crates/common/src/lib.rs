//! Shared plumbing for the junction workspace.
//!
//! Deliberately tiny: the one thing every crate needs is a uniform way to
//! attach context to its own error type without boxing through a dynamic
//! error at library boundaries.

pub mod error;

pub use error::FromMessage;
