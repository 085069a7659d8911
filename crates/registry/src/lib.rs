//! Backend registry and namespacing router.
//!
//! The registry owns every adapter: it builds them from configuration, runs
//! their lifecycle, merges capabilities from the healthy ones, and probes
//! liveness. The router translates namespaced identifiers back into
//! (backend, original key) pairs and forwards calls.

pub mod error;
pub mod registry;
pub mod router;

pub use {
    error::{Error, Result},
    registry::{BackendStatus, HealthChange, MergedCapabilities, MergedEntry, Registry, TransitionView},
    router::{Router, namespace_name, namespace_uri, split_name, split_uri},
};
