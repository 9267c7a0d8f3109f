//! Worker side: one interpreter process serving the scheduler over stdio.
//!
//! - `runtime`: request loop, mount lock and session lifecycle.
//! - `session_store`: LRU + TTL session cache.
//! - `sandbox`: session workspaces and path guards.
//! - `engine`: interpreter capability trait and the Rhai implementation.

pub mod engine;
pub mod runtime;
pub mod sandbox;
pub mod session_store;
