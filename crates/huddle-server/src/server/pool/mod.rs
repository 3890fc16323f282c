//! Worker pool.
//!
//! - [`manager`] - spawns the workers and coordinates their shutdown.
//! - [`worker`] - the per-worker dequeue, generate, broadcast loop.

pub mod manager;
pub mod worker;
