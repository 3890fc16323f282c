//! WebSocket plumbing.
//!
//! - [`connection`] - per-client read loop and writer task.
//! - [`broadcast`] - serialize-once fan-out to every registered client.

pub mod broadcast;
pub mod connection;
