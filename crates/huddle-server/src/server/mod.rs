//! Relay internals.
//!
//! Data flows one way: a [`streaming::connection`] loop parses frames into
//! the [`session::queue`], a [`pool`] worker takes each message, broadcasts
//! it, asks the [`session::conversation`] for a reply and broadcasts that
//! too. [`service`] wires everything to axum.

pub mod config;
pub mod pool;
pub mod service;
pub mod session;
pub mod streaming;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
