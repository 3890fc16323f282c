//! HTTP and WebSocket service.
//!
//! ## Structure
//!
//! - [`handler`] - axum entry point (`ChatService`).

pub mod handler;
