//! Shared relay state.
//!
//! - [`registry`] - live connections and the zero-occupancy reset.
//! - [`queue`] - bounded FIFO of accepted messages.
//! - [`conversation`] - the exclusive section holding history and engine.
//!
//! A [`Hub`] bundles the three so connection loops and workers can be handed
//! a single `Arc`.

pub mod conversation;
pub mod queue;
pub mod registry;

use conversation::Conversation;
use core::time::Duration;
use queue::InboundQueue;
use registry::Registry;
use std::sync::Arc;

pub struct Hub {
    pub registry: Registry,
    pub conversation: Arc<Conversation>,
    pub queue: InboundQueue,
    /// Upper bound on how long one outbound send may wait for a slow client.
    pub send_timeout: Duration,
}

impl Hub {
    pub fn new(conversation: Conversation, queue: InboundQueue, send_timeout: Duration) -> Self {
        let conversation = Arc::new(conversation);
        Self {
            registry: Registry::new(Arc::clone(&conversation)),
            conversation,
            queue,
            send_timeout,
        }
    }
}
