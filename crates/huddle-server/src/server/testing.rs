//! Test fixtures shared across modules.

use crate::server::session::{
    Hub,
    conversation::Conversation,
    queue::{Backpressure, InboundQueue},
    registry::{ClientHandle, OutboundFrame},
};
use core::time::Duration;
use huddle_core::{
    EngineError,
    engine::{EchoEngine, GenerationEngine},
    prompt::PromptTemplate,
    types::{ConnectionId, Envelope, InboundFrame, Message},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use tokio::{sync::mpsc, time::timeout};

/// Engine that sleeps for a fixed time and records how many calls overlap.
pub struct SleepyEngine {
    delay: Duration,
    active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl SleepyEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl GenerationEngine for SleepyEngine {
    fn generate(&mut self, prompt: &str) -> Result<String, EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        EchoEngine::default().generate(prompt)
    }
}

pub fn message_from(sender: &str, content: &str, id: &str, session: u64) -> Message {
    Message::new(
        ConnectionId(0),
        session,
        InboundFrame {
            sender: sender.into(),
            content: content.into(),
            id: id.into(),
        },
    )
}

pub fn hub_with(engine: impl GenerationEngine, capacity: usize) -> Arc<Hub> {
    Arc::new(Hub::new(
        Conversation::new(Box::new(engine), PromptTemplate::default(), None, None),
        InboundQueue::new(capacity, Backpressure::Block),
        Duration::from_millis(200),
    ))
}

pub fn echo_hub() -> Arc<Hub> {
    hub_with(EchoEngine::default(), 64)
}

/// An in-process participant: registered like a real connection, with its
/// outbound frames readable from `rx`.
pub struct FakeClient {
    pub id: ConnectionId,
    pub rx: mpsc::Receiver<OutboundFrame>,
}

impl FakeClient {
    pub fn join(hub: &Hub, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        let id = hub.registry.allocate_id();
        hub.registry.add(ClientHandle::new(id, tx));
        Self { id, rx }
    }

    /// Next envelope delivered to this client, or `None` after one second.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let frame = timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .ok()??;
        serde_json::from_str(frame.as_str()).ok()
    }

    /// Queues a message as if it had arrived on this connection.
    pub async fn say(&self, hub: &Hub, sender: &str, content: &str, id: &str) {
        let message = Message::new(
            self.id,
            hub.conversation.session(),
            InboundFrame {
                sender: sender.into(),
                content: content.into(),
                id: id.into(),
            },
        );
        hub.queue
            .enqueue(message)
            .await
            .expect("queue accepts test message");
    }
}
