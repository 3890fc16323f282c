//! Bounded FIFO between connection loops and the worker pool.
//!
//! Every accepted frame becomes one [`Message`] that is dequeued by exactly
//! one worker. Workers share a single receiver behind an async mutex, so
//! whichever idle worker reaches it first takes the next message.
//!
//! The queue also counts unfinished messages: a message is counted from the
//! moment it is enqueued until a worker calls [`InboundQueue::complete`]. The
//! count goes up before the message becomes visible to consumers, so it never
//! reads zero while a message sits between `dequeue` and its processing.

use clap::ValueEnum;
use huddle_core::{Error, Result, types::Message};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};

/// What an enqueue does when the queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Backpressure {
    /// Wait for room. The sending connection stops reading until a worker
    /// frees a slot.
    #[default]
    Block,
    /// Drop the message and report [`Error::QueueFull`] to the caller.
    Reject,
}

pub struct InboundQueue {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    policy: Backpressure,
    accepting: AtomicBool,
    unfinished: AtomicUsize,
}

impl InboundQueue {
    /// Creates a queue holding at most `capacity` messages (minimum one).
    pub fn new(capacity: usize, policy: Backpressure) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            policy,
            accepting: AtomicBool::new(true),
            unfinished: AtomicUsize::new(0),
        }
    }

    /// Appends `message` to the tail.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`stop_accepting`](Self::stop_accepting)
    ///   has been called.
    /// - [`Error::QueueFull`] if the queue is full and the policy is
    ///   [`Backpressure::Reject`].
    pub async fn enqueue(&self, message: Message) -> Result<()> {
        if !self.is_accepting() {
            return Err(Error::ServiceShutdown);
        }

        let permit = match self.policy {
            Backpressure::Block => self
                .tx
                .reserve()
                .await
                .map_err(|_| Error::ServiceShutdown)?,
            Backpressure::Reject => self.tx.try_reserve().map_err(|e| match e {
                TrySendError::Full(()) => Error::QueueFull,
                TrySendError::Closed(()) => Error::ServiceShutdown,
            })?,
        };
        self.unfinished.fetch_add(1, Ordering::AcqRel);
        permit.send(message);
        Ok(())
    }

    /// Waits for the head message. Cancel-safe: a dropped call loses nothing.
    pub async fn dequeue(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks one dequeued message as fully processed.
    pub fn complete(&self) {
        self.unfinished.fetch_sub(1, Ordering::AcqRel);
    }

    /// Messages enqueued but not yet completed, whether still queued or
    /// already taken by a worker.
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::Acquire)
    }

    /// Refuses further enqueues. Messages already queued stay available.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::message_from;
    use core::time::Duration;
    use std::sync::Arc;
    use tokio::time::timeout;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn preserves_fifo_order() -> Result<()> {
        let queue = InboundQueue::new(8, Backpressure::Block);
        for id in ["1", "2", "3"] {
            queue.enqueue(message_from("A", "x", id, 0)).await?;
        }
        assert_eq!(queue.len(), 3);

        let ids: Vec<_> = [
            queue.dequeue().await,
            queue.dequeue().await,
            queue.dequeue().await,
        ]
        .into_iter()
        .flatten()
        .map(|m| m.id)
        .collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert!(queue.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn reject_policy_reports_full() -> Result<()> {
        let queue = InboundQueue::new(1, Backpressure::Reject);
        queue.enqueue(message_from("A", "x", "1", 0)).await?;
        let err = queue
            .enqueue(message_from("A", "x", "2", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn block_policy_waits_for_room() -> Result<()> {
        let queue = Arc::new(InboundQueue::new(1, Backpressure::Block));
        queue.enqueue(message_from("A", "x", "1", 0)).await?;

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(message_from("A", "x", "2", 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.dequeue().await.map(|m| m.id).as_deref(), Some("1"));
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("enqueue stayed blocked")
            .expect("task panicked")?;
        assert_eq!(queue.dequeue().await.map(|m| m.id).as_deref(), Some("2"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn each_message_goes_to_one_consumer() -> Result<()> {
        const MESSAGES: usize = 50;
        let queue = Arc::new(InboundQueue::new(MESSAGES, Backpressure::Block));
        for i in 0..MESSAGES {
            queue.enqueue(message_from("A", "x", &i.to_string(), 0)).await?;
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut taken = Vec::new();
                    while let Ok(Some(message)) =
                        timeout(Duration::from_millis(50), queue.dequeue()).await
                    {
                        taken.push(message.id);
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<usize> = futures::future::join_all(consumers)
            .await
            .into_iter()
            .flat_map(|taken| taken.expect("consumer panicked"))
            .map(|id| id.parse().expect("numeric id"))
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..MESSAGES).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn refuses_after_stop_but_keeps_backlog() -> Result<()> {
        let queue = InboundQueue::new(4, Backpressure::Block);
        queue.enqueue(message_from("A", "x", "1", 0)).await?;
        queue.stop_accepting();

        let err = queue
            .enqueue(message_from("A", "x", "2", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceShutdown));
        assert_eq!(queue.dequeue().await.map(|m| m.id).as_deref(), Some("1"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn dequeued_messages_stay_unfinished_until_completed() -> Result<()> {
        let queue = InboundQueue::new(4, Backpressure::Reject);
        queue.enqueue(message_from("A", "x", "1", 0)).await?;
        assert_eq!(queue.unfinished(), 1);

        let taken = queue.dequeue().await;
        assert!(taken.is_some());
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 1);

        queue.complete();
        assert_eq!(queue.unfinished(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn rejected_messages_are_not_counted() -> Result<()> {
        let queue = InboundQueue::new(1, Backpressure::Reject);
        queue.enqueue(message_from("A", "x", "1", 0)).await?;
        assert!(queue.enqueue(message_from("A", "x", "2", 0)).await.is_err());
        queue.stop_accepting();
        assert!(queue.enqueue(message_from("A", "x", "3", 0)).await.is_err());
        assert_eq!(queue.unfinished(), 1);
        Ok(())
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = InboundQueue::new(0, Backpressure::Reject);
        assert!(queue.is_empty());
        assert!(queue.is_accepting());
    }
}
