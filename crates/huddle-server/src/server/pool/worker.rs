use crate::server::{
    session::Hub,
    streaming::broadcast::broadcast,
    telemetry::{increment_generation_failures, increment_generations},
};
use core::panic::AssertUnwindSafe;
use futures::FutureExt;
use huddle_core::{
    Result,
    types::{Envelope, Message},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Worker task that turns queued [`Message`]s into broadcasts.
///
/// Workers share the hub's inbound queue; whichever idle worker reaches it
/// first takes the next message. For each message the worker:
///
/// 1. broadcasts a `user_message` envelope to every client,
/// 2. waits for the exclusive section and generates the reply,
/// 3. broadcasts an `ai_response` envelope addressed to the sender.
///
/// A failure or panic while processing one message is logged and the worker
/// moves on to the next, so the pool never loses capacity. The loop ends
/// when `shutdown` is cancelled or the queue is closed.
///
/// # Arguments
///
/// - `worker_id`: Index of this worker, used in logs.
/// - `hub`: Shared registry, queue and conversation.
/// - `shutdown`: Cancelled once the pool has drained.
///
/// Every dequeued message is marked complete on the queue once handled,
/// whatever the outcome, so the pool can tell when the backlog is done.
pub async fn worker_loop(worker_id: usize, hub: Arc<Hub>, shutdown: CancellationToken) {
    tracing::trace!("Worker {worker_id} started");

    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = hub.queue.dequeue() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let outcome = AssertUnwindSafe(process_message(worker_id, &hub, &message))
            .catch_unwind()
            .await;
        hub.queue.complete();

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Worker {worker_id} failed to process {}: {e}", message.id);
            }
            Err(_) => {
                tracing::error!("Worker {worker_id} panicked while processing {}", message.id);
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

#[tracing::instrument(skip_all, fields(worker = worker_id, id = %message.id))]
async fn process_message(worker_id: usize, hub: &Hub, message: &Message) -> Result<()> {
    let echoed = broadcast(
        &hub.registry,
        &Envelope::user_message(message),
        hub.send_timeout,
    )
    .await?;
    tracing::debug!("User message delivered to {} clients", echoed.delivered);

    let response = match hub.conversation.respond(message).await {
        Ok(response) => {
            increment_generations();
            response
        }
        Err(e) => {
            increment_generation_failures();
            return Err(e);
        }
    };

    let answered = broadcast(
        &hub.registry,
        &Envelope::ai_response(message, response),
        hub.send_timeout,
    )
    .await?;
    tracing::debug!("Response delivered to {} clients", answered.delivered);

    Ok(())
}
