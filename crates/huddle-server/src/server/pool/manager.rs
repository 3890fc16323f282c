//! Fixed-size pool of message workers.
//!
//! This module defines the [`WorkerPool`] struct, which spawns a set of
//! asynchronous workers that all consume the hub's inbound queue and
//! supports coordinated shutdown via a shared [`CancellationToken`].
//!
//! Workers never talk to each other. The only place they contend is the
//! conversation's exclusive section, so adding workers adds broadcast
//! parallelism while generations stay strictly one at a time.

use crate::server::{pool::worker::worker_loop, session::Hub};
use core::time::Duration;
use futures::future::join_all;
use huddle_core::Error;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// How long each worker gets to stop once cancelled.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// A cooperative pool of asynchronous workers sharing one inbound queue.
pub struct WorkerPool {
    hub: Arc<Hub>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `num_workers` workers on the current runtime.
    pub fn spawn(num_workers: usize, hub: Arc<Hub>, shutdown_timeout: Duration) -> Self {
        let shutdown_token = CancellationToken::new();

        let handles = (0..num_workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&hub),
                    shutdown_token.clone(),
                ))
            })
            .collect();

        Self {
            hub,
            handles: Mutex::new(handles),
            shutdown_token,
            shutdown_timeout,
        }
    }

    /// Number of workers that have not yet been joined.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Messages taken off the queue but not yet fully processed.
    pub fn in_flight(&self) -> usize {
        self.hub.queue.unfinished().saturating_sub(self.hub.queue.len())
    }

    /// No message is queued or being processed.
    fn is_idle(&self) -> bool {
        self.hub.queue.unfinished() == 0
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Stops the inbound queue from accepting new messages.
    /// - Waits up to the configured timeout for queued and in-flight
    ///   messages to finish.
    /// - Cancels the shared [`CancellationToken`].
    /// - Waits (up to 3 seconds per worker) for each worker to stop, aborting
    ///   any that do not.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // === Phase 0: Stop accepting new messages ===
        tracing::info!("Refusing new messages");
        self.hub.queue.stop_accepting();

        // === Phase 1: Let queued and in-flight messages drain ===
        tracing::info!(
            "Draining {} queued and {} in-flight messages",
            self.hub.queue.len(),
            self.in_flight()
        );
        let drain_result = timeout(self.shutdown_timeout, async {
            while !self.is_idle() {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => tracing::debug!("Inbound queue drained successfully"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} queued, {} in flight)",
                self.hub.queue.len(),
                self.in_flight()
            ),
        }

        // === Phase 2: Cancel the workers ===
        tracing::debug!("Cancelling workers via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Wait for every worker to stop ===
        let handles = core::mem::take(&mut *self.handles.lock());
        tracing::debug!(
            "Waiting for up to {WORKER_STOP_TIMEOUT:?} per worker ({} workers)",
            handles.len()
        );

        let stops = handles.into_iter().enumerate().map(|(i, mut handle)| async move {
            match timeout(WORKER_STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => tracing::trace!("Worker {i} stopped"),
                Ok(Err(e)) => tracing::error!("Worker {i} returned error: {e}"),
                Err(_) => {
                    tracing::warn!("Worker {i} shutdown timed out; aborting");
                    handle.abort();
                }
            }
        });
        join_all(stops).await;

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }
}
