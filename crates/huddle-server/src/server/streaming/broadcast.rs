//! Fan-out of one envelope to every live connection.

use crate::server::{
    session::registry::{OutboundFrame, Registry},
    telemetry::increment_broadcast_failures,
};
use core::time::Duration;
use huddle_core::{Result, types::Envelope};

/// Result of one [`broadcast`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: usize,
}

/// Serializes `envelope` once and offers it to every registered connection.
///
/// Recipients are taken from a registry snapshot, so connections that join
/// mid-broadcast are not included. Sends run concurrently and each is
/// bounded by `send_timeout`. A connection that is closed or cannot accept
/// the frame in time is evicted from the registry and the broadcast carries
/// on with the others.
///
/// # Errors
///
/// Only fails if the envelope cannot be encoded; delivery problems are
/// reported through [`Delivery`].
pub async fn broadcast(
    registry: &Registry,
    envelope: &Envelope,
    send_timeout: Duration,
) -> Result<Delivery> {
    let frame = OutboundFrame::from(envelope.to_json()?);
    let recipients = registry.snapshot();

    let sends = recipients.iter().map(|client| {
        let frame = frame.clone();
        async move { (client.id(), client.send(frame, send_timeout).await) }
    });

    let mut delivery = Delivery::default();
    for (id, sent) in futures::future::join_all(sends).await {
        match sent {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                tracing::warn!("Evicting {id} after failed send of {}: {e}", envelope.id());
                increment_broadcast_failures();
                registry.remove(id).await;
                delivery.evicted += 1;
            }
        }
    }

    Ok(delivery)
}
