//! Live connection membership.
//!
//! The [`Registry`] owns one [`ClientHandle`] per open connection. A handle
//! is the sending half of that connection's outbound channel; dropping it
//! (by removing the entry) lets the connection's writer task drain and close
//! the socket.
//!
//! Occupancy is coupled to the conversation: when the last connection leaves,
//! the registry ends the current session and clears the shared history. The
//! registry lock is released before the history is touched, so no path holds
//! both locks.

use crate::server::{
    session::conversation::Conversation,
    telemetry::{decrement_connections, increment_connections},
};
use axum::extract::ws::Utf8Bytes;
use core::time::Duration;
use huddle_core::{Error, Result, types::ConnectionId};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc::{self, error::SendTimeoutError};

/// A serialized envelope, shared by every recipient of a broadcast.
pub type OutboundFrame = Utf8Bytes;

/// Handle to one live connection's outbound channel.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<OutboundFrame>,
}

impl ClientHandle {
    pub const fn new(id: ConnectionId, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self { id, outbound }
    }

    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `frame` for this connection, waiting at most `within` for room.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the connection is gone or too slow
    /// to accept the frame in time.
    pub async fn send(&self, frame: OutboundFrame, within: Duration) -> Result<()> {
        self.outbound
            .send_timeout(frame, within)
            .await
            .map_err(|e| Error::ChannelError {
                context: match e {
                    SendTimeoutError::Timeout(_) => {
                        format!("{} did not accept a frame within {within:?}", self.id)
                    }
                    SendTimeoutError::Closed(_) => format!("{} is closed", self.id),
                },
            })
    }
}

/// Outcome of [`Registry::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Departure {
    /// The connection was not (or no longer) registered.
    NotRegistered,
    /// Other connections remain.
    Remaining(usize),
    /// The last connection left; `session` is the session that begins now.
    Vacated { session: u64 },
}

/// Thread-safe set of live connections.
pub struct Registry {
    clients: Mutex<HashMap<ConnectionId, ClientHandle>>,
    next_id: AtomicU64,
    conversation: Arc<Conversation>,
}

impl Registry {
    pub fn new(conversation: Arc<Conversation>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            conversation,
        }
    }

    /// Hands out a connection identity that is unique for the process.
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a connection. Registering the same identity twice is a
    /// no-op and returns `false`.
    pub fn add(&self, client: ClientHandle) -> bool {
        let mut clients = self.clients.lock();
        if clients.contains_key(&client.id) {
            return false;
        }
        clients.insert(client.id, client);
        increment_connections();
        true
    }

    /// Deregisters a connection, ending the session if it was the last one.
    ///
    /// Safe to call more than once for the same connection.
    pub async fn remove(&self, id: ConnectionId) -> Departure {
        let departure = {
            let mut clients = self.clients.lock();
            match clients.remove(&id) {
                None => Departure::NotRegistered,
                Some(_) if clients.is_empty() => Departure::Vacated {
                    session: self.conversation.end_session(),
                },
                Some(_) => Departure::Remaining(clients.len()),
            }
        };

        if departure != Departure::NotRegistered {
            decrement_connections();
        }

        if let Departure::Vacated { session } = departure {
            self.conversation.reset(session).await;
            tracing::info!("Zero clients remain - chat history cleared");
        }

        departure
    }

    /// Point-in-time copy of the live connections.
    ///
    /// Broadcasts iterate over this copy so no network send ever waits on
    /// the registry lock.
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
