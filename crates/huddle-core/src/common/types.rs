//! # Wire and Queue Types
//!
//! This module defines the shapes exchanged between clients and the relay,
//! and the internal records passed from connection loops to workers.
//!
//! ## Overview
//!
//! - [`InboundFrame`] - what a client sends: `{sender, content, id}`
//! - [`Envelope`] - what the relay broadcasts, tagged by `type`
//! - [`Message`] - an accepted frame, attributed to its connection and session
//! - [`HistoryEntry`] - one completed exchange kept as context
//!
//! All JSON is handled with `serde`. An [`Envelope`] is serialized once per
//! broadcast and the resulting text is shared by every recipient.

use crate::Result;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Sender name stamped on every generated response.
pub const AI_SENDER: &str = "AI";

/// Identity of one live client connection.
///
/// Allocated by the connection registry and never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A chat message as sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    pub sender: String,
    pub content: String,
    pub id: String,
}

impl InboundFrame {
    /// Decodes a text frame. Missing fields and invalid JSON are reported as
    /// [`Error::MalformedFrame`].
    ///
    /// [`Error::MalformedFrame`]: crate::Error::MalformedFrame
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Outbound frame delivered verbatim to every registered connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Echo of a client message to every participant.
    UserMessage {
        sender: String,
        content: String,
        id: String,
    },
    /// Generated reply to the message with the same `id`.
    AiResponse {
        sender: String,
        recipient: String,
        content: String,
        id: String,
    },
}

impl Envelope {
    pub fn user_message(message: &Message) -> Self {
        Envelope::UserMessage {
            sender: message.sender.clone(),
            content: message.content.clone(),
            id: message.id.clone(),
        }
    }

    /// Builds the reply to `message`. The recipient is the original sender.
    pub fn ai_response(message: &Message, content: String) -> Self {
        Envelope::AiResponse {
            sender: AI_SENDER.to_string(),
            recipient: message.sender.clone(),
            content,
            id: message.id.clone(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Envelope::UserMessage { id, .. } | Envelope::AiResponse { id, .. } => id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::ChannelError {
            context: format!("Failed to encode envelope: {e}"),
        })
    }
}

/// An accepted inbound message waiting for a worker.
///
/// Consumed exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Connection the frame arrived on.
    pub connection: ConnectionId,
    /// Conversation session that was current when the frame arrived.
    pub session: u64,
    pub sender: String,
    pub content: String,
    pub id: String,
}

impl Message {
    pub fn new(connection: ConnectionId, session: u64, frame: InboundFrame) -> Self {
        Self {
            connection,
            session,
            sender: frame.sender,
            content: frame.content,
            id: frame.id,
        }
    }
}

/// One completed exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub prompt: String,
    pub response: String,
}
