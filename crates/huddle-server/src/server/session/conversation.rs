//! The exclusive section: shared history plus the generation engine.
//!
//! The engine is not safe for concurrent calls, so it lives in the same
//! mutex as the conversation history. Holding the guard is the only way to
//! reach either one, which means at most one generation runs at any instant
//! no matter how many workers the pool has. The guard is held across the
//! engine call and the history append, and released before the response is
//! broadcast.
//!
//! ## Sessions
//!
//! A session spans the time during which at least one client is connected.
//! The registry ends a session when its occupancy drops to zero. Each
//! [`Message`] remembers the session it arrived in, and its exchange is only
//! recorded if that session is still current when generation finishes.
//! Messages from an ended session are answered but never leak into the next
//! conversation.

use crate::server::telemetry::record_generation_duration;
use core::{num::NonZeroUsize, time::Duration};
use huddle_core::{
    EngineError, Error, Result,
    engine::GenerationEngine,
    prompt::PromptTemplate,
    types::{HistoryEntry, Message},
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};
use tokio::{sync::Mutex, time::timeout};

/// Ordered log of completed exchanges for one session.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    session: u64,
    limit: Option<NonZeroUsize>,
}

impl History {
    fn new(limit: Option<NonZeroUsize>) -> Self {
        Self {
            entries: VecDeque::new(),
            session: 0,
            limit,
        }
    }

    /// Oldest-first iterator over the recorded exchanges.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Entries that belong to `session`. A log left over from an earlier
    /// session reads as empty even before it has been cleared.
    fn visible(&self, session: u64) -> impl ExactSizeIterator<Item = &HistoryEntry> {
        let shown = if self.session < session {
            0
        } else {
            self.entries.len()
        };
        self.entries.iter().take(shown)
    }

    /// Moves the log forward to `session`, dropping entries from earlier
    /// sessions. Returns `true` if anything was reset.
    fn adopt(&mut self, session: u64) -> bool {
        if self.session >= session {
            return false;
        }
        self.entries.clear();
        self.session = session;
        true
    }

    fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        if let Some(limit) = self.limit {
            while self.entries.len() > limit.get() {
                self.entries.pop_front();
            }
        }
    }
}

struct Exclusive {
    engine: Box<dyn GenerationEngine>,
    history: History,
}

/// Shared conversation state guarded by a single exclusive section.
pub struct Conversation {
    exclusive: Arc<Mutex<Exclusive>>,
    session: AtomicU64,
    template: PromptTemplate,
    generation_timeout: Option<Duration>,
}

impl Conversation {
    pub fn new(
        engine: Box<dyn GenerationEngine>,
        template: PromptTemplate,
        history_limit: Option<NonZeroUsize>,
        generation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            exclusive: Arc::new(Mutex::new(Exclusive {
                engine,
                history: History::new(history_limit),
            })),
            session: AtomicU64::new(0),
            template,
            generation_timeout,
        }
    }

    /// The session new messages are attributed to.
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// Starts a new session and returns its number.
    ///
    /// Lock-free so the registry can call it while holding its own lock.
    pub(crate) fn end_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clears the history if it still belongs to a session before `session`.
    pub async fn reset(&self, session: u64) {
        let mut exclusive = self.exclusive.lock().await;
        if exclusive.history.adopt(session) {
            tracing::debug!("Conversation history reset for session {session}");
        }
    }

    /// Number of exchanges recorded in the current session.
    pub async fn history_len(&self) -> usize {
        let exclusive = self.exclusive.lock().await;
        exclusive.history.visible(self.session()).len()
    }

    /// Copies the current session's exchanges, oldest first.
    ///
    /// Exchanges from an ended session are never returned, even if the
    /// registry has not yet cleared them.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        let exclusive = self.exclusive.lock().await;
        exclusive.history.visible(self.session()).cloned().collect()
    }

    /// Generates the reply to `message` inside the exclusive section.
    ///
    /// The prompt is built from the current history, the engine runs on the
    /// blocking pool with the guard moved into it, and the exchange is
    /// appended before the guard is released.
    ///
    /// # Errors
    ///
    /// - [`Error::Generation`] if the engine fails or panics.
    /// - [`Error::GenerationTimeout`] if a deadline is configured and the
    ///   engine misses it. The guard stays with the engine call until it
    ///   returns, so a late engine never overlaps the next one.
    pub async fn respond(&self, message: &Message) -> Result<String> {
        let mut guard = Arc::clone(&self.exclusive).lock_owned().await;
        guard.history.adopt(self.session());

        let prompt = self.template.render(guard.history.iter(), &message.content);
        let start = Instant::now();

        let task = tokio::task::spawn_blocking(move || {
            let output = guard.engine.generate(&prompt);
            (guard, output)
        });

        let joined = match self.generation_timeout {
            Some(after) => timeout(after, task)
                .await
                .map_err(|_| Error::GenerationTimeout { after })?,
            None => task.await,
        };
        let (mut guard, output) = joined.map_err(|_| Error::Generation(EngineError::Panicked))?;
        record_generation_duration(start.elapsed().as_millis() as f64);
        let response = output?;

        if message.session == self.session() {
            guard.history.push(HistoryEntry {
                prompt: message.content.clone(),
                response: response.clone(),
            });
        } else {
            tracing::debug!(
                "Session {} ended during generation; exchange {} not recorded",
                message.session,
                message.id
            );
        }

        Ok(response)
    }
}
