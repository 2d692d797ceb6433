//! Session directory: polled conversation summaries and read-state
//!
//! The directory is the only writer of `unread_count`, except for the
//! optimistic zeroing done when a session is selected. The next poll is
//! authoritative and may raise the count again, but only if a message newer
//! than the mark-read point has arrived.

use chrono::{DateTime, Utc};
use shared::{ApiError, ChatApi, ChatSession};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ChatError;

/// Result of one directory refresh
pub type PollOutcome = Result<Vec<ChatSession>, ApiError>;

/// Local view of every known session
#[derive(Debug, Default)]
pub struct SessionDirectory {
    sessions: HashMap<Uuid, ChatSession>,
    selected: Option<Uuid>,
    /// Session -> newest message time known when it was marked read
    read_marks: HashMap<Uuid, Option<DateTime<Utc>>>,
    loaded: bool,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once at least one poll has succeeded
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.selected
    }

    pub fn get(&self, id: Uuid) -> Option<&ChatSession> {
        self.sessions.get(&id)
    }

    pub fn total_unread(&self) -> u32 {
        self.sessions.values().map(|s| s.unread_count).sum()
    }

    pub fn select(&mut self, id: Uuid) {
        self.selected = Some(id);
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    /// Optimistically zero the unread counter of a session.
    ///
    /// A session not listed yet is marked as read up to now.
    pub fn mark_read_local(&mut self, id: Uuid) {
        let seen_up_to = match self.sessions.get_mut(&id) {
            Some(session) => {
                session.unread_count = 0;
                session.last_activity()
            }
            None => Some(Utc::now()),
        };
        self.read_marks.insert(id, seen_up_to);
    }

    /// Merge a fresh poll result into local state.
    ///
    /// Sessions missing from the response are dropped, except the selected
    /// one, which keeps its prior summary.
    pub fn apply_refresh(&mut self, fetched: Vec<ChatSession>) {
        let mut next = HashMap::with_capacity(fetched.len());

        for mut session in fetched {
            if let Some(mark) = self.read_marks.get(&session.id).copied() {
                let newer = match (session.last_activity(), mark) {
                    (Some(latest), Some(seen)) => latest > seen,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if session.unread_count == 0 || newer {
                    self.read_marks.remove(&session.id);
                } else {
                    debug!(
                        "Keeping session {} read until server catches up ({} unread reported)",
                        session.id, session.unread_count
                    );
                    session.unread_count = 0;
                }
            }
            next.insert(session.id, session);
        }

        if let Some(selected) = self.selected {
            if !next.contains_key(&selected) {
                if let Some(prior) = self.sessions.remove(&selected) {
                    debug!("Selected session {} missing from poll, keeping it", selected);
                    next.insert(selected, prior);
                }
            }
        }

        let selected = self.selected;
        self.read_marks
            .retain(|id, _| next.contains_key(id) || Some(*id) == selected);
        self.sessions = next;
        self.loaded = true;
    }

    /// Sessions ordered by latest message (newest first), ties by id.
    /// Sessions without messages sort last.
    pub fn sorted(&self) -> Vec<ChatSession> {
        let mut sessions: Vec<ChatSession> = self.sessions.values().cloned().collect();
        sessions.sort_by(ChatSession::newest_first);
        sessions
    }
}

/// Poll the session list on a fixed interval until cancelled.
///
/// The first refresh happens immediately. Failures are reported like any
/// other outcome; the loop keeps its schedule either way.
pub fn spawn_poller(
    api: Arc<dyn ChatApi>,
    interval: Duration,
    outcomes: mpsc::UnboundedSender<PollOutcome>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = api.list_sessions() => outcome,
            };

            if let Err(e) = &outcome {
                warn!("{}", ChatError::DirectoryPoll(e.clone()));
            }

            if outcomes.send(outcome).is_err() {
                break;
            }
        }
        debug!("Session directory poller stopped");
    })
}
