//! Per-session ordered message history
//!
//! The log is the single sink for history snapshots, live frames and local
//! sends. Messages are kept sorted by `(created_at, server id)`; entries that
//! the server has not confirmed yet tie-break by insertion order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{MessageRecord, Sender};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::ChatError;

/// How far a live echo's server timestamp may trail the local send time
/// and still be taken as the echo of that send.
const ECHO_CLOCK_SKEW_SECS: i64 = 30;

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Sent locally, waiting for the server to confirm
    Pending,
    /// Stored on the server
    Sent,
    /// Not confirmed in time; can be resent manually
    Failed,
}

/// A message in a session log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Server id once confirmed, the client id before that
    pub id: Uuid,
    /// Client-generated id, present only for messages sent from this client
    pub client_id: Option<Uuid>,
    pub session_id: Uuid,
    pub sender: Sender,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
    #[serde(skip)]
    seq: u64,
    /// Local clock when the send was queued (server time for confirmed records)
    #[serde(skip)]
    sent_at: DateTime<Utc>,
}

impl Message {
    fn confirmed(session_id: Uuid, record: MessageRecord, seq: u64) -> Self {
        Self {
            id: record.id,
            client_id: None,
            session_id,
            sender: record.sender,
            content: record.content,
            created_at: record.created_at,
            state: DeliveryState::Sent,
            seq,
            sent_at: record.created_at,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DeliveryState::Sent
    }

    fn order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| match (self.is_confirmed(), other.is_confirmed()) {
                (true, true) => self.id.cmp(&other.id),
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => self.seq.cmp(&other.seq),
            })
    }
}

/// What `SessionLog::append` did with an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Already present (by server id, or same sender/content/timestamp)
    Duplicate,
    /// Matched a local pending send; carries that send's client id
    Reconciled(Uuid),
}

/// What `SessionLog::acknowledge` did with a server ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// No local send has that client id
    Unknown,
    Confirmed,
    /// Confirmed, and the server id had been claimed by another send through
    /// a content match. That send (carried here) is pending again.
    Reassigned(Uuid),
}

/// Ordered history of a single session
#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: Uuid,
    local_role: Sender,
    entries: Vec<Message>,
    next_seq: u64,
}

impl SessionLog {
    pub fn new(session_id: Uuid, local_role: Sender) -> Self {
        Self {
            session_id,
            local_role,
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_client_id(&self, client_id: Uuid) -> Option<&Message> {
        self.entries
            .iter()
            .find(|m| m.client_id == Some(client_id))
    }

    /// Client ids of every send still waiting for confirmation
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|m| m.state == DeliveryState::Pending)
            .filter_map(|m| m.client_id)
            .collect()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn resort(&mut self) {
        self.entries.sort_by(Message::order);
    }

    /// Seed the log with a history snapshot. Returns how many were new.
    ///
    /// Snapshot records never reconcile local sends; a stored copy of a send
    /// is folded into it when that send's ack arrives.
    pub fn history_loaded(&mut self, records: Vec<MessageRecord>) -> usize {
        records
            .into_iter()
            .filter(|record| self.insert(record.clone(), false) == AppendOutcome::Inserted)
            .count()
    }

    /// Append a server-confirmed message from the live stream.
    ///
    /// Idempotent by server id. An own message that matches a pending send by
    /// content reconciles the oldest such send instead of adding a second copy.
    pub fn append(&mut self, record: MessageRecord) -> AppendOutcome {
        self.insert(record, true)
    }

    fn insert(&mut self, record: MessageRecord, reconcile: bool) -> AppendOutcome {
        if self.entries.iter().any(|m| m.id == record.id) {
            return AppendOutcome::Duplicate;
        }

        if reconcile && record.sender == self.local_role {
            if let Some(client_id) = self.reconcile_by_content(&record) {
                return AppendOutcome::Reconciled(client_id);
            }
        }

        if self.entries.iter().any(|m| {
            m.sender == record.sender
                && m.created_at == record.created_at
                && m.content == record.content
        }) {
            return AppendOutcome::Duplicate;
        }

        let seq = self.next_seq();
        let message = Message::confirmed(self.session_id, record, seq);
        let at = self
            .entries
            .partition_point(|m| m.order(&message) == Ordering::Less);
        self.entries.insert(at, message);
        AppendOutcome::Inserted
    }

    fn reconcile_by_content(&mut self, record: &MessageRecord) -> Option<Uuid> {
        // An echo stored before the send was queued belongs to an older message.
        let latest_send = record.created_at + chrono::Duration::seconds(ECHO_CLOCK_SKEW_SECS);
        let candidate = |state: DeliveryState| {
            self.entries
                .iter()
                .filter(|m| m.state == state && m.content == record.content)
                .filter(|m| m.sent_at <= latest_send)
                .min_by_key(|m| m.seq)
                .map(|m| m.seq)
        };
        let seq = candidate(DeliveryState::Pending).or_else(|| candidate(DeliveryState::Failed))?;
        let entry = self.entries.iter_mut().find(|m| m.seq == seq)?;
        entry.id = record.id;
        entry.created_at = record.created_at;
        entry.state = DeliveryState::Sent;
        let client_id = entry.client_id;
        self.resort();
        client_id
    }

    /// Insert a new outgoing message as pending at the tail.
    pub fn push_pending(&mut self, content: impl Into<String>, now: DateTime<Utc>) -> Message {
        let client_id = Uuid::new_v4();
        let created_at = self
            .entries
            .last()
            .map(|last| last.created_at.max(now))
            .unwrap_or(now);
        let message = Message {
            id: client_id,
            client_id: Some(client_id),
            session_id: self.session_id,
            sender: self.local_role,
            content: content.into(),
            created_at,
            state: DeliveryState::Pending,
            seq: self.next_seq(),
            sent_at: now,
        };
        self.entries.push(message.clone());
        message
    }

    /// Apply a server ack carrying back the client id.
    ///
    /// Reports `Reassigned` when the ack takes the server id back from a
    /// different send that claimed it by content; the caller owns that send's
    /// ack deadline.
    pub fn acknowledge(
        &mut self,
        client_id: Uuid,
        server_id: Uuid,
        created_at: Option<DateTime<Utc>>,
    ) -> AckOutcome {
        let Some(index) = self
            .entries
            .iter()
            .position(|m| m.client_id == Some(client_id))
        else {
            return AckOutcome::Unknown;
        };

        if self.entries[index].is_confirmed() && self.entries[index].id == server_id {
            return AckOutcome::Confirmed;
        }

        let mut outcome = AckOutcome::Confirmed;

        // A content echo may have claimed this server id for a different
        // send with identical text; give that entry back its own identity.
        if let Some(other) = self
            .entries
            .iter_mut()
            .find(|m| m.id == server_id && m.client_id != Some(client_id))
        {
            match other.client_id {
                Some(other_client) => {
                    debug!("Ack {} corrects content match on {}", client_id, other_client);
                    other.id = other_client;
                    other.state = DeliveryState::Pending;
                    outcome = AckOutcome::Reassigned(other_client);
                }
                None => {
                    // Server copy arrived on its own; the local entry is redundant.
                    self.entries.remove(index);
                    return AckOutcome::Confirmed;
                }
            }
        }

        let entry = &mut self.entries[index];
        entry.id = server_id;
        entry.state = DeliveryState::Sent;
        if let Some(at) = created_at {
            entry.created_at = at;
        }
        self.resort();
        outcome
    }

    /// Mark a pending send as failed. Returns false if it was not pending.
    pub fn mark_failed(&mut self, client_id: Uuid) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|m| m.client_id == Some(client_id) && m.state == DeliveryState::Pending)
        {
            Some(entry) => {
                entry.state = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    /// Fail every pending send (their channel is gone). Returns their client ids.
    pub fn fail_pending(&mut self) -> Vec<Uuid> {
        let ids = self.pending_ids();
        for id in &ids {
            self.mark_failed(*id);
        }
        ids
    }

    /// Replace a failed send with a fresh pending copy of the same text.
    pub fn take_for_resend(
        &mut self,
        client_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Message, ChatError> {
        let index = self
            .entries
            .iter()
            .position(|m| m.client_id == Some(client_id))
            .ok_or(ChatError::UnknownMessage(client_id))?;
        if self.entries[index].state != DeliveryState::Failed {
            return Err(ChatError::NotRetryable(client_id));
        }
        let failed = self.entries.remove(index);
        Ok(self.push_pending(failed.content, now))
    }
}

/// Message logs for every session opened during this run
#[derive(Debug)]
pub struct MessageLog {
    local_role: Sender,
    sessions: HashMap<Uuid, SessionLog>,
}

impl MessageLog {
    pub fn new(local_role: Sender) -> Self {
        Self {
            local_role,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&self, session_id: Uuid) -> Option<&SessionLog> {
        self.sessions.get(&session_id)
    }

    pub fn session_mut(&mut self, session_id: Uuid) -> &mut SessionLog {
        let role = self.local_role;
        self.sessions
            .entry(session_id)
            .or_insert_with(|| SessionLog::new(session_id, role))
    }

    pub fn messages(&self, session_id: Uuid) -> &[Message] {
        self.sessions
            .get(&session_id)
            .map(SessionLog::messages)
            .unwrap_or(&[])
    }
}
