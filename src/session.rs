//! Chained conversation sessions.
//!
//! The conversation timeline is cut into sessions by inactivity: once the
//! idle window elapses, the next append lands in a fresh session that links
//! back to the previous one and carries the tail of its messages forward as
//! context. History reads walk the chain backward, newest first, skipping
//! carried context so no message appears twice.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::ConversationRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Carried forward from the previous session; excluded from history
    /// pagination so the original is the only copy readers see.
    #[serde(default)]
    pub is_context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<SessionId>,
    pub messages: Vec<SessionMessage>,
}

impl Session {
    fn new(previous: Option<SessionId>, carried: Vec<SessionMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            created_at: now,
            last_active_at: now,
            previous_session_id: previous,
            messages: carried,
        }
    }
}

/// Pagination cursor: the next (older) message to consider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub session_id: SessionId,
    /// Exclusive upper bound into that session's messages.
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Messages in chronological order within the page.
    pub messages: Vec<SessionMessage>,
    pub next_cursor: Option<HistoryCursor>,
    pub has_more: bool,
}

struct Inner {
    sessions: HashMap<SessionId, Session>,
    current: SessionId,
}

/// Owns the session chain and applies the inactivity rotation rule.
pub struct SessionManager {
    inner: Mutex<Inner>,
    idle: chrono::Duration,
    carry_forward: usize,
}

impl SessionManager {
    pub fn new(idle: Duration, carry_forward: usize) -> Self {
        let first = Session::new(None, Vec::new());
        let current = first.id;
        let mut sessions = HashMap::new();
        sessions.insert(first.id, first);
        Self {
            inner: Mutex::new(Inner { sessions, current }),
            idle: chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::minutes(30)),
            carry_forward,
        }
    }

    pub fn current_session_id(&self) -> SessionId {
        self.inner.lock().expect("session lock poisoned").current
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .sessions
            .get(&id)
            .cloned()
    }

    /// Append a message, first rotating to a fresh chained session when the
    /// idle window has elapsed. Returns the session the message landed in.
    pub fn append(&self, role: ConversationRole, content: impl Into<String>) -> SessionId {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("session lock poisoned");

        let expired = inner
            .sessions
            .get(&inner.current)
            .map(|s| now.signed_duration_since(s.last_active_at) > self.idle)
            .unwrap_or(true);

        if expired {
            let previous_id = inner.current;
            let carried = inner
                .sessions
                .get(&previous_id)
                .map(|previous| {
                    let take = self.carry_forward.min(previous.messages.len());
                    previous.messages[previous.messages.len() - take..]
                        .iter()
                        .cloned()
                        .map(|mut m| {
                            m.is_context = true;
                            m
                        })
                        .collect()
                })
                .unwrap_or_default();
            let fresh = Session::new(Some(previous_id), carried);
            inner.current = fresh.id;
            inner.sessions.insert(fresh.id, fresh);
            tracing::debug!(session_id = %inner.current, previous = %previous_id, "rotated to new session");
        }

        let current = inner.current;
        if let Some(session) = inner.sessions.get_mut(&current) {
            session.messages.push(SessionMessage {
                role,
                content: content.into(),
                timestamp: now,
                is_context: false,
            });
            session.last_active_at = now;
        }
        current
    }

    /// Page backward through history from `cursor` (or the live end when
    /// `None`), following the session chain and skipping carried context.
    /// A visited set bounds the walk even on a corrupted chain.
    pub fn history_before(&self, cursor: Option<HistoryCursor>, limit: usize) -> HistoryPage {
        let inner = self.inner.lock().expect("session lock poisoned");
        let mut visited: HashSet<SessionId> = HashSet::new();

        let (mut session_id, mut index) = match cursor {
            Some(cursor) => (Some(cursor.session_id), cursor.index),
            None => {
                let current = inner.current;
                let end = inner
                    .sessions
                    .get(&current)
                    .map(|s| s.messages.len())
                    .unwrap_or(0);
                (Some(current), end)
            }
        };

        // Collected newest-first, reversed to chronological at the end.
        let mut collected: Vec<SessionMessage> = Vec::new();
        let mut next_cursor = None;

        'walk: while let Some(id) = session_id {
            if !visited.insert(id) {
                tracing::warn!(session_id = %id, "cycle in session chain, stopping history walk");
                break;
            }
            let Some(session) = inner.sessions.get(&id) else {
                break;
            };
            let mut pos = index.min(session.messages.len());
            while pos > 0 {
                pos -= 1;
                let message = &session.messages[pos];
                if message.is_context {
                    continue;
                }
                if collected.len() == limit {
                    next_cursor = Some(HistoryCursor {
                        session_id: id,
                        index: pos + 1,
                    });
                    break 'walk;
                }
                collected.push(message.clone());
            }
            session_id = session.previous_session_id;
            index = session_id
                .and_then(|prev| inner.sessions.get(&prev))
                .map(|s| s.messages.len())
                .unwrap_or(0);
        }

        collected.reverse();
        HistoryPage {
            messages: collected,
            has_more: next_cursor.is_some(),
            next_cursor,
        }
    }

    /// Number of sessions in the chain.
    pub fn session_count(&self) -> usize {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .sessions
            .len()
    }

    #[cfg(test)]
    fn backdate_current(&self, by: Duration) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        let current = inner.current;
        if let Some(session) = inner.sessions.get_mut(&current) {
            session.last_active_at = session.last_active_at
                - chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }

    #[cfg(test)]
    fn force_previous_link(&self, id: SessionId, previous: Option<SessionId>) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.previous_session_id = previous;
        }
    }
}
