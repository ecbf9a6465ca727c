//! In-process conversation memory.
//!
//! Sessions live in a sharded map owned by the application state. Each
//! mutation holds one shard lock for the duration of a `VecDeque` push and
//! trim, never across I/O.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Turns kept per session; older ones are dropped first.
pub const MAX_TURNS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("not authorized to access this session")]
    Forbidden,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ConversationSession {
    #[serde(skip)]
    owner: String,
    pub messages: VecDeque<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    fn new(owner: &str) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.to_string(),
            messages: VecDeque::with_capacity(MAX_TURNS + 1),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Completed user/assistant exchanges.
    pub fn turn_pairs(&self) -> usize {
        self.messages.len() / 2
    }
}

/// Whether `session_id` carries `identity`'s ownership prefix.
pub fn has_owner_prefix(session_id: &str, identity: &str) -> bool {
    session_id
        .strip_prefix(identity)
        .is_some_and(|rest| rest.starts_with('-'))
}

pub struct SessionStore {
    sessions: DashMap<String, ConversationSession>,
    max_turns: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_max_turns(MAX_TURNS)
    }

    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn new_session_id(identity: &str) -> String {
        format!("{}-{}", identity, uuid::Uuid::new_v4())
    }

    /// Resolve the session to use for `identity`, creating it if needed.
    ///
    /// Without an id a fresh `<identity>-<uuid>` session is created. A
    /// supplied id must carry the caller's prefix and, if it already exists,
    /// belong to the caller.
    pub fn get_or_create(&self, session_id: Option<&str>, identity: &str) -> Result<String, SessionError> {
        let id = match session_id.filter(|s| !s.is_empty()) {
            Some(id) => {
                if !has_owner_prefix(id, identity) {
                    return Err(SessionError::Forbidden);
                }
                id.to_string()
            }
            None => Self::new_session_id(identity),
        };
        let entry = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| ConversationSession::new(identity));
        if entry.owner != identity {
            return Err(SessionError::Forbidden);
        }
        Ok(id)
    }

    /// Append a turn; returns false (and does nothing) for unknown sessions.
    pub fn append(&self, session_id: &str, role: Role, content: impl Into<String>) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session.messages.push_back(Turn::new(role, content));
        while session.messages.len() > self.max_turns {
            session.messages.pop_front();
        }
        session.updated_at = Utc::now();
        true
    }

    pub fn read(&self, session_id: &str) -> Option<ConversationSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Read on behalf of `identity`. Ownership is checked before existence so
    /// probing foreign ids never reveals whether they exist.
    pub fn read_owned(&self, session_id: &str, identity: &str) -> Result<ConversationSession, SessionError> {
        if !has_owner_prefix(session_id, identity) {
            return Err(SessionError::Forbidden);
        }
        let session = self.read(session_id).ok_or(SessionError::NotFound)?;
        if session.owner != identity {
            return Err(SessionError::Forbidden);
        }
        Ok(session)
    }

    pub fn history(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .get(session_id)
            .map(|s| s.messages.iter().cloned().collect())
            .unwrap_or_default()
    }
}
