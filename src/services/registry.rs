//! Session registry — live `BoardSession` records and their participants.
//!
//! DESIGN
//! ======
//! Two indices (session id → session, board id → session id) live behind a
//! single lock so that create-if-absent and remove-if-empty are atomic: at
//! most one live session exists per board. Lookups return `Option`; callers
//! decide whether absence is an error.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::now_ms;
use crate::state::{BoardSession, Participant};

#[derive(Default)]
struct Indices {
    sessions: HashMap<Uuid, BoardSession>,
    by_board: HashMap<String, Uuid>,
}

/// Result of removing a participant from a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    /// Whether the participant was present.
    pub removed: bool,
    /// Participants left in the session afterwards.
    pub remaining: usize,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Indices>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the board's live session, creating an empty one if none exists.
    pub async fn create_session(&self, board_id: &str, state_id: &str) -> BoardSession {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .by_board
            .get(board_id)
            .and_then(|id| inner.sessions.get(id))
        {
            return existing.clone();
        }

        let session = BoardSession {
            session_id: Uuid::new_v4(),
            board_id: board_id.to_owned(),
            state_id: state_id.to_owned(),
            participants: Vec::new(),
        };
        inner.by_board.insert(board_id.to_owned(), session.session_id);
        inner.sessions.insert(session.session_id, session.clone());
        info!(session_id = %session.session_id, %board_id, "session created");
        session
    }

    pub async fn get_session(&self, session_id: Uuid) -> Option<BoardSession> {
        self.inner.read().await.sessions.get(&session_id).cloned()
    }

    pub async fn get_session_by_board_id(&self, board_id: &str) -> Option<BoardSession> {
        let inner = self.inner.read().await;
        inner
            .by_board
            .get(board_id)
            .and_then(|id| inner.sessions.get(id))
            .cloned()
    }

    /// Delete a session record. Returns the removed session, if any.
    pub async fn remove_session(&self, session_id: Uuid) -> Option<BoardSession> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.remove(&session_id) else {
            warn!(%session_id, "remove_session: session not found");
            return None;
        };
        inner.by_board.remove(&session.board_id);
        info!(%session_id, board_id = %session.board_id, "session removed");
        Some(session)
    }

    /// Delete a session only if it has no participants left. Atomic with
    /// respect to concurrent joins.
    pub async fn remove_session_if_empty(&self, session_id: Uuid) -> Option<BoardSession> {
        let mut inner = self.inner.write().await;
        let empty = inner
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.participants.is_empty());
        if !empty {
            return None;
        }
        let session = inner.sessions.remove(&session_id)?;
        inner.by_board.remove(&session.board_id);
        info!(%session_id, board_id = %session.board_id, "empty session removed");
        Some(session)
    }

    /// Add a participant unless one with the same id is present. Stamps
    /// `joined_at`. `None` if the session does not exist.
    pub async fn add_participant(&self, session_id: Uuid, participant: Participant) -> Option<BoardSession> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            warn!(%session_id, participant_id = %participant.id, "add_participant: session not found");
            return None;
        };

        if session.participants.iter().any(|p| p.id == participant.id) {
            info!(%session_id, participant_id = %participant.id, "participant already present");
        } else {
            info!(%session_id, participant_id = %participant.id, name = %participant.name, "participant added");
            session.participants.push(Participant { joined_at: now_ms(), ..participant });
        }
        Some(session.clone())
    }

    /// Remove a participant by id. `None` if the session does not exist;
    /// an absent participant is reported through `Departure::removed`.
    pub async fn remove_participant(&self, session_id: Uuid, participant_id: &str) -> Option<Departure> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            warn!(%session_id, %participant_id, "remove_participant: session not found");
            return None;
        };

        let before = session.participants.len();
        session.participants.retain(|p| p.id != participant_id);
        let remaining = session.participants.len();
        info!(%session_id, %participant_id, remaining, "participant removed");
        Some(Departure { removed: remaining < before, remaining })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
