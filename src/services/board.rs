//! Board service — session orchestration, hydration, and broadcast.
//!
//! DESIGN
//! ======
//! This is the layer the gateway and REST routes talk to. It composes the
//! session registry and the state store, which only know each other's ids:
//! joining a board is what triggers lazy hydration from the repository, and
//! the last participant leaving is what closes the session.
//!
//! Teardown removes the session record at once, then retires the board. A
//! retired board is flushed and evicted only when clean, so a failed final
//! flush keeps edits in memory for the background task to retry.
//!
//! ERROR HANDLING
//! ==============
//! A live session whose board was evicted by a racing teardown rehydrates it
//! from storage. Eviction only ever drops clean boards, so the stored copy is
//! current. Flush failures after a successful batch are logged, never
//! returned: the in-memory board is authoritative.

use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::{ErrorCode, Frame};
use crate::services::persistence::{self, RepositoryError};
use crate::services::store::StateError;
use crate::shape::Shape;
use crate::state::{AppState, Board, BoardMeta, BoardSession, DeltaOperation, Participant, Role};

/// Attempts at registering a participant when its session closes mid-join.
const JOIN_ATTEMPTS: usize = 3;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("board not found: {0}")]
    BoardNotFound(String),
    #[error("participant not found: {0}")]
    ParticipantNotFound(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ErrorCode for BoardError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "E_SESSION_NOT_FOUND",
            Self::BoardNotFound(_) => "E_BOARD_NOT_FOUND",
            Self::ParticipantNotFound(_) => "E_PARTICIPANT_NOT_FOUND",
            Self::State(e) => e.error_code(),
            Self::Repository(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::State(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Return the board's live session, hydrating its state and creating the
/// session on first join.
///
/// # Errors
///
/// `BoardNotFound` when the board exists neither in memory nor in storage;
/// `Repository` when storage fails or holds an invalid shape.
pub async fn join_session(state: &AppState, board_id: &str) -> Result<BoardSession, BoardError> {
    if let Some(session) = state.registry.get_session_by_board_id(board_id).await {
        return Ok(session);
    }

    let board = hydrate_state(state, board_id).await?;
    Ok(state.registry.create_session(board_id, &board.id).await)
}

/// Join a board and register `participant` in its session. Retries when the
/// session is closed between lookup and registration.
///
/// # Errors
///
/// Same as [`join_session`], plus `SessionNotFound` if every attempt raced
/// with a teardown.
pub async fn join_as(state: &AppState, board_id: &str, participant: Participant) -> Result<BoardSession, BoardError> {
    let mut last_session = Uuid::nil();
    for attempt in 1..=JOIN_ATTEMPTS {
        let session = join_session(state, board_id).await?;
        last_session = session.session_id;
        if let Some(joined) = state.registry.add_participant(session.session_id, participant.clone()).await {
            return Ok(joined);
        }
        debug!(%board_id, session_id = %session.session_id, attempt, "session closed during join; retrying");
    }
    Err(BoardError::SessionNotFound(last_session))
}

/// Remove a participant; closes the session when it was the last one.
///
/// # Errors
///
/// `SessionNotFound` for an unknown session, `ParticipantNotFound` when the
/// participant was not present.
pub async fn leave_session(state: &AppState, session_id: Uuid, participant_id: &str) -> Result<(), BoardError> {
    let departure = state
        .registry
        .remove_participant(session_id, participant_id)
        .await
        .ok_or(BoardError::SessionNotFound(session_id))?;

    if !departure.removed {
        return Err(BoardError::ParticipantNotFound(participant_id.to_owned()));
    }

    if departure.remaining == 0 {
        // A join may have landed since; only an empty session is closed.
        if let Some(session) = state.registry.remove_session_if_empty(session_id).await {
            release_state(state, &session).await;
        }
    }
    Ok(())
}

/// Remove the session and release its board.
///
/// # Errors
///
/// `SessionNotFound` if the session does not exist.
pub async fn close_session(state: &AppState, session_id: Uuid) -> Result<(), BoardError> {
    let session = state
        .registry
        .remove_session(session_id)
        .await
        .ok_or(BoardError::SessionNotFound(session_id))?;
    release_state(state, &session).await;
    Ok(())
}

async fn release_state(state: &AppState, session: &BoardSession) {
    state.groups.write().await.remove(&session.session_id);

    if !state.store.retire(&session.state_id).await {
        return;
    }
    if let Err(e) = persistence::flush_board(state, &session.state_id).await {
        error!(error = %e, board_id = %session.state_id, "final flush failed; state retained for retry");
    }
    let evicted = persistence::evict_if_unreferenced(state, &session.state_id).await;
    info!(session_id = %session.session_id, board_id = %session.board_id, evicted, "session closed");
}

/// Role of `user_id` on `board_id`, falling back to `member`.
pub async fn resolve_role(state: &AppState, board_id: &str, user_id: &str) -> Role {
    match state.roles.board_role(board_id, user_id).await {
        Ok(Some(role)) => role,
        Ok(None) => {
            warn!(%board_id, %user_id, "no board membership; defaulting role to member");
            Role::Member
        }
        Err(e) => {
            warn!(error = %e, %board_id, %user_id, "role lookup failed; defaulting role to member");
            Role::Member
        }
    }
}

// =============================================================================
// STATE ACCESS
// =============================================================================

/// # Errors
///
/// `SessionNotFound` for an unknown session.
pub async fn get_session_state_id(state: &AppState, session_id: Uuid) -> Result<String, BoardError> {
    Ok(session(state, session_id).await?.state_id)
}

/// Current board of a session.
///
/// # Errors
///
/// `SessionNotFound` for an unknown session; repository errors if the board
/// has to be rehydrated.
pub async fn get_board_state(state: &AppState, session_id: Uuid) -> Result<Board, BoardError> {
    let session = session(state, session_id).await?;
    match state.store.get_full_state(&session.state_id).await {
        Ok(board) => Ok(board),
        Err(StateError::NotFound(_)) => {
            warn!(%session_id, board_id = %session.board_id, "live session without state; rehydrating");
            hydrate_state(state, &session.board_id).await
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply a batch of deltas to the session's board, then flush it.
///
/// Delta `i` is applied at version `expected_version + 1 + i`. The batch is
/// all-or-nothing.
///
/// # Errors
///
/// `SessionNotFound` for an unknown session; `State` for a version conflict
/// or an invalid delta, with the board unchanged.
pub async fn apply_deltas(
    state: &AppState,
    session_id: Uuid,
    deltas: &[DeltaOperation],
    expected_version: i64,
) -> Result<Board, BoardError> {
    let session = session(state, session_id).await?;

    let board = match state.store.apply_batch(&session.state_id, deltas, expected_version).await {
        Err(StateError::NotFound(_)) => {
            warn!(%session_id, board_id = %session.board_id, "live session without state; rehydrating");
            hydrate_state(state, &session.board_id).await?;
            state.store.apply_batch(&session.state_id, deltas, expected_version).await?
        }
        result => result?,
    };

    info!(%session_id, board_id = %board.id, count = deltas.len(), version = board.base_version, "deltas applied");

    if let Err(e) = persistence::flush_board(state, &session.state_id).await {
        error!(error = %e, board_id = %board.id, version = board.base_version, "flush after apply failed; will retry");
    }
    Ok(board)
}

async fn session(state: &AppState, session_id: Uuid) -> Result<BoardSession, BoardError> {
    state
        .registry
        .get_session(session_id)
        .await
        .ok_or(BoardError::SessionNotFound(session_id))
}

// =============================================================================
// HYDRATION
// =============================================================================

/// Ensure a live board exists for `board_id`. A retained in-memory copy is
/// preferred over storage, since it may hold unflushed edits.
async fn hydrate_state(state: &AppState, board_id: &str) -> Result<Board, BoardError> {
    if let Some(board) = state.store.reclaim(board_id).await {
        return Ok(board);
    }

    let stored = load_stored_board(state, board_id).await?;
    let count = stored.shapes.len();
    let board = state.store.load_state_if_absent(stored.meta(), stored.shapes).await;
    debug!(%board_id, count, version = board.base_version, "board hydrated");
    Ok(board)
}

/// Read the latest stored board and decode its shapes.
async fn load_stored_board(state: &AppState, board_id: &str) -> Result<Board, BoardError> {
    let meta = state
        .repo
        .find_board_by_id_latest(board_id)
        .await?
        .ok_or_else(|| BoardError::BoardNotFound(board_id.to_owned()))?;

    let records = state
        .repo
        .find_shapes_by_board_id_and_version(&meta.id, meta.base_version)
        .await?;
    let shapes = records
        .iter()
        .map(Shape::from_record)
        .collect::<Result<Vec<_>, _>>()
        .map_err(RepositoryError::from)?;

    Ok(Board::new(meta, shapes))
}

/// Board snapshot for read-only callers: the live copy when loaded,
/// otherwise the stored one. Never installs state.
///
/// # Errors
///
/// `BoardNotFound` when the board is absent everywhere.
pub async fn load_board_snapshot(state: &AppState, board_id: &str) -> Result<Board, BoardError> {
    if let Ok(board) = state.store.get_full_state(board_id).await {
        return Ok(board);
    }
    load_stored_board(state, board_id).await
}

/// Mint and persist an empty board with the configured default size.
///
/// # Errors
///
/// `Repository` if the insert fails.
pub async fn create_board(state: &AppState) -> Result<Board, BoardError> {
    let meta = BoardMeta {
        id: format!("board_{}", short_id()),
        width: state.board_defaults.width,
        height: state.board_defaults.height,
        base_version: 0,
    };
    let stored = state.repo.create_board(&meta).await?;
    info!(board_id = %stored.id, "board created");
    Ok(Board::new(stored, Vec::new()))
}

fn short_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Register a connection's outbound channel with a session group.
pub async fn join_group(state: &AppState, session_id: Uuid, client_id: Uuid, tx: mpsc::Sender<Frame>) {
    state
        .groups
        .write()
        .await
        .entry(session_id)
        .or_default()
        .insert(client_id, tx);
}

/// Drop a connection from its session group.
pub async fn leave_group(state: &AppState, session_id: Uuid, client_id: Uuid) {
    let mut groups = state.groups.write().await;
    if let Some(group) = groups.get_mut(&session_id) {
        group.remove(&client_id);
        if group.is_empty() {
            groups.remove(&session_id);
        }
    }
}

/// Send a frame to every connection in a session, optionally excluding one.
/// Best-effort: a full client queue drops the frame for that client.
pub async fn broadcast(state: &AppState, session_id: Uuid, frame: &Frame, exclude: Option<Uuid>) {
    let groups = state.groups.read().await;
    let Some(group) = groups.get(&session_id) else {
        return;
    };

    for (client_id, tx) in group {
        if exclude == Some(*client_id) {
            continue;
        }
        if tx.try_send(frame.clone()).is_err() {
            warn!(%session_id, %client_id, syscall = %frame.syscall, "client queue full or closed; frame dropped");
        }
    }
}

#[cfg(test)]
#[path = "board_test.rs"]
mod tests;
