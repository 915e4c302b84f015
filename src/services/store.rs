//! State store — authoritative in-memory boards and delta application.
//!
//! DESIGN
//! ======
//! The outer `RwLock` guards only which boards are loaded. Each board sits
//! behind its own `Mutex`, which is the single serialization point for every
//! mutation of that board; boards never contend with each other.
//!
//! Deltas follow a strict-successor protocol: a delta carrying `version` is
//! accepted only when `version == base_version + 1`. Every check runs before
//! the first mutation, so a rejected delta leaves the board untouched.
//!
//! LIFECYCLE
//! =========
//! A board is dirty while `base_version > persisted_version`. Closing a
//! session *retires* its board rather than dropping it: the board is evicted
//! once it is both retired and clean, so a failed final flush never loses
//! edits. A re-join before eviction reclaims the retained copy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::shape::{Shape, ValidationError};
use crate::state::{Board, BoardMeta, DeltaKind, DeltaOperation};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state not found: {0}")]
    NotFound(String),
    #[error("version conflict: expected version {expected}, got {actual}; refetch state and retry")]
    VersionConflict { expected: i64, actual: i64 },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl crate::frame::ErrorCode for StateError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_STATE_NOT_FOUND",
            Self::VersionConflict { .. } => "E_VERSION_CONFLICT",
            Self::Validation(_) => "E_VALIDATION",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

struct LiveBoard {
    board: Board,
    /// Highest version known to be durable.
    persisted_version: i64,
    /// No session references this board; evict once clean.
    retired: bool,
    /// Removed from the map. Late holders of the `Arc` must not mutate it.
    evicted: bool,
}

impl LiveBoard {
    fn new(board: Board) -> Self {
        let persisted_version = board.base_version;
        Self { board, persisted_version, retired: false, evicted: false }
    }

    fn is_dirty(&self) -> bool {
        self.board.base_version > self.persisted_version
    }
}

/// Owner of every authoritative in-memory board, keyed by state id.
/// The state id of a board is its board id.
#[derive(Default)]
pub struct StateStore {
    boards: RwLock<HashMap<String, Arc<Mutex<LiveBoard>>>>,
}

// =============================================================================
// LOAD / READ / DELETE
// =============================================================================

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly hydrated board, replacing any live copy for the id.
    pub async fn load_state(&self, meta: BoardMeta, shapes: Vec<Shape>) -> Board {
        let board = Board::new(meta, shapes);
        let snapshot = board.clone();
        let previous = self
            .boards
            .write()
            .await
            .insert(board.id.clone(), Arc::new(Mutex::new(LiveBoard::new(board))));
        if let Some(previous) = previous {
            previous.lock().await.evicted = true;
        }
        info!(board_id = %snapshot.id, count = snapshot.shapes.len(), version = snapshot.base_version, "state loaded");
        snapshot
    }

    /// Install a hydrated board unless a live copy already exists, in which
    /// case the live copy wins and is returned.
    pub async fn load_state_if_absent(&self, meta: BoardMeta, shapes: Vec<Shape>) -> Board {
        let mut boards = self.boards.write().await;
        if let Some(existing) = boards.get(&meta.id).cloned() {
            drop(boards);
            let mut live = existing.lock().await;
            live.retired = false;
            debug!(board_id = %meta.id, "hydration skipped; live state already present");
            return live.board.clone();
        }

        let board = Board::new(meta, shapes);
        let snapshot = board.clone();
        boards.insert(board.id.clone(), Arc::new(Mutex::new(LiveBoard::new(board))));
        info!(board_id = %snapshot.id, count = snapshot.shapes.len(), version = snapshot.base_version, "state loaded");
        snapshot
    }

    /// Take back a loaded board for a new session, cancelling a pending
    /// retirement. `None` when nothing is loaded.
    pub async fn reclaim(&self, state_id: &str) -> Option<Board> {
        let entry = self.entry(state_id).await?;
        let mut live = entry.lock().await;
        if live.evicted {
            return None;
        }
        if live.retired {
            info!(board_id = %state_id, "reclaimed retired state");
        }
        live.retired = false;
        Some(live.board.clone())
    }

    /// Defensive copy of the current state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no state is loaded for `state_id`.
    pub async fn get_full_state(&self, state_id: &str) -> Result<Board, StateError> {
        let entry = self.live(state_id).await?;
        let live = entry.lock().await;
        if live.evicted {
            return Err(StateError::NotFound(state_id.to_owned()));
        }
        Ok(live.board.clone())
    }

    pub async fn contains(&self, state_id: &str) -> bool {
        self.boards.read().await.contains_key(state_id)
    }

    pub async fn len(&self) -> usize {
        self.boards.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.boards.read().await.is_empty()
    }

    /// Drop the in-memory board. Idempotent.
    pub async fn delete_state(&self, state_id: &str) {
        let removed = self.boards.write().await.remove(state_id);
        if let Some(entry) = removed {
            entry.lock().await.evicted = true;
            info!(board_id = %state_id, "state deleted");
        }
    }

    async fn entry(&self, state_id: &str) -> Option<Arc<Mutex<LiveBoard>>> {
        self.boards.read().await.get(state_id).cloned()
    }

    async fn live(&self, state_id: &str) -> Result<Arc<Mutex<LiveBoard>>, StateError> {
        self.entry(state_id)
            .await
            .ok_or_else(|| StateError::NotFound(state_id.to_owned()))
    }
}

// =============================================================================
// DELTAS
// =============================================================================

impl StateStore {
    /// Apply one delta under the strict-successor rule.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no state is loaded for `state_id`.
    /// - `VersionConflict` if `delta.version != base_version + 1`.
    /// - `Validation` if an ADD collides with an existing shape id.
    ///
    /// The board is unchanged on every error path.
    pub async fn apply_delta(&self, state_id: &str, delta: &DeltaOperation) -> Result<Board, StateError> {
        let entry = self.live(state_id).await?;
        let mut live = entry.lock().await;
        if live.evicted {
            return Err(StateError::NotFound(state_id.to_owned()));
        }

        apply_one(&mut live.board, delta.kind, &delta.shape, delta.version)?;
        debug!(board_id = %state_id, kind = ?delta.kind, shape_id = %delta.shape.id, version = delta.version, "delta applied");
        Ok(live.board.clone())
    }

    /// Apply a batch atomically. Delta `i` is applied at version
    /// `expected_version + 1 + i`; any `version` carried by the deltas
    /// themselves is ignored. Nothing is committed unless every delta applies.
    ///
    /// # Errors
    ///
    /// Same as [`StateStore::apply_delta`]; a conflict is reported against
    /// the first delta of the batch.
    pub async fn apply_batch(
        &self,
        state_id: &str,
        deltas: &[DeltaOperation],
        expected_version: i64,
    ) -> Result<Board, StateError> {
        let entry = self.live(state_id).await?;
        let mut live = entry.lock().await;
        if live.evicted {
            return Err(StateError::NotFound(state_id.to_owned()));
        }
        if live.board.base_version != expected_version {
            return Err(StateError::VersionConflict {
                expected: live.board.base_version + 1,
                actual: expected_version + 1,
            });
        }

        let mut working = live.board.clone();
        let mut version = expected_version;
        for delta in deltas {
            version += 1;
            apply_one(&mut working, delta.kind, &delta.shape, version)?;
        }

        live.board = working;
        debug!(board_id = %state_id, count = deltas.len(), version = live.board.base_version, "delta batch applied");
        Ok(live.board.clone())
    }
}

/// Apply a single delta to `board`. All checks precede the first write.
fn apply_one(board: &mut Board, kind: DeltaKind, shape: &Shape, version: i64) -> Result<(), StateError> {
    let expected = board.base_version + 1;
    if version != expected {
        return Err(StateError::VersionConflict { expected, actual: version });
    }

    match kind {
        DeltaKind::Add => {
            if board.shape(&shape.id).is_some() {
                return Err(ValidationError::DuplicateShape(shape.id.clone()).into());
            }
            board.shapes.push(shape.clone());
        }
        DeltaKind::Update => {
            if let Some(slot) = board.shapes.iter_mut().find(|s| s.id == shape.id) {
                *slot = shape.clone();
            }
        }
        DeltaKind::Delete => {
            board.shapes.retain(|s| s.id != shape.id);
        }
    }

    board.base_version = version;
    Ok(())
}

// =============================================================================
// PERSISTENCE BOOKKEEPING
// =============================================================================

impl StateStore {
    /// Snapshots of every board with unpersisted versions.
    pub async fn dirty_boards(&self) -> Vec<Board> {
        let entries: Vec<_> = self.boards.read().await.values().cloned().collect();
        let mut dirty = Vec::new();
        for entry in entries {
            let live = entry.lock().await;
            if live.is_dirty() && !live.evicted {
                dirty.push(live.board.clone());
            }
        }
        dirty
    }

    /// Snapshot of one board if it has unpersisted versions.
    pub async fn dirty_board(&self, state_id: &str) -> Option<Board> {
        let entry = self.entry(state_id).await?;
        let live = entry.lock().await;
        (live.is_dirty() && !live.evicted).then(|| live.board.clone())
    }

    /// Record that `version` is durable. Never moves the watermark backwards.
    pub async fn mark_persisted(&self, state_id: &str, version: i64) {
        let Some(entry) = self.entry(state_id).await else {
            return;
        };
        let mut live = entry.lock().await;
        live.persisted_version = live.persisted_version.max(version);
    }

    pub async fn is_dirty(&self, state_id: &str) -> bool {
        let Some(entry) = self.entry(state_id).await else {
            return false;
        };
        entry.lock().await.is_dirty()
    }

    /// Mark a board as unreferenced. Returns `false` if nothing is loaded.
    pub async fn retire(&self, state_id: &str) -> bool {
        let Some(entry) = self.entry(state_id).await else {
            return false;
        };
        entry.lock().await.retired = true;
        true
    }

    /// Ids of retired boards still held in memory.
    pub async fn retired_ids(&self) -> Vec<String> {
        let entries: Vec<_> = self
            .boards
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        let mut ids = Vec::new();
        for (id, entry) in entries {
            if entry.lock().await.retired {
                ids.push(id);
            }
        }
        ids
    }

    /// Evict a board that is retired and fully persisted.
    /// Returns `true` if the board was removed.
    pub async fn evict_if_clean(&self, state_id: &str) -> bool {
        let mut boards = self.boards.write().await;
        let Some(entry) = boards.get(state_id).cloned() else {
            return false;
        };
        let mut live = entry.lock().await;
        if !live.retired || live.is_dirty() {
            return false;
        }
        live.evicted = true;
        boards.remove(state_id);
        info!(board_id = %state_id, "evicted state from memory");
        true
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
