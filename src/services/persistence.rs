//! Persistence service — board repository and background state flush.
//!
//! DESIGN
//! ======
//! `BoardRepository` is the storage seam; `PgBoardRepository` implements it
//! over Postgres. Live boards are flushed as whole snapshots: the board row
//! and its shapes are rewritten in one transaction, guarded so that a stale
//! snapshot never overwrites a newer stored `base_version`.
//!
//! A background task flushes every dirty board on a fixed interval and
//! evicts retired boards once they are clean.
//!
//! ERROR HANDLING
//! ==============
//! The persisted watermark advances only after a successful write. A failed
//! flush leaves the in-memory board untouched and dirty, so the next cycle
//! retries it. Storage errors never roll back live state.

use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::shape::{ShapeRecord, ValidationError};
use crate::state::{AppState, Board, BoardMeta};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored shape: {0}")]
    InvalidShape(#[from] ValidationError),
}

impl crate::frame::ErrorCode for RepositoryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::InvalidShape(_) => "E_VALIDATION",
        }
    }
}

/// Durable storage for boards and their shapes.
#[async_trait::async_trait]
pub trait BoardRepository: Send + Sync {
    /// Insert a new board row.
    async fn create_board(&self, board: &BoardMeta) -> Result<BoardMeta, RepositoryError>;

    /// Latest stored version of a board, if any.
    async fn find_board_by_id_latest(&self, id: &str) -> Result<Option<BoardMeta>, RepositoryError>;

    /// Shape rows of a board as of `version`, in board order.
    async fn find_shapes_by_board_id_and_version(
        &self,
        board_id: &str,
        version: i64,
    ) -> Result<Vec<ShapeRecord>, RepositoryError>;

    /// Append one shape row to a board. Returns the shape id.
    async fn add_shape_to_board(&self, shape: &ShapeRecord, board_id: &str) -> Result<String, RepositoryError>;

    /// Replace the stored board with `board`. Returns `false` without writing
    /// when the stored copy is already at or beyond `board.base_version`.
    async fn save_board_state(&self, board: &Board) -> Result<bool, RepositoryError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgBoardRepository {
    pool: PgPool,
}

impl PgBoardRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type ShapeRow = (String, String, String, String, f64, bool, serde_json::Value);

fn shape_from_row((id, shape_type, fill_color, stroke_color, stroke_width, draggable, shape_data): ShapeRow) -> ShapeRecord {
    ShapeRecord { id, shape_type, fill_color, stroke_color, stroke_width, draggable, shape_data }
}

#[async_trait::async_trait]
impl BoardRepository for PgBoardRepository {
    async fn create_board(&self, board: &BoardMeta) -> Result<BoardMeta, RepositoryError> {
        let (id, width, height, base_version) = sqlx::query_as::<_, (String, f64, f64, i64)>(
            "INSERT INTO boards (id, width, height, base_version) VALUES ($1, $2, $3, $4)
             RETURNING id, width, height, base_version",
        )
        .bind(&board.id)
        .bind(board.width)
        .bind(board.height)
        .bind(board.base_version)
        .fetch_one(&self.pool)
        .await?;

        Ok(BoardMeta { id, width, height, base_version })
    }

    async fn find_board_by_id_latest(&self, id: &str) -> Result<Option<BoardMeta>, RepositoryError> {
        let row = sqlx::query_as::<_, (String, f64, f64, i64)>(
            "SELECT id, width, height, base_version FROM boards
             WHERE id = $1
             ORDER BY base_version DESC
             LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, width, height, base_version)| BoardMeta { id, width, height, base_version }))
    }

    async fn find_shapes_by_board_id_and_version(
        &self,
        board_id: &str,
        version: i64,
    ) -> Result<Vec<ShapeRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, ShapeRow>(
            "SELECT id, type::text, fill_color, stroke_color, stroke_width, draggable, shape_data
             FROM shapes
             WHERE board_id = $1 AND updated_version <= $2
             ORDER BY position ASC, id ASC",
        )
        .bind(board_id)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(shape_from_row).collect())
    }

    async fn add_shape_to_board(&self, shape: &ShapeRecord, board_id: &str) -> Result<String, RepositoryError> {
        let id: String = sqlx::query_scalar(
            "INSERT INTO shapes
                 (id, board_id, type, fill_color, stroke_color, stroke_width, draggable, shape_data,
                  updated_version, position)
             VALUES ($1, $2, $3::shape_type, $4, $5, $6, $7, $8,
                     COALESCE((SELECT base_version FROM boards WHERE id = $2), 0),
                     COALESCE((SELECT MAX(position) + 1 FROM shapes WHERE board_id = $2), 0))
             RETURNING id",
        )
        .bind(&shape.id)
        .bind(board_id)
        .bind(&shape.shape_type)
        .bind(&shape.fill_color)
        .bind(&shape.stroke_color)
        .bind(shape.stroke_width)
        .bind(shape.draggable)
        .bind(&shape.shape_data)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn save_board_state(&self, board: &Board) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO boards (id, width, height, base_version) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                 width = EXCLUDED.width,
                 height = EXCLUDED.height,
                 base_version = EXCLUDED.base_version
             WHERE boards.base_version < EXCLUDED.base_version",
        )
        .bind(&board.id)
        .bind(board.width)
        .bind(board.height)
        .bind(board.base_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let ids: Vec<String> = board.shapes.iter().map(|s| s.id.clone()).collect();
        sqlx::query("DELETE FROM shapes WHERE board_id = $1 AND NOT (id = ANY($2))")
            .bind(&board.id)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        for (position, shape) in board.shapes.iter().enumerate() {
            let record = shape.to_record();
            sqlx::query(
                "INSERT INTO shapes
                     (id, board_id, type, fill_color, stroke_color, stroke_width, draggable, shape_data,
                      updated_version, position)
                 VALUES ($1, $2, $3::shape_type, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (board_id, id) DO UPDATE SET
                     type = EXCLUDED.type,
                     fill_color = EXCLUDED.fill_color,
                     stroke_color = EXCLUDED.stroke_color,
                     stroke_width = EXCLUDED.stroke_width,
                     draggable = EXCLUDED.draggable,
                     shape_data = EXCLUDED.shape_data,
                     updated_version = EXCLUDED.updated_version,
                     position = EXCLUDED.position",
            )
            .bind(&record.id)
            .bind(&board.id)
            .bind(&record.shape_type)
            .bind(&record.fill_color)
            .bind(&record.stroke_color)
            .bind(record.stroke_width)
            .bind(record.draggable)
            .bind(&record.shape_data)
            .bind(board.base_version)
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

// =============================================================================
// FLUSH
// =============================================================================

/// Spawn the background flush task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState, interval: Duration) -> JoinHandle<()> {
    info!(flush_interval_ms = interval.as_millis(), "state persistence flush configured");
    tokio::spawn(async move {
        loop {
            flush_all_dirty(&state).await;
            tokio::time::sleep(interval).await;
        }
    })
}

/// Persist one board if it has unpersisted versions.
///
/// # Errors
///
/// Returns the repository error; the board stays dirty for the next cycle.
pub async fn flush_board(state: &AppState, state_id: &str) -> Result<(), RepositoryError> {
    let Some(snapshot) = state.store.dirty_board(state_id).await else {
        return Ok(());
    };
    persist_snapshot(state, &snapshot).await
}

/// Flush every dirty board, then evict retired boards that are now clean.
pub async fn flush_all_dirty(state: &AppState) {
    // PHASE: SNAPSHOT + WRITE
    // Snapshots are cloned under each board's lock; I/O runs lock-free.
    for snapshot in state.store.dirty_boards().await {
        if let Err(e) = persist_snapshot(state, &snapshot).await {
            error!(error = %e, board_id = %snapshot.id, version = snapshot.base_version, "persistence flush failed");
        }
    }

    // PHASE: EVICT RETIRED
    for state_id in state.store.retired_ids().await {
        evict_if_unreferenced(state, &state_id).await;
    }
}

/// Evict a retired, clean board unless a session has claimed it again, in
/// which case its retirement is cancelled. Returns `true` if evicted.
pub async fn evict_if_unreferenced(state: &AppState, state_id: &str) -> bool {
    if state.registry.get_session_by_board_id(state_id).await.is_some() {
        state.store.reclaim(state_id).await;
        return false;
    }
    state.store.evict_if_clean(state_id).await
}

async fn persist_snapshot(state: &AppState, snapshot: &Board) -> Result<(), RepositoryError> {
    let written = state.repo.save_board_state(snapshot).await?;
    if written {
        debug!(board_id = %snapshot.id, version = snapshot.base_version, shapes = snapshot.shapes.len(), "board flushed");
    } else {
        warn!(board_id = %snapshot.id, version = snapshot.base_version, "stored board is not older; snapshot skipped");
    }
    // EDGE: the watermark only covers this snapshot's version; deltas that
    // landed during the write keep the board dirty.
    state.store.mark_persisted(&snapshot.id, snapshot.base_version).await;
    Ok(())
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
