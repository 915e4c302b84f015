//! Board REST routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::error;

use crate::services::board::{self, BoardError};
use crate::services::store::StateError;
use crate::state::{AppState, Board};

#[derive(Debug, Serialize)]
pub struct BoardResponse {
    pub data: Board,
    pub message: &'static str,
}

/// `GET /board/{id}` — current board state, live copy first.
pub async fn get_board(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
) -> Result<Json<BoardResponse>, StatusCode> {
    let board = board::load_board_snapshot(&state, &board_id)
        .await
        .map_err(board_error_to_status)?;

    Ok(Json(BoardResponse { data: board, message: "Board and state retrieved successfully" }))
}

/// `POST /board` — create an empty board with default dimensions.
pub async fn create_board(State(state): State<AppState>) -> Result<(StatusCode, Json<BoardResponse>), StatusCode> {
    let board = board::create_board(&state)
        .await
        .map_err(board_error_to_status)?;

    Ok((StatusCode::CREATED, Json(BoardResponse { data: board, message: "Board created successfully" })))
}

pub(crate) fn board_error_to_status(err: BoardError) -> StatusCode {
    match err {
        BoardError::SessionNotFound(_)
        | BoardError::BoardNotFound(_)
        | BoardError::ParticipantNotFound(_)
        | BoardError::State(StateError::NotFound(_)) => StatusCode::NOT_FOUND,
        BoardError::State(StateError::VersionConflict { .. }) => StatusCode::CONFLICT,
        BoardError::State(StateError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        BoardError::Repository(e) => {
            error!(error = %e, "board repository failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "boards_test.rs"]
mod tests;
