//! WebSocket handler — the realtime board gateway.
//!
//! DESIGN
//! ======
//! The socket is upgraded first and authenticated second, so a failed
//! handshake can still be reported as an `error` frame before the close.
//! After the handshake the connection enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall
//! - Broadcast frames from session peers → forward to client
//! - Ping ticks → keep the socket alive through proxies
//! - Idle deadline → disconnect silent clients
//!
//! Handler functions return an `Outcome`; the dispatch layer decides who
//! receives what. Errors are always sender-only.
//!
//! ORDERING
//! ========
//! A batch commits under the board lock but is flushed before its snapshot
//! is broadcast, so snapshots can reach a peer queue out of commit order.
//! Each connection keeps a `BoardWatermark` and drops queued `board_state`
//! frames older than the newest version it has already sent.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → verify `token`, resolve `bid` → join session
//! 2. Send `session_joined`, notify peers with `participant_joined`
//! 3. Client frames → dispatch → reply / broadcast
//! 4. Close or idle → notify peers with `participant_left` → leave session

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{
    APPLY_DELTAS, BOARD_STATE, Data, ErrorCode, Frame, GET_BOARD_STATE, PARTICIPANT_JOINED, PARTICIPANT_LEFT,
    SESSION_JOINED, Status,
};
use crate::services::auth::{AuthError, Identity};
use crate::services::board::{self, BoardError};
use crate::state::{AppState, DeltaOperation, Participant};

/// Handshake header (and query fallback) carrying the bearer token.
pub const TOKEN_PARAM: &str = "token";

/// Handshake header (and query fallback) carrying the board id.
pub const BOARD_PARAM: &str = "bid";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing token")]
    MissingToken,
    #[error("missing board id")]
    MissingBoardId,
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error(transparent)]
    Join(#[from] BoardError),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ErrorCode for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingToken => "E_MISSING_TOKEN",
            Self::MissingBoardId => "E_MISSING_BOARD_ID",
            Self::Unauthorized(e) => e.error_code(),
            Self::Join(e) => e.error_code(),
            Self::InvalidPayload(_) => "E_VALIDATION",
        }
    }
}

/// Newest board `baseVersion` delivered on one connection.
#[derive(Debug, Default)]
pub(crate) struct BoardWatermark(Option<i64>);

impl BoardWatermark {
    /// Record an outbound frame. Returns `false` for a `board_state` older
    /// than one already delivered; other frames always pass.
    pub(crate) fn admit(&mut self, frame: &Frame) -> bool {
        if frame.syscall != BOARD_STATE {
            return true;
        }
        let Some(version) = frame.data.get("baseVersion").and_then(serde_json::Value::as_i64) else {
            return true;
        };
        match self.0 {
            Some(seen) if version < seen => false,
            _ => {
                self.0 = Some(version);
                true
            }
        }
    }
}

/// An authenticated connection attached to a session.
#[derive(Debug, Clone)]
pub(crate) struct Connection {
    pub client_id: Uuid,
    pub session_id: Uuid,
    pub board_id: String,
    pub identity: Identity,
    pub participant: Participant,
}

/// What a handler produced. Dispatch turns it into frames for the sender
/// and, for edits, for the rest of the session.
enum Outcome {
    /// Send `board_state` to the sender only.
    Reply(Data),
    /// Send `board_state` to the sender (correlated) and to every peer
    /// (uncorrelated).
    Broadcast(Data),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyDeltasPayload {
    deltas: Vec<DeltaOperation>,
    expected_version: i64,
}

// =============================================================================
// UPGRADE
// =============================================================================

/// `GET /ws/board` — upgrade, then authenticate over the socket.
pub async fn handle_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = credential(&headers, &params, TOKEN_PARAM).map(|t| strip_bearer(&t).to_owned());
    let board_id = credential(&headers, &params, BOARD_PARAM);
    ws.on_upgrade(move |socket| run_ws(socket, state, token, board_id))
}

/// Header value, falling back to the query parameter of the same name.
fn credential(headers: &HeaderMap, params: &HashMap<String, String>, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .or_else(|| params.get(key).map(String::as_str))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").map_or(token, str::trim)
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, token: Option<String>, board_id: Option<String>) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.realtime.client_queue);

    let (conn, welcome) =
        match open_connection(&state, client_id, token.as_deref(), board_id.as_deref(), &client_tx).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(%client_id, error = %e, code = e.error_code(), "ws: handshake rejected");
                let _ = send_frame(&mut socket, &Frame::failure(&e)).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

    info!(%client_id, session_id = %conn.session_id, board_id = %conn.board_id, user_id = %conn.identity.id, "ws: client connected");

    if send_frame(&mut socket, &welcome).await.is_ok() {
        serve(&mut socket, &state, &conn, &mut client_rx).await;
    }

    close_connection(&state, &conn).await;
    let _ = socket.send(Message::Close(None)).await;
    info!(%client_id, "ws: client disconnected");
}

/// Relay frames until the client closes, the socket fails, or the idle
/// deadline passes. Any inbound message resets the deadline.
async fn serve(socket: &mut WebSocket, state: &AppState, conn: &Connection, client_rx: &mut mpsc::Receiver<Frame>) {
    let idle_timeout = state.realtime.idle_timeout;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let ping_every = state.realtime.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut watermark = BoardWatermark::default();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match msg {
                    Message::Text(text) => {
                        // Replies are always delivered; they only advance the watermark.
                        for frame in process_inbound_text(state, conn, text.as_str()).await {
                            watermark.admit(&frame);
                            let _ = send_frame(socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if !watermark.admit(&frame) {
                    debug!(client_id = %conn.client_id, id = %frame.id, "ws: stale board_state dropped");
                    continue;
                }
                if send_frame(socket, &frame).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            () = &mut idle => {
                info!(client_id = %conn.client_id, timeout_secs = idle_timeout.as_secs(), "ws: idle timeout");
                break;
            }
        }
    }
}

/// Authenticate, join the session, and register for broadcasts. Returns the
/// connection and the `session_joined` frame for the client.
///
/// # Errors
///
/// Missing credentials, a rejected token, or a failed join. Nothing is
/// registered on any error path.
pub(crate) async fn open_connection(
    state: &AppState,
    client_id: Uuid,
    token: Option<&str>,
    board_id: Option<&str>,
    client_tx: &mpsc::Sender<Frame>,
) -> Result<(Connection, Frame), GatewayError> {
    let token = token.ok_or(GatewayError::MissingToken)?;
    let board_id = board_id.ok_or(GatewayError::MissingBoardId)?;

    let identity = state.auth.verify_session(token).await?;
    let role = board::resolve_role(state, board_id, &identity.id).await;
    let participant = Participant {
        id: client_id.to_string(),
        user_id: identity.id.clone(),
        name: identity.name.clone(),
        role,
        joined_at: 0,
    };

    let session = board::join_as(state, board_id, participant).await?;
    board::join_group(state, session.session_id, client_id, client_tx.clone()).await;

    // The registry stamps `joined_at`; report the stored record.
    let participant_id = client_id.to_string();
    let joined = session
        .participants
        .iter()
        .find(|p| p.id == participant_id)
        .cloned()
        .ok_or_else(|| BoardError::ParticipantNotFound(participant_id.clone()))?;

    let conn = Connection {
        client_id,
        session_id: session.session_id,
        board_id: board_id.to_owned(),
        identity,
        participant: joined,
    };

    let notice = Frame::request(PARTICIPANT_JOINED, Data::new())
        .with_board_id(&conn.board_id)
        .with_from(&conn.identity.id)
        .with_data("participant", serde_json::to_value(&conn.participant).unwrap_or_default());
    board::broadcast(state, conn.session_id, &notice, Some(client_id)).await;

    let welcome = Frame::request(SESSION_JOINED, Data::new())
        .with_board_id(&conn.board_id)
        .with_data("sessionId", conn.session_id.to_string())
        .with_data("participantId", participant_id)
        .with_data("participants", serde_json::to_value(&session.participants).unwrap_or_default());

    Ok((conn, welcome))
}

/// Detach from the broadcast group, notify peers, and leave the session.
pub(crate) async fn close_connection(state: &AppState, conn: &Connection) {
    board::leave_group(state, conn.session_id, conn.client_id).await;

    // Notify peers BEFORE leaving (leave may close the session).
    let notice = Frame::request(PARTICIPANT_LEFT, Data::new())
        .with_board_id(&conn.board_id)
        .with_from(&conn.identity.id)
        .with_data("participantId", conn.participant.id.clone())
        .with_data("userId", conn.identity.id.clone());
    board::broadcast(state, conn.session_id, &notice, Some(conn.client_id)).await;

    if let Err(e) = board::leave_session(state, conn.session_id, &conn.participant.id).await {
        warn!(client_id = %conn.client_id, session_id = %conn.session_id, error = %e, "ws: leave failed");
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Transport concerns stay in `serve`, so tests can drive dispatch and
/// broadcast without a socket.
pub(crate) async fn process_inbound_text(state: &AppState, conn: &Connection, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %conn.client_id, error = %e, "ws: invalid inbound frame");
            let err = GatewayError::InvalidPayload(format!("invalid json: {e}"));
            return vec![Frame::failure(&err).with_board_id(&conn.board_id)];
        }
    };

    // Stamp the authenticated identity and the connection's board.
    req.from = Some(conn.identity.id.clone());
    req.board_id = Some(conn.board_id.clone());

    info!(client_id = %conn.client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.syscall.as_str() {
        GET_BOARD_STATE => handle_get_board_state(state, conn, &req).await,
        APPLY_DELTAS => handle_apply_deltas(state, conn, &req).await,
        other => Err(req.error(format!("unknown syscall: {other}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.item(BOARD_STATE, data)],
        Ok(Outcome::Broadcast(data)) => {
            let sender_frame = req.item(BOARD_STATE, data);
            // Peers get a copy without parent_id (they didn't originate the request).
            let peer_frame = sender_frame.detached();
            board::broadcast(state, conn.session_id, &peer_frame, Some(conn.client_id)).await;
            vec![sender_frame]
        }
        Err(err_frame) => vec![err_frame],
    }
}

async fn handle_get_board_state(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match board::get_board_state(state, conn.session_id).await {
        Ok(board) => Ok(Outcome::Reply(board.to_data())),
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_apply_deltas(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    let payload: ApplyDeltasPayload = serde_json::from_value(serde_json::Value::Object(
        req.data.clone().into_iter().collect(),
    ))
    .map_err(|e| req.error_from(&GatewayError::InvalidPayload(e.to_string())))?;

    debug!(client_id = %conn.client_id, count = payload.deltas.len(), expected_version = payload.expected_version, "ws: apply_deltas");

    match board::apply_deltas(state, conn.session_id, &payload.deltas, payload.expected_version).await {
        Ok(board) => Ok(Outcome::Broadcast(board.to_data())),
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.code().unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
