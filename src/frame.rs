//! Frame — the envelope for every realtime message.
//!
//! ARCHITECTURE
//! ============
//! Clients and the gateway exchange JSON frames over the board socket. The
//! `syscall` names the event (`get_board_state`, `apply_deltas`,
//! `board_state`, `error`, ...). Replies correlate to the request that caused
//! them through `parent_id`; broadcasts to peers carry no parent.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`.
//! - Inbound frames may omit everything but `syscall`; ids and timestamps are
//!   filled in on decode.
//! - Errors always go out as an `error` frame carrying `code`, `message`
//!   and `retryable`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// EVENT NAMES
// =============================================================================

/// Client asks for the full board snapshot.
pub const GET_BOARD_STATE: &str = "get_board_state";

/// Client submits a batch of deltas against an expected version.
pub const APPLY_DELTAS: &str = "apply_deltas";

/// Server pushes a full board snapshot.
pub const BOARD_STATE: &str = "board_state";

/// Server reports a failure.
pub const ERROR: &str = "error";

/// Sent once after a successful handshake.
pub const SESSION_JOINED: &str = "session_joined";

/// Peer notifications.
pub const PARTICIPANT_JOINED: &str = "participant_joined";
pub const PARTICIPANT_LEFT: &str = "participant_left";

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for the retryable flag on error frames.
pub const FRAME_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Lifecycle position of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Request,
    Item,
    Done,
    Error,
}

impl Status {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }
}

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default = "now_ms")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub syscall: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create an uncorrelated frame. Used for requests and server pushes.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            board_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create an uncorrelated error frame, used before any request exists
    /// (handshake failures).
    #[must_use]
    pub fn failure(err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut frame = Self::request(ERROR, error_data(err));
        frame.status = Status::Error;
        frame
    }

    /// Reply to this frame with a named event carrying one result.
    #[must_use]
    pub fn item(&self, syscall: &str, data: Data) -> Self {
        self.reply(syscall, Status::Item, data)
    }

    /// Create a plain-text error reply. Terminal.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.reply(ERROR, Status::Error, data)
    }

    /// Create a structured error reply from a typed error. Terminal.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        self.reply(ERROR, Status::Error, error_data(err))
    }

    /// Build a reply frame. Inherits `board_id`; `parent_id` points here.
    fn reply(&self, syscall: &str, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            board_id: self.board_id.clone(),
            from: None,
            syscall: syscall.to_owned(),
            status,
            data,
        }
    }
}

fn error_data(err: &(impl ErrorCode + ?Sized)) -> Data {
    let mut data = Data::new();
    data.insert(FRAME_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
    data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(err.to_string()));
    data.insert(FRAME_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
    data
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_board_id(mut self, board_id: impl Into<String>) -> Self {
        self.board_id = Some(board_id.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Copy of this frame for peers: fresh id, no correlation.
    #[must_use]
    pub fn detached(&self) -> Self {
        let mut frame = self.clone();
        frame.id = Uuid::new_v4();
        frame.parent_id = None;
        frame
    }

    /// Error code carried by an error frame, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.data.get(FRAME_CODE).and_then(|v| v.as_str())
    }
}

// =============================================================================
// TESTS
// =============================================================================
