//! Shared application state and the board aggregate.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! wires together the two live stores and the external collaborators:
//!
//! - `StateStore` owns every authoritative in-memory `Board`.
//! - `SessionRegistry` owns every `BoardSession` (who is watching what).
//! - `groups` maps a session to the outbound channels of its connections.
//!
//! Stores reference each other only by id (`state_id` / `board_id`); nothing
//! outside a store touches its maps directly.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::{BoardDefaults, RealtimeConfig};
use crate::frame::{Data, Frame};
use crate::services::auth::{RoleLookup, SessionVerifier};
use crate::services::persistence::BoardRepository;
use crate::services::registry::SessionRegistry;
use crate::services::store::StateStore;
use crate::shape::{Shape, ValidationError};

// =============================================================================
// BOARD
// =============================================================================

/// Board metadata without shapes. Mirrors the `boards` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardMeta {
    pub id: String,
    pub width: f64,
    pub height: f64,
    pub base_version: i64,
}

/// Authoritative, versioned board. Serializes as `BoardStateDto`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: String,
    pub width: f64,
    pub height: f64,
    pub base_version: i64,
    pub shapes: Vec<Shape>,
}

impl Board {
    #[must_use]
    pub fn new(meta: BoardMeta, shapes: Vec<Shape>) -> Self {
        Self { id: meta.id, width: meta.width, height: meta.height, base_version: meta.base_version, shapes }
    }

    #[must_use]
    pub fn meta(&self) -> BoardMeta {
        BoardMeta { id: self.id.clone(), width: self.width, height: self.height, base_version: self.base_version }
    }

    #[must_use]
    pub fn shape(&self, id: &str) -> Option<&Shape> {
        self.shapes.iter().find(|s| s.id == id)
    }

    /// Flatten into frame data (`id`, `width`, `height`, `baseVersion`, `shapes`).
    ///
    /// Built field by field from infallible conversions, so a board always
    /// yields every key.
    #[must_use]
    pub fn to_data(&self) -> Data {
        let shapes = self.shapes.iter().map(Shape::to_value).collect();
        Data::from([
            ("id".to_owned(), Value::String(self.id.clone())),
            ("width".to_owned(), Value::from(self.width)),
            ("height".to_owned(), Value::from(self.height)),
            ("baseVersion".to_owned(), Value::from(self.base_version)),
            ("shapes".to_owned(), Value::Array(shapes)),
        ])
    }
}

// =============================================================================
// DELTAS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeltaKind {
    Add,
    Update,
    Delete,
}

impl FromStr for DeltaKind {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "ADD" => Ok(Self::Add),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(ValidationError::UnknownDeltaType(other.to_owned())),
        }
    }
}

/// One add/update/delete. `version` is the board version after this delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDelta")]
pub struct DeltaOperation {
    #[serde(rename = "type")]
    pub kind: DeltaKind,
    pub shape: Shape,
    pub version: i64,
}

impl DeltaOperation {
    #[must_use]
    pub fn new(kind: DeltaKind, shape: Shape, version: i64) -> Self {
        Self { kind, shape, version }
    }
}

/// Wire form before the delta type is checked. `version` may be omitted
/// inside a batch, where it is assigned from `expectedVersion`.
#[derive(Deserialize)]
struct RawDelta {
    #[serde(rename = "type")]
    kind: String,
    shape: Shape,
    #[serde(default)]
    version: i64,
}

impl TryFrom<RawDelta> for DeltaOperation {
    type Error = ValidationError;

    fn try_from(raw: RawDelta) -> Result<Self, Self::Error> {
        Ok(Self { kind: raw.kind.parse()?, shape: raw.shape, version: raw.version })
    }
}

// =============================================================================
// SESSIONS
// =============================================================================

/// Organization role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
    Leader,
}

impl Role {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            "leader" => Some(Self::Leader),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Leader => "leader",
        }
    }
}

/// One connected identity within a session. `id` is the connection id;
/// the same user on two sockets is two participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub role: Role,
    /// Milliseconds since Unix epoch. Stamped by the registry.
    pub joined_at: i64,
}

/// Live record of who is watching a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSession {
    pub session_id: Uuid,
    pub board_id: String,
    pub state_id: String,
    pub participants: Vec<Participant>,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Outbound channels keyed by session, then by connection.
pub type BroadcastGroups = Arc<RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::Sender<Frame>>>>>;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub registry: Arc<SessionRegistry>,
    pub groups: BroadcastGroups,
    pub repo: Arc<dyn BoardRepository>,
    pub auth: Arc<dyn SessionVerifier>,
    pub roles: Arc<dyn RoleLookup>,
    pub realtime: RealtimeConfig,
    pub board_defaults: BoardDefaults,
}

impl AppState {
    #[must_use]
    pub fn new(repo: Arc<dyn BoardRepository>, auth: Arc<dyn SessionVerifier>, roles: Arc<dyn RoleLookup>) -> Self {
        Self {
            store: Arc::new(StateStore::new()),
            registry: Arc::new(SessionRegistry::new()),
            groups: Arc::new(RwLock::new(HashMap::new())),
            repo,
            auth,
            roles,
            realtime: RealtimeConfig::default(),
            board_defaults: BoardDefaults::default(),
        }
    }

    #[must_use]
    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }

    #[must_use]
    pub fn with_board_defaults(mut self, board_defaults: BoardDefaults) -> Self {
        self.board_defaults = board_defaults;
        self
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::services::auth::{AuthError, Identity};
    use crate::services::persistence::RepositoryError;
    use crate::shape::{ShapeData, ShapeRecord};

    /// In-memory `BoardRepository`. Saves can be switched to fail or stall.
    #[derive(Default)]
    pub struct MemoryRepository {
        boards: Mutex<HashMap<String, BoardMeta>>,
        shapes: Mutex<HashMap<String, Vec<(ShapeRecord, i64)>>>,
        fail_saves: AtomicBool,
        next_save_delay: Mutex<Option<std::time::Duration>>,
        saves: AtomicUsize,
    }

    impl MemoryRepository {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_saves(&self, fail: bool) {
            self.fail_saves.store(fail, Ordering::SeqCst);
        }

        /// Stall the next `save_board_state` call by `delay`.
        pub fn delay_next_save(&self, delay: std::time::Duration) {
            *self.next_save_delay.lock().expect("delay mutex") = Some(delay);
        }

        #[must_use]
        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        #[must_use]
        pub fn stored_board(&self, id: &str) -> Option<BoardMeta> {
            self.boards.lock().expect("boards mutex").get(id).cloned()
        }

        #[must_use]
        pub fn stored_shapes(&self, board_id: &str) -> Vec<ShapeRecord> {
            self.shapes
                .lock()
                .expect("shapes mutex")
                .get(board_id)
                .map(|rows| rows.iter().map(|(rec, _)| rec.clone()).collect())
                .unwrap_or_default()
        }

        /// Insert a board and its shapes directly, bypassing the trait.
        pub fn seed(&self, meta: BoardMeta, shapes: &[Shape]) {
            let rows = shapes
                .iter()
                .map(|s| (s.to_record(), meta.base_version))
                .collect();
            self.shapes
                .lock()
                .expect("shapes mutex")
                .insert(meta.id.clone(), rows);
            self.boards
                .lock()
                .expect("boards mutex")
                .insert(meta.id.clone(), meta);
        }

        /// Insert a raw shape row, bypassing validation.
        pub fn seed_raw_shape(&self, board_id: &str, record: ShapeRecord) {
            self.shapes
                .lock()
                .expect("shapes mutex")
                .entry(board_id.to_owned())
                .or_default()
                .push((record, 0));
        }

        fn fail() -> RepositoryError {
            RepositoryError::Database(sqlx::Error::PoolTimedOut)
        }
    }

    #[async_trait::async_trait]
    impl BoardRepository for MemoryRepository {
        async fn create_board(&self, board: &BoardMeta) -> Result<BoardMeta, RepositoryError> {
            self.boards
                .lock()
                .expect("boards mutex")
                .insert(board.id.clone(), board.clone());
            Ok(board.clone())
        }

        async fn find_board_by_id_latest(&self, id: &str) -> Result<Option<BoardMeta>, RepositoryError> {
            Ok(self.stored_board(id))
        }

        async fn find_shapes_by_board_id_and_version(
            &self,
            board_id: &str,
            version: i64,
        ) -> Result<Vec<ShapeRecord>, RepositoryError> {
            Ok(self
                .shapes
                .lock()
                .expect("shapes mutex")
                .get(board_id)
                .map(|rows| {
                    rows.iter()
                        .filter(|(_, v)| *v <= version)
                        .map(|(rec, _)| rec.clone())
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn add_shape_to_board(&self, shape: &ShapeRecord, board_id: &str) -> Result<String, RepositoryError> {
            let version = self.stored_board(board_id).map_or(0, |meta| meta.base_version);
            self.shapes
                .lock()
                .expect("shapes mutex")
                .entry(board_id.to_owned())
                .or_default()
                .push((shape.clone(), version));
            Ok(shape.id.clone())
        }

        async fn save_board_state(&self, board: &Board) -> Result<bool, RepositoryError> {
            let delay = self.next_save_delay.lock().expect("delay mutex").take();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(Self::fail());
            }
            let mut boards = self.boards.lock().expect("boards mutex");
            if let Some(existing) = boards.get(&board.id) {
                if existing.base_version >= board.base_version {
                    return Ok(false);
                }
            }
            boards.insert(board.id.clone(), board.meta());
            let rows = board
                .shapes
                .iter()
                .map(|s| (s.to_record(), board.base_version))
                .collect();
            self.shapes
                .lock()
                .expect("shapes mutex")
                .insert(board.id.clone(), rows);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// Token → identity map standing in for the session verifier.
    #[derive(Default)]
    pub struct StaticVerifier {
        tokens: HashMap<String, Identity>,
    }

    impl StaticVerifier {
        #[must_use]
        pub fn with_user(mut self, token: &str, user_id: &str, name: &str) -> Self {
            self.tokens.insert(token.to_owned(), identity(user_id, name));
            self
        }
    }

    #[async_trait::async_trait]
    impl SessionVerifier for StaticVerifier {
        async fn verify_session(&self, token: &str) -> Result<Identity, AuthError> {
            self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
        }
    }

    /// Fixed (board, user) → role table.
    #[derive(Default)]
    pub struct StaticRoles {
        roles: HashMap<(String, String), Role>,
    }

    impl StaticRoles {
        #[must_use]
        pub fn with_role(mut self, board_id: &str, user_id: &str, role: Role) -> Self {
            self.roles.insert((board_id.to_owned(), user_id.to_owned()), role);
            self
        }
    }

    #[async_trait::async_trait]
    impl RoleLookup for StaticRoles {
        async fn board_role(&self, board_id: &str, user_id: &str) -> Result<Option<Role>, AuthError> {
            Ok(self
                .roles
                .get(&(board_id.to_owned(), user_id.to_owned()))
                .copied())
        }
    }

    /// Test `AppState` backed by an empty in-memory repository and no users.
    #[must_use]
    pub fn test_app_state() -> AppState {
        test_app_state_with_repo(Arc::new(MemoryRepository::new()))
    }

    #[must_use]
    pub fn test_app_state_with_repo(repo: Arc<MemoryRepository>) -> AppState {
        AppState::new(repo, Arc::new(StaticVerifier::default()), Arc::new(StaticRoles::default()))
    }

    #[must_use]
    pub fn identity(user_id: &str, name: &str) -> Identity {
        Identity { id: user_id.to_owned(), name: name.to_owned(), email: format!("{user_id}@example.test") }
    }

    #[must_use]
    pub fn board_meta(id: &str, base_version: i64) -> BoardMeta {
        BoardMeta { id: id.to_owned(), width: 5000.0, height: 5000.0, base_version }
    }

    #[must_use]
    pub fn rect(id: &str, x: f64) -> Shape {
        Shape::new(id, "#ffeb3b", "#000000", 2.0, true, ShapeData::Rectangle { x, y: 10.0, width: 100.0, height: 50.0 })
    }

    #[must_use]
    pub fn participant(id: &str) -> Participant {
        Participant { id: id.to_owned(), user_id: format!("user-{id}"), name: id.to_owned(), role: Role::Member, joined_at: 0 }
    }

    /// Seed a stored board and return a state whose repository holds it.
    pub fn state_with_board(board_id: &str, shapes: &[Shape]) -> (AppState, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        repo.seed(board_meta(board_id, 0), shapes);
        (test_app_state_with_repo(repo.clone()), repo)
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
