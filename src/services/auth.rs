//! Auth service — session-token verification and board role lookup.
//!
//! ARCHITECTURE
//! ============
//! Identity issuance lives elsewhere; this service only checks what it is
//! handed. Tokens are stored as SHA-256 hex digests, so a leaked `sessions`
//! table never yields usable bearer credentials.
//!
//! Both lookups sit behind traits so the realtime gateway can be exercised
//! without a database.

use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

use crate::state::Role;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired session token")]
    InvalidToken,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "E_UNAUTHORIZED",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

/// Resolves a bearer token to the identity it was issued for.
#[async_trait::async_trait]
pub trait SessionVerifier: Send + Sync {
    /// # Errors
    ///
    /// `InvalidToken` for malformed, unknown, or expired tokens.
    async fn verify_session(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Resolves a user's role on a board. `None` when the user holds no
/// membership row.
#[async_trait::async_trait]
pub trait RoleLookup: Send + Sync {
    async fn board_role(&self, board_id: &str, user_id: &str) -> Result<Option<Role>, AuthError>;
}

/// Digest stored in `sessions.token_hash`.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let bytes = hasher.finalize();
    bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
}

/// Postgres-backed verifier and role lookup.
pub struct PgAuth {
    pool: PgPool,
}

impl PgAuth {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionVerifier for PgAuth {
    async fn verify_session(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        let row = sqlx::query(
            r"SELECT u.id::text AS id, u.name, u.email
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token_hash = $1 AND s.expires_at > now()",
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(AuthError::InvalidToken)?;
        Ok(Identity { id: row.get("id"), name: row.get("name"), email: row.get("email") })
    }
}

#[async_trait::async_trait]
impl RoleLookup for PgAuth {
    async fn board_role(&self, board_id: &str, user_id: &str) -> Result<Option<Role>, AuthError> {
        let role: Option<String> =
            sqlx::query_scalar("SELECT role FROM board_members WHERE board_id = $1 AND user_id::text = $2")
                .bind(board_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(role.as_deref().and_then(Role::parse))
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
