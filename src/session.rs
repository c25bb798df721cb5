//! Session lifecycle: issuing, validating, refreshing, and revoking the
//! (access, refresh) token pair stored per user.
//!
//! Provides:
//! - Registration and login with salted iterated SHA-256 password hashing
//!   (100k rounds + per-user salt, constant-time compare)
//! - One active session per user, replaced wholesale on login
//! - Refresh that re-issues the access token without rotating the refresh
//!   token
//! - Logout and account deletion with cookie-backed token checks
//!
//! Every token-bearing operation runs the same fixed stage order:
//! cookie presence, signature/expiry verification, claim shape,
//! authorization, persistence. The first failing stage wins; later stages
//! are never consulted.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

use crate::error::ApiError;
use crate::store::{DocId, Document, DocumentStore, Filter, StoreError, UpdateOutcome};
use crate::tokens::{TokenClaims, TokenCodec, TokenError, TokenKind};

/// Collection holding account documents.
pub const USERS: &str = "users";

/// Collection holding session documents, unique per user.
pub const SESSIONS: &str = "sessions";

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// Salt burned on lookups that find no account, so unknown emails cost
/// the same as wrong passwords.
const DUMMY_SALT: &str = "00000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("You are already logged in")]
    AlreadyAuthenticated,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("An account with this email already exists")]
    DuplicateUser,
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("Failed to create the user account")]
    RegistrationFailed(#[source] StoreError),
    #[error("Failed to create the session")]
    SessionCreationFailed(#[source] StoreError),
    #[error("Missing token cookie")]
    MissingToken,
    #[error("Missing refresh token cookie")]
    MissingRefreshToken,
    #[error("Invalid token")]
    InvalidToken(#[source] TokenError),
    #[error("Invalid refresh token")]
    InvalidRefreshToken(#[source] TokenError),
    #[error("Token claims are malformed")]
    MalformedToken,
    #[error("User not found")]
    UserNotFound,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("Session not found")]
    SessionNotFound,
    #[error("Failed to delete the session")]
    SessionDeletionFailed(#[source] StoreError),
    #[error("Collection '{0}' does not exist")]
    CollectionNotFound(String),
    #[error("Failed to issue token")]
    TokenIssueFailed(#[source] TokenError),
    #[error("Stored record is malformed: {0}")]
    BadRecord(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::AlreadyAuthenticated | SessionError::DuplicateUser => {
                ApiError::conflict(message)
            }
            SessionError::InvalidInput(_)
            | SessionError::MissingToken
            | SessionError::MissingRefreshToken => ApiError::validation(message),
            SessionError::InvalidCredentials
            | SessionError::InvalidToken(_)
            | SessionError::InvalidRefreshToken(_)
            | SessionError::MalformedToken => ApiError::unauthorized(message),
            SessionError::Forbidden(_) => ApiError::forbidden(message),
            SessionError::UserNotFound
            | SessionError::SessionNotFound
            | SessionError::CollectionNotFound(_) => ApiError::not_found(message),
            SessionError::RegistrationFailed(_)
            | SessionError::SessionCreationFailed(_)
            | SessionError::SessionDeletionFailed(_)
            | SessionError::TokenIssueFailed(_)
            | SessionError::BadRecord(_) => ApiError::internal(message),
            SessionError::Store(inner) => ApiError::from(inner),
        }
    }
}

/// A registered account with its document id. The password hash never
/// leaves this module.
#[derive(Debug, Clone)]
pub struct User {
    pub id: DocId,
    pub name: String,
    pub email: String,
    password_hash: String,
}

/// The `users` document body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    name: String,
    email: String,
    password_hash: String,
}

/// The `sessions` document body: one row per user, both token values
/// stored verbatim so they work as lookup keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
}

/// Cookie values as presented by the request, before any validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresentedTokens<'a> {
    pub access: Option<&'a str>,
    pub refresh: Option<&'a str>,
}

/// A freshly issued pair plus the account it belongs to.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub user_id: DocId,
    pub name: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
}

/// Outcome of a refresh: the re-issued access token.
#[derive(Debug, Clone)]
pub struct RefreshedSession {
    pub name: String,
    pub access_token: String,
}

/// Outcome of logout or account deletion.
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub name: String,
}

pub struct SessionManager {
    store: Arc<DocumentStore>,
    codec: TokenCodec,
}

impl SessionManager {
    pub fn new(store: Arc<DocumentStore>, codec: TokenCodec) -> Self {
        Self { store, codec }
    }

    /// Authenticate by email and password and replace the user's session
    /// wholesale. Login inverts the usual presence stage: a `token` cookie
    /// must NOT be there.
    pub fn login(
        &self,
        email: &str,
        password: &str,
        existing_access: Option<&str>,
    ) -> Result<IssuedSession, SessionError> {
        if existing_access.is_some() {
            return Err(SessionError::AlreadyAuthenticated);
        }
        if email.trim().is_empty() || password.is_empty() {
            return Err(SessionError::InvalidInput("Email and password are required"));
        }

        self.ensure_collections()?;
        let user = match self.find_user_by_email(email.trim())? {
            Some(user) => user,
            None => {
                // Burn a hash so the miss costs the same as a mismatch.
                let _ = hash_password(password, DUMMY_SALT);
                return Err(SessionError::InvalidCredentials);
            }
        };
        if !verify_password(password, &user.password_hash) {
            return Err(SessionError::InvalidCredentials);
        }

        let now = SystemTime::now();
        let (access_token, refresh_token) = self.issue_pair(&user, now)?;
        let record = SessionRecord {
            user_id: user.id.to_string(),
            access_token: access_token.clone(),
            refresh_token: refresh_token.clone(),
        };
        self.store
            .update_one(
                SESSIONS,
                &Filter::new().eq("user_id", user.id.as_str()),
                &to_map(&record)?,
                true,
            )
            .map_err(SessionError::SessionCreationFailed)?;

        tracing::info!(user_id = %user.id, "user logged in");
        Ok(IssuedSession {
            user_id: user.id,
            name: user.name,
            email: user.email,
            access_token,
            refresh_token,
        })
    }

    /// Create an account, hash the password, and open its first session.
    pub fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<IssuedSession, SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::InvalidInput("Name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(SessionError::InvalidInput("Name too long (max 64 characters)"));
        }
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(SessionError::InvalidInput("A valid email address is required"));
        }
        if password.len() < 8 {
            return Err(SessionError::InvalidInput(
                "Password must be at least 8 characters",
            ));
        }

        self.ensure_collections()?;
        if self.find_user_by_email(email)?.is_some() {
            return Err(SessionError::DuplicateUser);
        }

        let record = UserRecord {
            name: name.to_string(),
            email: email.to_string(),
            password_hash: encode_password(password),
        };
        // The unique index can still fire if the same email lands between
        // the duplicate check above and this insert.
        let user_id = self
            .store
            .insert_one(USERS, to_map(&record)?)
            .map_err(SessionError::RegistrationFailed)?;

        let user = User {
            id: user_id,
            name: record.name,
            email: record.email,
            password_hash: record.password_hash,
        };
        let now = SystemTime::now();
        let (access_token, refresh_token) = self.issue_pair(&user, now)?;
        let session = SessionRecord {
            user_id: user.id.to_string(),
            access_token: access_token.clone(),
            refresh_token: refresh_token.clone(),
        };
        self.store
            .insert_one(SESSIONS, to_map(&session)?)
            .map_err(SessionError::SessionCreationFailed)?;

        tracing::info!(user_id = %user.id, "user registered");
        Ok(IssuedSession {
            user_id: user.id,
            name: user.name,
            email: user.email,
            access_token,
            refresh_token,
        })
    }

    /// Close the presented session. Requires both cookies; deletes the
    /// session row keyed by the access token value, then sweeps the
    /// refresh token value too.
    pub fn logout(&self, tokens: PresentedTokens<'_>) -> Result<ClosedSession, SessionError> {
        let access = tokens.access.ok_or(SessionError::MissingToken)?;
        let refresh = tokens.refresh.ok_or(SessionError::MissingRefreshToken)?;

        let now = SystemTime::now();
        let claims = self
            .codec
            .verify(TokenKind::Access, access, now)
            .map_err(SessionError::InvalidToken)?;
        self.codec
            .verify(TokenKind::Refresh, refresh, now)
            .map_err(SessionError::InvalidRefreshToken)?;
        let claims = require_claim_shape(claims)?;

        self.ensure_collections()?;
        let user = self
            .find_user_by_id(&claims.user_id)?
            .ok_or(SessionError::UserNotFound)?;
        // The verified claim must name the account it unlocks.
        if user.id.as_str() != claims.user_id {
            return Err(SessionError::Forbidden("Token does not match this account"));
        }

        let deleted = self
            .store
            .delete_one(SESSIONS, &Filter::new().eq("access_token", access))?;
        if deleted == 0 {
            return Err(SessionError::SessionNotFound);
        }
        if refresh != access {
            self.store
                .delete_many(SESSIONS, &Filter::new().eq("refresh_token", refresh))?;
        }

        tracing::info!(user_id = %user.id, "user logged out");
        Ok(ClosedSession { name: user.name })
    }

    /// Re-issue the access token against a presented refresh token. The
    /// refresh token itself is NOT rotated: the same value stays valid
    /// until its own expiry or an explicit logout/deletion.
    pub fn refresh(&self, tokens: PresentedTokens<'_>) -> Result<RefreshedSession, SessionError> {
        let refresh = tokens.refresh.ok_or(SessionError::MissingRefreshToken)?;

        let now = SystemTime::now();
        let claims = self
            .codec
            .verify(TokenKind::Refresh, refresh, now)
            .map_err(SessionError::InvalidRefreshToken)?;

        self.ensure_collections()?;
        let session_doc = self
            .store
            .find_one(SESSIONS, &Filter::new().eq("refresh_token", refresh))?
            .ok_or(SessionError::SessionNotFound)?;
        let user = self
            .find_user_by_email(&claims.email)?
            .ok_or(SessionError::UserNotFound)?;

        let access_token = self
            .codec
            .issue(TokenKind::Access, &identity_claims(&user), now)
            .map_err(SessionError::TokenIssueFailed)?;

        let mut patch = Map::new();
        patch.insert(
            "access_token".to_string(),
            Value::String(access_token.clone()),
        );
        let outcome =
            self.store
                .update_one(SESSIONS, &Filter::id(&session_doc.id), &patch, false)?;
        if outcome == UpdateOutcome::NoMatch {
            return Err(SessionError::SessionNotFound);
        }

        tracing::debug!(user_id = %user.id, "access token refreshed");
        Ok(RefreshedSession {
            name: user.name,
            access_token,
        })
    }

    /// Delete the account named by `target_user_id`, which must be the
    /// caller's own. The user row goes first; if the session sweep that
    /// follows fails, the failure is reported even though the account row
    /// is already gone.
    pub fn delete_account(
        &self,
        tokens: PresentedTokens<'_>,
        target_user_id: &str,
    ) -> Result<ClosedSession, SessionError> {
        let access = tokens.access.ok_or(SessionError::MissingToken)?;
        let refresh = tokens.refresh.ok_or(SessionError::MissingRefreshToken)?;

        let now = SystemTime::now();
        let claims = self
            .codec
            .verify(TokenKind::Access, access, now)
            .map_err(SessionError::InvalidToken)?;
        self.codec
            .verify(TokenKind::Refresh, refresh, now)
            .map_err(SessionError::InvalidRefreshToken)?;
        let claims = require_claim_shape(claims)?;

        if claims.user_id != target_user_id {
            return Err(SessionError::Forbidden(
                "You can only delete your own account",
            ));
        }

        self.ensure_collections()?;
        let user = self
            .find_user_by_id(&claims.user_id)?
            .ok_or(SessionError::UserNotFound)?;
        let removed = self.store.delete_one(USERS, &Filter::id(&user.id))?;
        if removed == 0 {
            return Err(SessionError::UserNotFound);
        }

        let sweep = self
            .store
            .delete_many(SESSIONS, &Filter::new().eq("access_token", access))
            .and_then(|_| {
                self.store
                    .delete_many(SESSIONS, &Filter::new().eq("refresh_token", refresh))
            });
        if let Err(err) = sweep {
            return Err(SessionError::SessionDeletionFailed(err));
        }

        tracing::info!(user_id = %user.id, "account deleted");
        Ok(ClosedSession { name: user.name })
    }

    // ── Lookup helpers ──────────────────────────────────────────────

    fn ensure_collections(&self) -> Result<(), SessionError> {
        for name in [USERS, SESSIONS] {
            if !self.store.collection_exists(name)? {
                return Err(SessionError::CollectionNotFound(name.to_string()));
            }
        }
        Ok(())
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, SessionError> {
        match self
            .store
            .find_one(USERS, &Filter::new().eq("email", email))?
        {
            Some(doc) => Ok(Some(user_from_doc(doc)?)),
            None => Ok(None),
        }
    }

    /// Claim ids that do not even parse cannot name a stored user.
    fn find_user_by_id(&self, raw_id: &str) -> Result<Option<User>, SessionError> {
        let Ok(id) = DocId::parse(raw_id) else {
            return Ok(None);
        };
        match self.store.find_one(USERS, &Filter::id(&id))? {
            Some(doc) => Ok(Some(user_from_doc(doc)?)),
            None => Ok(None),
        }
    }

    fn issue_pair(&self, user: &User, now: SystemTime) -> Result<(String, String), SessionError> {
        let claims = identity_claims(user);
        let access = self
            .codec
            .issue(TokenKind::Access, &claims, now)
            .map_err(SessionError::TokenIssueFailed)?;
        let refresh = self
            .codec
            .issue(TokenKind::Refresh, &claims, now)
            .map_err(SessionError::TokenIssueFailed)?;
        Ok((access, refresh))
    }
}

fn identity_claims(user: &User) -> TokenClaims {
    TokenClaims {
        user_id: user.id.to_string(),
        email: user.email.clone(),
        name: user.name.clone(),
    }
}

/// Claim shape stage: a usable access token names who it is for.
fn require_claim_shape(claims: TokenClaims) -> Result<TokenClaims, SessionError> {
    if claims.user_id.trim().is_empty() || claims.name.trim().is_empty() {
        return Err(SessionError::MalformedToken);
    }
    Ok(claims)
}

fn user_from_doc(doc: Document) -> Result<User, SessionError> {
    let Document { id, body } = doc;
    let record: UserRecord = serde_json::from_value(Value::Object(body))
        .map_err(|e| SessionError::BadRecord(e.to_string()))?;
    Ok(User {
        id,
        name: record.name,
        email: record.email,
        password_hash: record.password_hash,
    })
}

fn to_map<T: Serialize>(value: &T) -> Result<Map<String, Value>, SessionError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SessionError::BadRecord(
            "record did not serialize to an object".to_string(),
        )),
        Err(e) => Err(SessionError::BadRecord(e.to_string())),
    }
}

// ── Password Helpers ────────────────────────────────────────────────

/// Hash a password for storage: `{salt}${iterated-sha256-hex}`.
fn encode_password(password: &str) -> String {
    let salt = generate_salt();
    let hash = hash_password(password, &salt);
    format!("{salt}${hash}")
}

/// Check a password attempt against a stored `{salt}${hash}` value.
fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, hash)) = stored.split_once('$') else {
        // No salt to recover; burn a hash so the failure costs the same.
        let _ = hash_password(password, DUMMY_SALT);
        return false;
    };
    let attempt = hash_password(password, salt);
    constant_time_eq(hash.as_bytes(), attempt.as_bytes())
}

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    // Iterated hashing for key stretching
    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Tests ───────────────────────────────────────────────────────────
