//! Authentication: credential types, the store ports, and the gate that
//! fronts them.
//!
//! The daemon core never talks to a user database directly. It depends on
//! the [`AuthStore`] port; adapters own their own locking and I/O. The
//! bundled [`MemoryAuthStore`] backs tests and single-node development
//! deployments.
//!
//! A password login that verifies successfully is exchanged for a
//! short-lived bearer token, returned to the client in the auth response so
//! reconnects skip the password path.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::chat::ChatFrame;
use crate::rate_limit::{LoginGate, LoginThrottle};

/// Client credentials, as carried in the auth-request JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    /// Bearer token from a previous password exchange.
    Token {
        /// Username the token was minted for.
        user: String,
        /// The bearer token.
        token: String,
    },
    /// Username and password.
    Password {
        /// Username.
        user: String,
        /// Cleartext password (the transport is expected to be TLS).
        password: String,
    },
}

impl Credentials {
    /// Username the credentials claim.
    #[must_use]
    pub fn user(&self) -> &str {
        match self {
            Self::Token { user, .. } | Self::Password { user, .. } => user,
        }
    }
}

/// Authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable numeric user id.
    pub user_id: u64,
    /// Name shown to peers.
    pub display_name: String,
    /// Expiry of the authenticating token.
    pub expires_at: DateTime<Utc>,
}

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Unknown user or wrong password/token.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Token exists but its lifetime has lapsed.
    #[error("credentials expired")]
    Expired,
    /// Source address is locked out by the login throttle.
    #[error("locked out")]
    LockedOut,
    /// Backing store could not be reached; retryable within the auth
    /// window.
    #[error("auth store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AuthError {
    /// True when the client may retry on the same connection.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Stable code carried in the auth-response body and metrics labels.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::Expired => "expired",
            Self::LockedOut => "locked_out",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// Auth-response JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthOutcome {
    /// Authentication succeeded.
    Ok {
        /// The authenticated identity.
        principal: Principal,
        /// Fresh bearer token, present on password logins.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Authentication failed.
    Error {
        /// Machine-readable failure code.
        code: String,
        /// Whether retrying on this connection can succeed.
        retryable: bool,
    },
}

impl AuthOutcome {
    /// Serializes the outcome for the auth-response record body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("auth outcome always serializes")
    }
}

/// Parses an auth-request record body.
///
/// # Errors
///
/// Returns [`crate::error::ProtocolError::Malformed`] if the body is not a
/// recognized credentials shape.
pub fn parse_credentials(body: &[u8]) -> crate::error::ProtocolResult<Credentials> {
    serde_json::from_slice(body)
        .map_err(|_| crate::error::ProtocolError::Malformed("credentials blob not valid JSON"))
}

/// Port to the user store.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Verifies credentials and returns the principal they identify.
    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError>;

    /// Mints a short-lived bearer token for an authenticated principal.
    async fn create_token(&self, principal: &Principal) -> Result<String, AuthError>;

    /// Revokes a previously minted token.
    async fn revoke(&self, token: &str) -> Result<(), AuthError>;
}

/// Errors from the history port. Never fatal for a session.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Store rejected or could not persist the frame.
    #[error("history append failed: {0}")]
    Append(String),
}

/// Port to the message archive. Failures are logged by callers and
/// otherwise ignored.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Appends an accepted chat frame for a principal.
    async fn append(&self, principal_id: u64, frame: &ChatFrame) -> Result<(), HistoryError>;
}

/// Gate in front of the auth store: throttles by source address, verifies,
/// and mints tokens for password logins.
pub struct AuthGate {
    store: Arc<dyn AuthStore>,
    throttle: Arc<LoginThrottle>,
}

impl AuthGate {
    /// Creates a gate over a store and a shared login throttle.
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, throttle: Arc<LoginThrottle>) -> Self {
        Self { store, throttle }
    }

    /// Authenticates one attempt from `addr`.
    ///
    /// The throttle is consulted (and the attempt recorded) before the
    /// store sees the credentials, so a locked-out source cannot probe
    /// passwords.
    ///
    /// # Errors
    ///
    /// Any [`AuthError`]; only [`AuthError::StoreUnavailable`] is
    /// retryable.
    pub async fn authenticate(
        &self,
        addr: IpAddr,
        credentials: &Credentials,
        now: Instant,
    ) -> Result<(Principal, Option<String>), AuthError> {
        if let LoginGate::LockedOut { retry_after } = self.throttle.check(addr, now) {
            tracing::warn!(addr = %addr, retry_after_secs = retry_after.as_secs(), "login attempt while locked out");
            return Err(AuthError::LockedOut);
        }

        let principal = self.store.verify(credentials).await?;

        let token = match credentials {
            Credentials::Password { .. } => Some(self.store.create_token(&principal).await?),
            Credentials::Token { .. } => None,
        };
        Ok((principal, token))
    }
}

/// In-memory [`AuthStore`] adapter.
///
/// Holds a fixed user table and a token map guarded by an `RwLock`; safe
/// for many concurrent callers. Suitable for tests and development, not for
/// production credential storage.
pub struct MemoryAuthStore {
    users: HashMap<String, StoredUser>,
    tokens: RwLock<HashMap<String, IssuedToken>>,
    token_ttl: ChronoDuration,
}

struct StoredUser {
    user_id: u64,
    display_name: String,
    password: String,
}

struct IssuedToken {
    user_id: u64,
    expires_at: DateTime<Utc>,
}

impl MemoryAuthStore {
    /// Creates an empty store with the given token lifetime in seconds.
    #[must_use]
    pub fn new(token_ttl_secs: i64) -> Self {
        Self {
            users: HashMap::new(),
            tokens: RwLock::new(HashMap::new()),
            token_ttl: ChronoDuration::seconds(token_ttl_secs),
        }
    }

    /// Adds a user. Ids must be unique; the last registration of a
    /// username wins.
    #[must_use]
    pub fn with_user(mut self, user_id: u64, name: &str, password: &str) -> Self {
        self.users.insert(
            name.to_string(),
            StoredUser {
                user_id,
                display_name: name.to_string(),
                password: password.to_string(),
            },
        );
        self
    }

    /// Pre-issues a token for a user, for tests that skip the password
    /// path.
    pub fn issue_token(&self, user_id: u64, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                token.to_string(),
                IssuedToken {
                    user_id,
                    expires_at: Utc::now() + self.token_ttl,
                },
            );
    }

    fn principal_for(&self, user: &StoredUser, expires_at: DateTime<Utc>) -> Principal {
        Principal {
            user_id: user.user_id,
            display_name: user.display_name.clone(),
            expires_at,
        }
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        let user = self
            .users
            .get(credentials.user())
            .ok_or(AuthError::InvalidCredentials)?;

        match credentials {
            Credentials::Password { password, .. } => {
                if *password != user.password {
                    return Err(AuthError::InvalidCredentials);
                }
                Ok(self.principal_for(user, Utc::now() + self.token_ttl))
            },
            Credentials::Token { token, .. } => {
                let tokens = self
                    .tokens
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let issued = tokens.get(token).ok_or(AuthError::InvalidCredentials)?;
                if issued.user_id != user.user_id {
                    return Err(AuthError::InvalidCredentials);
                }
                if issued.expires_at <= Utc::now() {
                    return Err(AuthError::Expired);
                }
                Ok(self.principal_for(user, issued.expires_at))
            },
        }
    }

    async fn create_token(&self, principal: &Principal) -> Result<String, AuthError> {
        let token = format!("pt-{}", Uuid::new_v4());
        self.tokens
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                token.clone(),
                IssuedToken {
                    user_id: principal.user_id,
                    expires_at: Utc::now() + self.token_ttl,
                },
            );
        Ok(token)
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        self.tokens
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(token);
        Ok(())
    }
}
