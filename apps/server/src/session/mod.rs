//! Per-browser session state: tokens, identity and the engine context.

pub mod auth;
pub mod cookie;
pub mod registry;
pub mod token;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::StorageError;
use crate::models::RegisterRequest;

pub use auth::{AuthState, SessionAuthManager};
pub use registry::{SessionContext, SessionId, SessionRegistry};
pub use token::{decode_access_token, DecodedToken, Identity};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("invalid access token: {0}")]
    InvalidToken(String),
    #[error("refresh token rejected")]
    RefreshRejected,
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("auth service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed auth response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials(_) | Self::InvalidToken(_) | Self::RefreshRejected => {
                StatusCode::UNAUTHORIZED
            }
            Self::Rejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Transport(_) | Self::Malformed(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Refresh response; the refresh token is only present when rotated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedTokens {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Remote authentication endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError>;

    /// Account creation; the verification link is emailed out of band.
    async fn register(&self, profile: &RegisterRequest) -> Result<(), AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError>;

    async fn verify_email(&self, token: &str) -> Result<(), AuthError>;
}

/// Durable token slot, one per session.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, session: &SessionId) -> Result<Option<TokenPair>, StorageError>;
    async fn save(&self, session: &SessionId, tokens: &TokenPair) -> Result<(), StorageError>;
    async fn clear(&self, session: &SessionId) -> Result<(), StorageError>;
}
