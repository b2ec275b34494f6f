//! Token lifecycle of one session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use super::{decode_access_token, AuthApi, Identity, SessionId, TokenPair, TokenStore};
use crate::error::EngineError;
use crate::models::RegisterRequest;
use crate::repository::RepositoryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated { identity: Identity },
    Expired,
}

#[derive(Debug)]
struct Inner {
    state: AuthState,
    tokens: Option<TokenPair>,
}

/// Owns the access/refresh pair of one session and the identity decoded
/// from it.
///
/// Refreshes are single-flight: callers that hit an expired token all wait
/// on `refresh_gate`, and whoever gets it second finds the token already
/// replaced and reuses the result instead of spending the refresh token
/// again.
pub struct SessionAuthManager {
    session_id: SessionId,
    api: Arc<dyn AuthApi>,
    store: Arc<dyn TokenStore>,
    inner: Mutex<Inner>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl SessionAuthManager {
    pub fn new(session_id: SessionId, api: Arc<dyn AuthApi>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            session_id,
            api,
            store,
            inner: Mutex::new(Inner {
                state: AuthState::Anonymous,
                tokens: None,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> AuthState {
        self.inner().state.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        match &self.inner().state {
            AuthState::Authenticated { identity } => Some(identity.clone()),
            _ => None,
        }
    }

    pub fn require_identity(&self) -> Result<Identity, EngineError> {
        self.identity().ok_or(EngineError::NotAuthenticated)
    }

    /// UX-level role check; the repository enforces the real policy.
    pub fn is_admin(&self) -> bool {
        self.identity().is_some_and(|i| i.is_admin)
    }

    fn tokens(&self) -> Option<TokenPair> {
        self.inner().tokens.clone()
    }

    fn adopt(&self, tokens: TokenPair, identity: Identity) {
        let mut inner = self.inner();
        inner.tokens = Some(tokens);
        inner.state = AuthState::Authenticated { identity };
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, EngineError> {
        let previous = {
            let mut inner = self.inner();
            std::mem::replace(&mut inner.state, AuthState::Authenticating)
        };

        let attempt = async {
            let tokens = self.api.login(email, password).await?;
            // An undecodable token is a failed login, not a partial one.
            let decoded = decode_access_token(&tokens.access)?;
            self.store.save(&self.session_id, &tokens).await?;
            Ok::<_, EngineError>((tokens, decoded.identity))
        }
        .await;

        match attempt {
            Ok((tokens, identity)) => {
                tracing::info!("Session {} logged in as {}", self.session_id, identity.email);
                self.adopt(tokens, identity.clone());
                Ok(identity)
            }
            Err(err) => {
                self.inner().state = previous;
                Err(err)
            }
        }
    }

    /// Restore the session from persisted tokens. Runs once per context.
    pub async fn check_auth(&self, now: DateTime<Utc>) -> AuthState {
        let tokens = match self.store.load(&self.session_id).await {
            Ok(Some(tokens)) => tokens,
            Ok(None) => {
                self.set_anonymous();
                return self.state();
            }
            Err(e) => {
                tracing::warn!("Could not load tokens for session {}: {}", self.session_id, e);
                self.set_anonymous();
                return self.state();
            }
        };

        match decode_access_token(&tokens.access) {
            Err(e) => {
                tracing::warn!("Discarding unreadable token for session {}: {}", self.session_id, e);
                self.logout().await;
            }
            Ok(decoded) if decoded.is_expired(now) => {
                let stale = tokens.access.clone();
                {
                    let mut inner = self.inner();
                    inner.tokens = Some(tokens);
                    inner.state = AuthState::Expired;
                }
                if let Err(e) = self.refresh_after(&stale).await {
                    tracing::info!("Session {} could not be refreshed: {}", self.session_id, e);
                }
            }
            Ok(decoded) => self.adopt(tokens, decoded.identity),
        }

        self.state()
    }

    /// Replace `stale_access` with a fresh access token.
    ///
    /// Callers holding the same stale token share a single refresh call.
    /// A failed refresh logs the session out.
    pub async fn refresh_after(&self, stale_access: &str) -> Result<String, EngineError> {
        let _gate = self.refresh_gate.lock().await;

        let Some(tokens) = self.tokens() else {
            return Err(EngineError::AuthExpired);
        };
        if tokens.access != stale_access {
            return Ok(tokens.access);
        }

        let refreshed = match self.api.refresh(&tokens.refresh).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!("Token refresh failed for session {}: {}", self.session_id, e);
                self.logout().await;
                return Err(EngineError::AuthExpired);
            }
        };

        let decoded = match decode_access_token(&refreshed.access) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Refreshed token unreadable for session {}: {}", self.session_id, e);
                self.logout().await;
                return Err(EngineError::AuthExpired);
            }
        };

        let pair = TokenPair {
            access: refreshed.access,
            refresh: refreshed.refresh.unwrap_or(tokens.refresh),
        };
        if let Err(e) = self.store.save(&self.session_id, &pair).await {
            tracing::error!("Could not persist refreshed tokens for session {}: {}", self.session_id, e);
        }

        tracing::debug!("Session {} refreshed", self.session_id);
        let access = pair.access.clone();
        self.adopt(pair, decoded.identity);
        Ok(access)
    }

    /// A usable access token, refreshing first when the current one expired.
    pub async fn access_token(&self) -> Result<String, EngineError> {
        let tokens = self.tokens().ok_or(EngineError::NotAuthenticated)?;
        match decode_access_token(&tokens.access) {
            Ok(decoded) if !decoded.is_expired(Utc::now()) => Ok(tokens.access),
            _ => self.refresh_after(&tokens.access).await,
        }
    }

    /// Run a repository call with the session's bearer token, refreshing and
    /// retrying once if the token is rejected.
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let token = self.access_token().await?;
        match op(token.clone()).await {
            Err(RepositoryError::Unauthorized) => {
                let fresh = self.refresh_after(&token).await?;
                op(fresh).await.map_err(EngineError::from)
            }
            other => other.map_err(EngineError::from),
        }
    }

    /// Idempotent; storage failures are logged, never surfaced.
    pub async fn logout(&self) {
        if let Err(e) = self.store.clear(&self.session_id).await {
            tracing::warn!("Could not clear tokens for session {}: {}", self.session_id, e);
        }
        self.set_anonymous();
    }

    fn set_anonymous(&self) {
        let mut inner = self.inner();
        inner.tokens = None;
        inner.state = AuthState::Anonymous;
    }

    pub async fn register(&self, profile: &RegisterRequest) -> Result<(), EngineError> {
        self.api.register(profile).await?;
        tracing::info!("Registered {}; verification email pending", profile.email);
        Ok(())
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), EngineError> {
        self.api.verify_email(token).await?;
        Ok(())
    }
}
