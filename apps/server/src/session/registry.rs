//! Booking session ids and the in-memory map of live session contexts.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{AuthApi, SessionAuthManager, TokenStore};
use crate::booking::BookingFlow;
use crate::slots::SlotFeed;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the engine keeps for one browser session.
pub struct SessionContext {
    pub id: SessionId,
    pub auth: SessionAuthManager,
    pub slots: SlotFeed,
    flow: Mutex<BookingFlow>,
    auth_checked: OnceCell<()>,
    last_seen: Mutex<Instant>,
}

impl SessionContext {
    pub fn new(id: SessionId, api: Arc<dyn AuthApi>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            auth: SessionAuthManager::new(id.clone(), api, store),
            id,
            slots: SlotFeed::new(),
            flow: Mutex::new(BookingFlow::new()),
            auth_checked: OnceCell::new(),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Run `check_auth` the first time the context is used.
    pub async fn ensure_auth_checked(&self) {
        self.auth_checked
            .get_or_init(|| async {
                self.auth.check_auth(Utc::now()).await;
            })
            .await;
    }

    pub fn with_flow<R>(&self, f: impl FnOnce(&mut BookingFlow) -> R) -> R {
        let mut flow = self.flow.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut flow)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

pub struct SessionRegistry {
    api: Arc<dyn AuthApi>,
    store: Arc<dyn TokenStore>,
    contexts: DashMap<SessionId, Arc<SessionContext>>,
}

impl SessionRegistry {
    pub fn new(api: Arc<dyn AuthApi>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            api,
            store,
            contexts: DashMap::new(),
        }
    }

    /// The context for `id`, created (and restored from persisted tokens)
    /// on first use.
    pub async fn context(&self, id: &SessionId) -> Arc<SessionContext> {
        let ctx = self
            .contexts
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::debug!("Opening session context {}", id);
                Arc::new(SessionContext::new(
                    id.clone(),
                    self.api.clone(),
                    self.store.clone(),
                ))
            })
            .clone();
        ctx.touch();
        ctx.ensure_auth_checked().await;
        ctx
    }

    /// Drop contexts idle for longer than `max_idle`. Persisted tokens stay,
    /// so an evicted session is restored on its next request.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|_, ctx| ctx.idle_for() < max_idle);
        before.saturating_sub(self.contexts.len())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }
}
