//! The browser side of a session: a signed tower-sessions cookie backed by
//! SQLite, whose record carries the booking session id.

use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha512;
use sqlx::SqlitePool;
use tower_sessions::cookie::{time, Key, SameSite};
use tower_sessions::service::SignedCookie;
use tower_sessions::{Expiry, Session, SessionManagerLayer};
use tower_sessions_sqlx_store::SqliteStore;

use super::SessionId;
use crate::config::Config;
use crate::db::StorageError;

/// Session cookie name.
pub const SESSION_COOKIE_NAME: &str = "booking_session";

/// Keys of the values kept in the session record.
pub mod keys {
    pub const BOOKING_SESSION: &str = "booking_session_id";
}

type HmacSha512 = Hmac<Sha512>;

/// 64-byte cookie signing key derived from `SESSION_SECRET`.
fn signing_key(config: &Config) -> Key {
    let mut mac = HmacSha512::new_from_slice(config.session_secret.expose_secret().as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(b"booking-session-cookie");
    Key::from(mac.finalize().into_bytes().as_slice())
}

/// Create the session layer over the SQLite store.
pub fn create_session_layer(
    pool: &SqlitePool,
    config: &Config,
) -> SessionManagerLayer<SqliteStore, SignedCookie> {
    let store = SqliteStore::new(pool.clone());
    let is_secure = config.public_url.scheme() == "https";
    let idle = i64::try_from(config.session_idle.as_secs()).unwrap_or(i64::MAX);

    SessionManagerLayer::new(store)
        .with_name(SESSION_COOKIE_NAME)
        .with_expiry(Expiry::OnInactivity(time::Duration::seconds(idle)))
        .with_secure(is_secure)
        // Lax: the payment provider sends the browser back with a top-level GET.
        .with_same_site(SameSite::Lax)
        .with_http_only(true)
        .with_path("/")
        .with_signed(signing_key(config))
}

/// The booking session bound to this cookie, if any.
pub async fn bound_session(session: &Session) -> Option<SessionId> {
    match session.get::<SessionId>(keys::BOOKING_SESSION).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("Unreadable session record: {}", e);
            None
        }
    }
}

/// Bind a fresh booking session to this cookie.
pub async fn bind_new_session(session: &Session) -> Result<SessionId, StorageError> {
    let id = SessionId::generate();
    session.insert(keys::BOOKING_SESSION, &id).await?;
    Ok(id)
}
