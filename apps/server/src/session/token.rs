//! Local, unverified decoding of access tokens.
//!
//! The signature is checked by the repository on every call; the gateway
//! only needs the identity claims and the expiry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AuthError;

#[derive(Debug, Deserialize)]
struct Claims {
    email: String,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    is_staff: bool,
    exp: i64,
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub full_name: String,
    pub is_admin: bool,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub identity: Identity,
    pub expires_at: DateTime<Utc>,
}

impl DecodedToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub fn decode_access_token(token: &str) -> Result<DecodedToken, AuthError> {
    let segments: Vec<&str> = token.split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return Err(AuthError::InvalidToken("expected three segments".into()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::InvalidToken(format!("payload is not base64url: {e}")))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::InvalidToken(format!("unexpected claims: {e}")))?;
    let expires_at = DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| AuthError::InvalidToken(format!("exp out of range: {}", claims.exp)))?;

    Ok(DecodedToken {
        identity: Identity {
            email: claims.email,
            full_name: claims.full_name,
            is_admin: claims.is_staff,
            phone: claims.phone.filter(|p| !p.trim().is_empty()),
        },
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mint_token;
    use chrono::Duration;

    #[test]
    fn test_decode_identity_claims() {
        let exp = Utc::now() + Duration::minutes(5);
        let token = mint_token("ada@example.com", true, exp);
        let decoded = decode_access_token(&token).unwrap();

        assert_eq!(decoded.identity.email, "ada@example.com");
        assert_eq!(decoded.identity.full_name, "Test Client");
        assert!(decoded.identity.is_admin);
        assert_eq!(decoded.expires_at.timestamp(), exp.timestamp());
        assert!(!decoded.is_expired(Utc::now()));
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let exp = Utc::now() - Duration::seconds(1);
        let decoded = decode_access_token(&mint_token("a@b.c", false, exp)).unwrap();
        assert!(decoded.is_expired(Utc::now()));
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(matches!(
            decode_access_token("not-a-jwt"),
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            decode_access_token("a.%%%.c"),
            Err(AuthError::InvalidToken(_))
        ));
    }
}
