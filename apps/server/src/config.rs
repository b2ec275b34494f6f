//! Process configuration, read once from the environment.

use secrecy::SecretString;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::payment::{paystack, stripe};

/// Shortest accepted session signing secret.
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug)]
pub struct PaystackConfig {
    pub secret_key: SecretString,
    pub base_url: Url,
}

#[derive(Debug)]
pub struct StripeConfig {
    pub secret_key: SecretString,
    pub base_url: Url,
    pub currency: String,
}

#[derive(Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Root of the remote appointment/auth API.
    pub api_base_url: Url,
    /// Where this gateway is reachable; payment callbacks point here.
    pub public_url: Url,
    pub frontend_url: Url,
    pub session_secret: SecretString,
    pub paystack: Option<PaystackConfig>,
    pub stripe: Option<StripeConfig>,
    pub business_utc_offset_minutes: i32,
    pub session_idle: Duration,
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let api_base_url = parse_url("API_BASE_URL", &required("API_BASE_URL")?)?;

        let session_secret = required("SESSION_SECRET")?;
        if session_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                key: "SESSION_SECRET",
                reason: format!("must be at least {MIN_SECRET_LEN} characters"),
            });
        }

        let paystack = get("PAYSTACK_SECRET_KEY")
            .map(|key| {
                let base = get("PAYSTACK_BASE_URL")
                    .unwrap_or_else(|| paystack::DEFAULT_BASE_URL.into());
                Ok::<_, ConfigError>(PaystackConfig {
                    secret_key: SecretString::from(key),
                    base_url: parse_url("PAYSTACK_BASE_URL", &base)?,
                })
            })
            .transpose()?;

        let stripe = get("STRIPE_SECRET_KEY")
            .map(|key| {
                let base = get("STRIPE_BASE_URL").unwrap_or_else(|| stripe::DEFAULT_BASE_URL.into());
                Ok::<_, ConfigError>(StripeConfig {
                    secret_key: SecretString::from(key),
                    base_url: parse_url("STRIPE_BASE_URL", &base)?,
                    currency: get("STRIPE_CURRENCY").unwrap_or_else(|| "gbp".into()),
                })
            })
            .transpose()?;

        let business_utc_offset_minutes = match get("BUSINESS_UTC_OFFSET_MINUTES") {
            Some(raw) => parse_number("BUSINESS_UTC_OFFSET_MINUTES", &raw)?,
            None => 0,
        };
        let idle_minutes: u64 = match get("SESSION_IDLE_MINUTES") {
            Some(raw) => parse_number("SESSION_IDLE_MINUTES", &raw)?,
            None => 120,
        };
        let port = match get("PORT") {
            Some(raw) => parse_number("PORT", &raw)?,
            None => 3000,
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite:booking.db?mode=rwc".into()),
            api_base_url,
            public_url: parse_url(
                "PUBLIC_URL",
                &get("PUBLIC_URL").unwrap_or_else(|| "http://localhost:3000".into()),
            )?,
            frontend_url: parse_url(
                "FRONTEND_URL",
                &get("FRONTEND_URL").unwrap_or_else(|| "http://localhost:5173".into()),
            )?,
            session_secret: SecretString::from(session_secret),
            paystack,
            stripe,
            business_utc_offset_minutes,
            session_idle: Duration::from_secs(idle_minutes * 60),
        })
    }

    fn join(base: &Url, path: &str) -> Url {
        let mut url = base.clone();
        url.set_path(path);
        url.set_query(None);
        url
    }

    /// Return address handed to the gateway for `provider_path`
    /// (`paystack` or `stripe`).
    pub fn callback_url(&self, provider_path: &str) -> Url {
        Self::join(
            &self.public_url,
            &format!("/api/payments/{provider_path}/callback"),
        )
    }

    /// A frontend page, e.g. `frontend_link("/booking", Some("payment=failed"))`.
    pub fn frontend_link(&self, path: &str, query: Option<&str>) -> String {
        let mut url = Self::join(&self.frontend_url, path);
        url.set_query(query);
        url.to_string()
    }

    /// The frontend origin, as CORS wants it.
    pub fn frontend_origin(&self) -> String {
        self.frontend_url.origin().ascii_serialization()
    }
}
