//! Paystack transaction API.

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use super::{success_body, GatewayError, GatewayVerification, PaymentGateway, PaymentRedirect};
use crate::models::PaymentProvider;
use crate::pricing::to_minor_units;

pub const DEFAULT_BASE_URL: &str = "https://api.paystack.co/";

pub struct PaystackGateway {
    http: reqwest::Client,
    base: Url,
    secret_key: SecretString,
    callback_url: Url,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
    reference: String,
}

fn unwrap_envelope<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, GatewayError> {
    let envelope: Envelope<T> =
        serde_json::from_str(body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    match envelope {
        Envelope {
            status: true,
            data: Some(data),
            ..
        } => Ok(data),
        Envelope { message, .. } => Err(GatewayError::Rejected {
            status: 200,
            message,
        }),
    }
}

fn parse_initialize(body: &str) -> Result<PaymentRedirect, GatewayError> {
    let data: InitializeData = unwrap_envelope(body)?;
    Ok(PaymentRedirect {
        provider: PaymentProvider::Paystack,
        redirect_url: data.authorization_url,
        correlation_id: data.reference,
    })
}

fn parse_verify(body: &str) -> Result<GatewayVerification, GatewayError> {
    let data: VerifyData = unwrap_envelope(body)?;
    Ok(GatewayVerification {
        paid: data.status == "success",
        correlation_id: data.reference,
        status: data.status,
    })
}

impl PaystackGateway {
    pub fn new(http: reqwest::Client, base: Url, secret_key: SecretString, callback_url: Url) -> Self {
        Self {
            http,
            base,
            secret_key,
            callback_url,
        }
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Paystack
    }

    async fn initialize(
        &self,
        email: &str,
        amount: Decimal,
    ) -> Result<PaymentRedirect, GatewayError> {
        let minor = to_minor_units(amount)
            .filter(|m| *m > 0)
            .ok_or(GatewayError::InvalidAmount(amount))?;

        let resp = self
            .http
            .post(self.base.join("transaction/initialize")?)
            .bearer_auth(self.secret_key.expose_secret())
            .json(&serde_json::json!({
                "email": email,
                "amount": minor,
                "callback_url": self.callback_url.as_str(),
            }))
            .send()
            .await?;

        parse_initialize(&success_body(resp).await?)
    }

    async fn verify(&self, correlation_id: &str) -> Result<GatewayVerification, GatewayError> {
        let mut url = self.base.join("transaction/verify/")?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::Malformed("base URL cannot carry a path".into()))?
            .pop_if_empty()
            .push(correlation_id);

        let resp = self
            .http
            .get(url)
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await?;

        parse_verify(&success_body(resp).await?)
    }
}
