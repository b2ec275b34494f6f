//! Stripe Checkout sessions.

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use super::{success_body, GatewayError, GatewayVerification, PaymentGateway, PaymentRedirect};
use crate::models::PaymentProvider;
use crate::pricing::to_minor_units;

pub const DEFAULT_BASE_URL: &str = "https://api.stripe.com/";

const LINE_ITEM_NAME: &str = "Appointment deposit";

pub struct StripeGateway {
    http: reqwest::Client,
    base: Url,
    secret_key: SecretString,
    currency: String,
    callback_url: Url,
    cancel_url: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
}

fn parse_created(body: &str) -> Result<PaymentRedirect, GatewayError> {
    let session: CheckoutSession =
        serde_json::from_str(body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    let redirect_url = session
        .url
        .ok_or_else(|| GatewayError::Malformed(format!("checkout session {} has no url", session.id)))?;
    Ok(PaymentRedirect {
        provider: PaymentProvider::Stripe,
        redirect_url,
        correlation_id: session.id,
    })
}

fn parse_retrieved(body: &str) -> Result<GatewayVerification, GatewayError> {
    let session: CheckoutSession =
        serde_json::from_str(body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    let status = session.payment_status.unwrap_or_else(|| "unknown".into());
    Ok(GatewayVerification {
        paid: status == "paid",
        correlation_id: session.id,
        status,
    })
}

impl StripeGateway {
    pub fn new(
        http: reqwest::Client,
        base: Url,
        secret_key: SecretString,
        currency: String,
        callback_url: Url,
        cancel_url: String,
    ) -> Self {
        Self {
            http,
            base,
            secret_key,
            currency: currency.to_lowercase(),
            callback_url,
            cancel_url,
        }
    }

    /// Stripe substitutes the literal `{CHECKOUT_SESSION_ID}` placeholder,
    /// so it must not be percent-encoded into the URL.
    fn success_url(&self) -> String {
        format!("{}?session_id={{CHECKOUT_SESSION_ID}}", self.callback_url)
    }

    fn checkout_form(&self, email: &str, minor: i64) -> Vec<(&'static str, String)> {
        vec![
            ("mode", "payment".into()),
            ("customer_email", email.into()),
            ("line_items[0][quantity]", "1".into()),
            ("line_items[0][price_data][currency]", self.currency.clone()),
            ("line_items[0][price_data][unit_amount]", minor.to_string()),
            ("line_items[0][price_data][product_data][name]", LINE_ITEM_NAME.into()),
            ("success_url", self.success_url()),
            ("cancel_url", self.cancel_url.clone()),
        ]
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
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
            .post(self.base.join("v1/checkout/sessions")?)
            .bearer_auth(self.secret_key.expose_secret())
            .form(&self.checkout_form(email, minor))
            .send()
            .await?;

        parse_created(&success_body(resp).await?)
    }

    async fn verify(&self, correlation_id: &str) -> Result<GatewayVerification, GatewayError> {
        let mut url = self.base.join("v1/checkout/sessions/")?;
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

        parse_retrieved(&success_body(resp).await?)
    }
}
