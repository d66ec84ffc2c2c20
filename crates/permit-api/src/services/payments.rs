//! Hosted-invoice payment gateway.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::PaymentConfig;

const CURRENCY: &str = "PHP";
const PAYMENT_METHODS: [&str; 3] = ["GCASH", "CARD", "PAYMAYA"];

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment gateway returned {0}")]
    Gateway(u16),
    #[error("payment gateway unreachable: {0}")]
    Transport(String),
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvoiceRequest {
    /// Our reference; echoed back by the provider as `external_id`.
    pub external_id: String,
    pub amount: f64,
    pub description: String,
    pub payer_email: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub external_id: String,
    #[serde(default = "pending")]
    pub status: String,
    #[serde(default)]
    pub invoice_url: Option<String>,
    pub amount: f64,
}

fn pending() -> String {
    "PENDING".to_string()
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice, PaymentError>;
}

#[derive(Serialize)]
struct CreateInvoiceBody<'a> {
    external_id: &'a str,
    amount: i64,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payer_email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    success_redirect_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_redirect_url: Option<&'a str>,
    currency: &'a str,
    payment_methods: &'a [&'a str],
}

/// Gateway client authenticating with the secret key as basic-auth user.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    api_url: String,
    authorization: String,
}

impl HttpPaymentGateway {
    /// `None` when no API key is configured.
    pub fn from_config(config: &PaymentConfig) -> Result<Option<Self>, reqwest::Error> {
        let Some(api_key) = config.api_key.as_deref() else {
            return Ok(None);
        };
        let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{api_key}:"));
        Ok(Some(Self {
            client: super::http_client()?,
            api_url: config.api_url.clone(),
            authorization: format!("Basic {credentials}"),
        }))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice, PaymentError> {
        let body = CreateInvoiceBody {
            external_id: &request.external_id,
            // Provider takes whole pesos.
            amount: request.amount.round() as i64,
            description: &request.description,
            payer_email: request.payer_email.as_deref(),
            success_redirect_url: request.redirect_url.as_deref(),
            failure_redirect_url: request.redirect_url.as_deref(),
            currency: CURRENCY,
            payment_methods: &PAYMENT_METHODS,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = %status, external_id = %request.external_id, "invoice creation failed");
            return Err(PaymentError::Gateway(status.as_u16()));
        }

        response
            .json::<Invoice>()
            .await
            .map_err(|e| PaymentError::Decode(e.to_string()))
    }
}
