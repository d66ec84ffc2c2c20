use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use permit_core::model::{NewPayment, PaymentStatus};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::ApiError;
use crate::extract::JsonBody;
use crate::services::payments::{Invoice, InvoiceRequest};
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-payment-signature";

/// Tolerance window for webhook timestamp verification (5 minutes).
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

const PAYMENT_METHOD: &str = "gcash";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments/checkout", get(checkout_status).post(checkout))
        .route("/webhooks/payment", post(payment_webhook))
}

/// Verify a webhook signature using HMAC-SHA256.
///
/// The signature header has the format:
///   t=<timestamp>,v1=<signature>[,v1=<signature>...]
pub fn verify_signature(
    payload: &str,
    sig_header: &str,
    secret: &str,
    now: i64,
) -> Result<(), ApiError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in sig_header.split(',') {
        let part = part.trim();
        if let Some(ts) = part.strip_prefix("t=") {
            timestamp = Some(ts);
        } else if let Some(sig) = part.strip_prefix("v1=") {
            signatures.push(sig);
        }
    }

    let ts = timestamp.ok_or(ApiError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(ApiError::InvalidSignature);
    }

    let ts_val: i64 = ts.parse().map_err(|_| ApiError::InvalidSignature)?;
    if (now - ts_val).abs() > TIMESTAMP_TOLERANCE_SECS {
        return Err(ApiError::InvalidSignature);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ApiError::InvalidSignature)?;
    mac.update(format!("{ts}.{payload}").as_bytes());

    for sig in &signatures {
        let Ok(candidate) = hex::decode(sig) else {
            continue;
        };
        // verify_slice compares in constant time.
        if mac.clone().verify_slice(&candidate).is_ok() {
            return Ok(());
        }
    }

    Err(ApiError::InvalidSignature)
}

/// Header value for `payload` signed at `timestamp`.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> Result<String, ApiError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| ApiError::Internal(e.to_string()))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let secret = state
        .config
        .payment
        .webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::Unavailable("payment webhooks are not configured".to_string()))?;

    let sig = headers
        .get(SIGNATURE_HEADER)
        .ok_or(ApiError::InvalidSignature)?
        .to_str()
        .map_err(|_| ApiError::InvalidSignature)?;
    let payload = std::str::from_utf8(&body).map_err(|_| ApiError::InvalidSignature)?;

    if let Err(e) = verify_signature(payload, sig, secret, chrono::Utc::now().timestamp()) {
        tracing::warn!("rejected payment webhook with invalid signature");
        return Err(e);
    }
    state.metrics.inc_payment_webhook();

    match serde_json::from_str::<WebhookEvent>(payload) {
        Ok(event) => handle_event(&state, event).await,
        Err(e) => tracing::warn!(error = %e, "unparseable payment webhook"),
    }

    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn handle_event(state: &AppState, event: WebhookEvent) {
    let paid = matches!(event.status.as_deref(), Some("PAID") | Some("paid"));
    if !paid {
        tracing::debug!(status = ?event.status, "ignoring payment webhook status");
        return;
    }

    let refs = [event.id, event.external_id];
    for external_ref in refs.iter().flatten().filter(|r| !r.is_empty()) {
        match state.workflow.on_payment_paid(external_ref).await {
            Ok(Some(outcome)) => {
                state.metrics.inc_transition(1);
                tracing::info!(
                    external_ref = %external_ref,
                    application_id = %outcome.id,
                    "payment confirmed, application moved to review"
                );
                return;
            }
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(external_ref = %external_ref, error = %e, "payment cascade failed");
                return;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    application_id: Option<Uuid>,
    amount: Option<f64>,
    #[serde(default)]
    email: Option<String>,
}

async fn checkout(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CheckoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let gateway = state.payments.clone().ok_or_else(|| {
        ApiError::Unavailable("Payment service not configured. Please contact support.".to_string())
    })?;

    let (Some(application_id), Some(amount)) = (req.application_id, req.amount) else {
        return Err(ApiError::Validation("Missing application_id or amount".to_string()));
    };
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ApiError::Validation("amount: must be positive".to_string()));
    }

    let application = state
        .store
        .get_application(application_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let reference = if application.reference_no.is_empty() {
        application_id.to_string()
    } else {
        application.reference_no.clone()
    };
    let invoice: Invoice = gateway
        .create_invoice(InvoiceRequest {
            external_id: reference.clone(),
            amount,
            description: format!("Permit fee for {reference}"),
            payer_email: req.email.filter(|e| !e.trim().is_empty()),
            redirect_url: state
                .config
                .payment
                .public_base_url
                .as_ref()
                .map(|base| format!("{base}/dashboard")),
        })
        .await
        .map_err(|e| {
            tracing::error!(application_id = %application_id, error = %e, "checkout failed");
            ApiError::Unavailable(
                "Payment service temporarily unavailable. Please try again later.".to_string(),
            )
        })?;

    let recorded = state
        .store
        .insert_payment(checkout_payment(application_id, amount, &invoice))
        .await;
    if let Err(e) = recorded {
        tracing::error!(application_id = %application_id, error = %e, "payment record creation failed");
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "invoice": invoice,
        "message": "Payment invoice created successfully",
    })))
}

/// Payment row for a new invoice. It stays pending until a signed webhook
/// reports it paid, whatever status the gateway echoed back.
fn checkout_payment(application_id: Uuid, amount: f64, invoice: &Invoice) -> NewPayment {
    let external_ref = if invoice.id.is_empty() {
        invoice.external_id.clone()
    } else {
        invoice.id.clone()
    };
    NewPayment {
        application_id,
        amount,
        status: PaymentStatus::Pending,
        external_ref,
        method: PAYMENT_METHOD.to_string(),
    }
}

async fn checkout_status(State(state): State<AppState>) -> Response {
    let config = serde_json::json!({
        "gateway_configured": state.payments.is_some(),
        "base_url_configured": state.config.payment.public_base_url.is_some(),
        "webhook_configured": state.config.payment.webhook_secret.is_some(),
    });

    if state.payments.is_none() {
        let body = serde_json::json!({
            "error": "payment gateway not configured",
            "config": config,
        });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }

    Json(serde_json::json!({
        "message": "Payment service is configured",
        "config": config,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &str = r#"{"id":"inv_1","status":"PAID"}"#;

    #[test]
    fn signed_payload_verifies() {
        let now = 1_700_000_000;
        let header = sign_payload(PAYLOAD, SECRET, now).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
        assert!(verify_signature(PAYLOAD, &header, SECRET, now + 299).is_ok());
    }

    #[test]
    fn tampered_or_stale_signatures_fail() {
        let now = 1_700_000_000;
        let header = sign_payload(PAYLOAD, SECRET, now).unwrap();

        let tampered = r#"{"id":"inv_2","status":"PAID"}"#;
        assert!(verify_signature(tampered, &header, SECRET, now).is_err());
        assert!(verify_signature(PAYLOAD, &header, "other", now).is_err());
        assert!(verify_signature(PAYLOAD, &header, SECRET, now + 301).is_err());
    }

    #[test]
    fn malformed_headers_fail() {
        let now = 1_700_000_000;
        for header in ["", "t=1700000000", "v1=abcd", "t=soon,v1=abcd", "t=1700000000,v1=zz"] {
            assert!(
                matches!(
                    verify_signature(PAYLOAD, header, SECRET, now),
                    Err(ApiError::InvalidSignature)
                ),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn any_matching_v1_entry_is_accepted() {
        let now = 1_700_000_000;
        let good = sign_payload(PAYLOAD, SECRET, now).unwrap();
        let sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={now},v1=deadbeef,v1={sig}");
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
    }

    #[test]
    fn checkout_records_pending_even_when_gateway_says_paid() {
        let application_id = Uuid::new_v4();
        let invoice = Invoice {
            id: "inv_9".to_string(),
            external_id: "BUS-2024-0001".to_string(),
            status: "PAID".to_string(),
            invoice_url: None,
            amount: 500.0,
        };

        let payment = checkout_payment(application_id, 500.0, &invoice);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.external_ref, "inv_9");
        assert_eq!(payment.application_id, application_id);

        let unnamed = Invoice {
            id: String::new(),
            ..invoice
        };
        assert_eq!(
            checkout_payment(application_id, 500.0, &unnamed).external_ref,
            "BUS-2024-0001"
        );
    }
}
