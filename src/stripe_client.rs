// src/stripe_client.rs
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signatures older or newer than this many seconds are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum StripeError {
    #[error("Stripe API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Stripe API error ({status}): {body}")]
    Api { status: u16, body: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum WebhookVerifyError {
    #[error("signature header missing timestamp")]
    MissingTimestamp,
    #[error("signature header carries no v1 signature")]
    MissingSignature,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("no signature matched the payload")]
    Mismatch,
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct BillingPortalSession {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub current_period_end: i64,
    pub items: SubscriptionItems,
}

impl StripeSubscription {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .map(|item| item.price.id.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionItems {
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionItem {
    pub price: SubscriptionPrice,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionPrice {
    pub id: String,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Self {
        Self {
            client: Client::new(),
            secret_key,
            base_url: "https://api.stripe.com/v1".to_string(),
        }
    }

    /// Subscription checkout for a first-time purchase. The user id rides
    /// along as metadata so the completion webhook can find the local row.
    pub async fn create_checkout_session(
        &self,
        user_id: &str,
        price_id: &str,
        billing_url: &str,
    ) -> Result<String, StripeError> {
        let params = [
            ("success_url", billing_url),
            ("cancel_url", billing_url),
            ("mode", "subscription"),
            ("payment_method_types[0]", "card"),
            ("billing_address_collection", "auto"),
            ("line_items[0][price]", price_id),
            ("line_items[0][quantity]", "1"),
            ("metadata[userId]", user_id),
        ];

        let session: CheckoutSession = self.post_form("/checkout/sessions", &params).await?;
        Ok(session.url)
    }

    /// Billing-management portal for an existing customer.
    pub async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, StripeError> {
        let params = [("customer", customer_id), ("return_url", return_url)];

        let session: BillingPortalSession =
            self.post_form("/billing_portal/sessions", &params).await?;
        Ok(session.url)
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscription, StripeError> {
        let response = self
            .client
            .get(format!("{}/subscriptions/{}", self.base_url, subscription_id))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StripeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, StripeError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StripeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

/// Verifies a `Stripe-Signature` header against the raw payload:
/// HMAC-SHA256 over `"{t}.{payload}"` with the endpoint secret, compared
/// against each `v1` candidate. Runs before any state mutation.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: i64,
) -> Result<(), WebhookVerifyError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => candidates.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(WebhookVerifyError::MissingTimestamp)?;
    if candidates.is_empty() {
        return Err(WebhookVerifyError::MissingSignature);
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookVerifyError::Expired);
    }

    for candidate in candidates {
        let Ok(signature) = hex::decode(candidate) else {
            continue;
        };

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        if mac.verify_slice(&signature).is_ok() {
            return Ok(());
        }
    }

    Err(WebhookVerifyError::Mismatch)
}

/// Computes the hex `v1` signature for a payload (test construction).
pub fn sign_webhook_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: StripeEventObject,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventObject {
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What a verified event asks of us. Anything we do not recognize, or
/// anything without the user-identifying metadata, is acknowledged and
/// ignored — webhooks never error for "not relevant to us".
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAction {
    Ignore,
    /// First purchase: record every subscription field on the user.
    CheckoutCompleted {
        user_id: String,
        subscription_id: String,
    },
    /// Renewal: refresh price and period end on the subscribed user.
    InvoicePaid { subscription_id: String },
}

pub fn classify_event(event: &StripeEvent) -> WebhookAction {
    if !event.data.object.metadata.contains_key("userId") {
        return WebhookAction::Ignore;
    }

    let Some(subscription_id) = event.data.object.subscription.clone() else {
        return WebhookAction::Ignore;
    };

    match event.event_type.as_str() {
        "checkout.session.completed" => WebhookAction::CheckoutCompleted {
            user_id: event.data.object.metadata["userId"].clone(),
            subscription_id,
        },
        "invoice.payment_succeeded" => WebhookAction::InvoicePaid { subscription_id },
        _ => WebhookAction::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn accepts_a_correctly_signed_payload() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign_webhook_payload(payload, SECRET, now));

        assert!(verify_webhook_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let payload = br#"{"amount":100}"#;
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign_webhook_payload(payload, SECRET, now));

        let tampered = br#"{"amount":999}"#;
        assert_eq!(
            verify_webhook_signature(tampered, &header, SECRET, now),
            Err(WebhookVerifyError::Mismatch)
        );
    }

    #[test]
    fn rejects_a_stale_timestamp() {
        let payload = b"{}";
        let signed_at = 1_700_000_000;
        let header = format!(
            "t={},v1={}",
            signed_at,
            sign_webhook_payload(payload, SECRET, signed_at)
        );

        assert_eq!(
            verify_webhook_signature(payload, &header, SECRET, signed_at + 600),
            Err(WebhookVerifyError::Expired)
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(
            verify_webhook_signature(b"{}", "v1=deadbeef", SECRET, 0),
            Err(WebhookVerifyError::MissingTimestamp)
        );
        assert_eq!(
            verify_webhook_signature(b"{}", "t=123", SECRET, 123),
            Err(WebhookVerifyError::MissingSignature)
        );
    }

    #[test]
    fn accepts_when_any_v1_candidate_matches() {
        let payload = b"{}";
        let now = 1_700_000_000;
        let good = sign_webhook_payload(payload, SECRET, now);
        let header = format!("t={},v1={},v1={}", now, "00".repeat(32), good);

        assert!(verify_webhook_signature(payload, &header, SECRET, now).is_ok());
    }

    fn event(kind: &str, body: serde_json::Value) -> StripeEvent {
        serde_json::from_value(serde_json::json!({
            "type": kind,
            "data": { "object": body },
        }))
        .unwrap()
    }

    #[test]
    fn checkout_completion_targets_the_metadata_user() {
        let action = classify_event(&event(
            "checkout.session.completed",
            serde_json::json!({
                "subscription": "sub_42",
                "metadata": { "userId": "user_7" },
            }),
        ));

        assert_eq!(
            action,
            WebhookAction::CheckoutCompleted {
                user_id: "user_7".to_string(),
                subscription_id: "sub_42".to_string(),
            }
        );
    }

    #[test]
    fn events_without_user_metadata_are_ignored() {
        let action = classify_event(&event(
            "checkout.session.completed",
            serde_json::json!({ "subscription": "sub_42", "metadata": {} }),
        ));
        assert_eq!(action, WebhookAction::Ignore);
    }

    #[test]
    fn unrecognized_event_kinds_are_ignored() {
        let action = classify_event(&event(
            "customer.subscription.deleted",
            serde_json::json!({
                "subscription": "sub_42",
                "metadata": { "userId": "user_7" },
            }),
        ));
        assert_eq!(action, WebhookAction::Ignore);
    }

    #[test]
    fn renewal_refreshes_by_subscription_id() {
        let action = classify_event(&event(
            "invoice.payment_succeeded",
            serde_json::json!({
                "subscription": "sub_42",
                "metadata": { "userId": "user_7" },
            }),
        ));
        assert_eq!(
            action,
            WebhookAction::InvoicePaid {
                subscription_id: "sub_42".to_string(),
            }
        );
    }
}
