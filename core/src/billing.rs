//! Payment processor webhooks: signature verification and event parsing.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::models::SubscriptionStatus;

type HmacSha256 = Hmac<Sha256>;

/// Signatures older or newer than this many seconds are rejected.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Missing signature header")]
    Missing,
    #[error("Malformed signature header")]
    Malformed,
    #[error("Signature timestamp outside tolerance")]
    Stale,
    #[error("Signature mismatch")]
    Mismatch,
}

fn mac_for(secret: &str, timestamp: i64, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(mac)
}

/// Build a `t=<unix>,v1=<hex>` header for a payload.
#[must_use]
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> Option<String> {
    let tag = mac_for(secret, timestamp, body)?.finalize().into_bytes();
    Some(format!("t={timestamp},v1={}", hex::encode(tag)))
}

/// Verify a `t=<unix>,v1=<hex>[,v1=...]` signature header against the raw
/// body. Any `v1` entry may match.
pub fn verify_signature(
    header: Option<&str>,
    body: &[u8],
    secret: &str,
    now: i64,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for item in header.split(',') {
        match item.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    let mac = mac_for(secret, timestamp, body).ok_or(SignatureError::Mismatch)?;
    let matched = signatures.iter().any(|sig| {
        hex::decode(sig).is_ok_and(|bytes| mac.clone().verify_slice(&bytes).is_ok())
    });
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    CheckoutCompleted {
        user_id: i64,
        customer_id: String,
        subscription_id: Option<String>,
    },
    SubscriptionUpdated {
        customer_id: String,
        subscription_id: String,
        status: SubscriptionStatus,
        current_period_end: Option<String>,
    },
    SubscriptionDeleted {
        customer_id: String,
        subscription_id: String,
    },
    InvoicePaid {
        customer_id: String,
        subscription_id: Option<String>,
    },
    InvoicePaymentFailed {
        customer_id: String,
    },
    Ignored {
        event_type: String,
    },
}

impl BillingEvent {
    /// Status the event moves the subscription to.
    #[must_use]
    pub fn status(&self) -> Option<SubscriptionStatus> {
        match self {
            Self::CheckoutCompleted { .. } | Self::InvoicePaid { .. } => {
                Some(SubscriptionStatus::Active)
            }
            Self::SubscriptionUpdated { status, .. } => Some(*status),
            Self::SubscriptionDeleted { .. } => Some(SubscriptionStatus::Canceled),
            Self::InvoicePaymentFailed { .. } => Some(SubscriptionStatus::PastDue),
            Self::Ignored { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: Value,
}

// Ids arrive either as a plain string or as an expanded object with an `id`.
fn id_field(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(id) => Some(id.clone()),
        Value::Object(expanded) => expanded.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn required_id(object: &Value, key: &str) -> Result<String> {
    id_field(object, key).ok_or_else(|| anyhow!("Event object has no '{key}'"))
}

/// Parse a webhook payload into the event it describes.
pub fn parse_event(body: &[u8]) -> Result<BillingEvent> {
    let raw: RawEvent = serde_json::from_slice(body).context("Invalid webhook payload")?;
    let object = &raw.data.object;

    let event = match raw.event_type.as_str() {
        "checkout.session.completed" => {
            let user_id = object
                .get("client_reference_id")
                .and_then(Value::as_str)
                .and_then(|id| id.parse::<i64>().ok())
                .context("Checkout session has no usable client_reference_id")?;
            BillingEvent::CheckoutCompleted {
                user_id,
                customer_id: required_id(object, "customer")?,
                subscription_id: id_field(object, "subscription"),
            }
        }
        "customer.subscription.updated" => {
            let status = object
                .get("status")
                .and_then(Value::as_str)
                .context("Subscription has no status")?;
            BillingEvent::SubscriptionUpdated {
                customer_id: required_id(object, "customer")?,
                subscription_id: required_id(object, "id")?,
                status: SubscriptionStatus::parse(status)?,
                current_period_end: object
                    .get("current_period_end")
                    .and_then(Value::as_i64)
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            }
        }
        "customer.subscription.deleted" => BillingEvent::SubscriptionDeleted {
            customer_id: required_id(object, "customer")?,
            subscription_id: required_id(object, "id")?,
        },
        "invoice.paid" => BillingEvent::InvoicePaid {
            customer_id: required_id(object, "customer")?,
            subscription_id: id_field(object, "subscription"),
        },
        "invoice.payment_failed" => BillingEvent::InvoicePaymentFailed {
            customer_id: required_id(object, "customer")?,
        },
        other => BillingEvent::Ignored {
            event_type: other.to_string(),
        },
    };
    Ok(event)
}
