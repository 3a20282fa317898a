//! Payment processor API: subscription checkout and billing-portal sessions.

use serde::Deserialize;
use tracing::{info, instrument};

use crate::config::PaymentsConfig;
use crate::upstream::{UpstreamError, http_client, send_json};

const SERVICE: &str = "Payments";

#[derive(Deserialize)]
struct SessionResponse {
    url: Option<String>,
}

/// Who is checking out, and where to send them afterwards.
#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    pub user_id: i64,
    pub email: &'a str,
    pub customer_id: Option<&'a str>,
    pub success_url: String,
    pub cancel_url: String,
}

pub struct PaymentsClient {
    client: reqwest::Client,
    api_url: String,
    secret_key: Option<String>,
    price_id: Option<String>,
}

impl PaymentsClient {
    pub fn new(config: &PaymentsConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            price_id: config.price_id.clone(),
        })
    }

    fn secret_key(&self) -> Result<&str, UpstreamError> {
        self.secret_key
            .as_deref()
            .ok_or(UpstreamError::NotConfigured(SERVICE))
    }

    async fn create_session(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<String, UpstreamError> {
        let request = self
            .client
            .post(format!("{}/{path}", self.api_url))
            .bearer_auth(self.secret_key()?)
            .form(form);
        let session: SessionResponse = send_json(SERVICE, request).await?;
        session
            .url
            .ok_or_else(|| UpstreamError::failed(SERVICE, "session has no url"))
    }

    /// Create a subscription-mode checkout session and return its URL.
    #[instrument(skip_all, fields(user_id = checkout.user_id))]
    pub async fn create_checkout(&self, checkout: &CheckoutRequest<'_>) -> Result<String, UpstreamError> {
        let price_id = self
            .price_id
            .as_deref()
            .ok_or(UpstreamError::NotConfigured("Payments price"))?;

        let mut form = vec![
            ("mode", "subscription".to_string()),
            ("line_items[0][price]", price_id.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("client_reference_id", checkout.user_id.to_string()),
            ("success_url", checkout.success_url.clone()),
            ("cancel_url", checkout.cancel_url.clone()),
        ];
        match checkout.customer_id {
            Some(customer) => form.push(("customer", customer.to_string())),
            None => form.push(("customer_email", checkout.email.to_string())),
        }

        let url = self.create_session("checkout/sessions", &form).await?;
        info!("checkout session created");
        Ok(url)
    }

    /// Create a billing-portal session for an existing customer and return its URL.
    #[instrument(skip(self, return_url))]
    pub async fn create_portal(&self, customer_id: &str, return_url: String) -> Result<String, UpstreamError> {
        let form = [
            ("customer", customer_id.to_string()),
            ("return_url", return_url),
        ];
        self.create_session("billing_portal/sessions", &form).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::tests::spawn_mock;
    use axum::{Form, Json, Router, http::HeaderMap, routing::post};
    use serde_json::json;
    use std::collections::HashMap;

    fn config(api_url: String) -> PaymentsConfig {
        PaymentsConfig {
            api_url,
            secret_key: Some("sk_test_1".to_string()),
            price_id: Some("price_1".to_string()),
            webhook_secret: None,
        }
    }

    #[tokio::test]
    async fn test_checkout_sends_form_and_returns_url() {
        let router = Router::new().route(
            "/checkout/sessions",
            post(
                |headers: HeaderMap, Form(form): Form<HashMap<String, String>>| async move {
                    assert_eq!(headers.get("authorization").unwrap(), "Bearer sk_test_1");
                    assert_eq!(form["mode"], "subscription");
                    assert_eq!(form["line_items[0][price]"], "price_1");
                    assert_eq!(form["client_reference_id"], "42");
                    assert_eq!(form["customer_email"], "chef@example.com");
                    assert!(!form.contains_key("customer"));
                    Json(json!({ "id": "cs_1", "url": "https://pay.example/cs_1" }))
                },
            ),
        );
        let url = spawn_mock(router).await;
        let client = PaymentsClient::new(&config(url)).unwrap();

        let checkout = CheckoutRequest {
            user_id: 42,
            email: "chef@example.com",
            customer_id: None,
            success_url: "http://localhost:8080/billing/success".to_string(),
            cancel_url: "http://localhost:8080/billing/cancel".to_string(),
        };
        let session_url = client.create_checkout(&checkout).await.unwrap();
        assert_eq!(session_url, "https://pay.example/cs_1");
    }

    #[tokio::test]
    async fn test_portal_uses_customer() {
        let router = Router::new().route(
            "/billing_portal/sessions",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["customer"], "cus_9");
                Json(json!({ "url": "https://pay.example/portal" }))
            }),
        );
        let url = spawn_mock(router).await;
        let client = PaymentsClient::new(&config(url)).unwrap();
        let portal = client
            .create_portal("cus_9", "http://localhost:8080".to_string())
            .await
            .unwrap();
        assert_eq!(portal, "https://pay.example/portal");
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_configured() {
        let mut cfg = config("http://127.0.0.1:9".to_string());
        cfg.secret_key = None;
        let client = PaymentsClient::new(&cfg).unwrap();
        let err = client
            .create_portal("cus_1", String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::NotConfigured(_)));
    }
}
