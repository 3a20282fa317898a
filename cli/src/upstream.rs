use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

const REQUEST_TIMEOUT_SECS: u64 = 120;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Failure talking to a remote collaborator (AI completion, extraction, payments).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("{service} request failed: {message}")]
    Failed {
        service: &'static str,
        message: String,
    },
}

impl UpstreamError {
    pub fn failed(service: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            service,
            message: message.into(),
        }
    }
}

pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("brigade/{}", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .context("Failed to build HTTP client")
}

/// Send a request and decode a JSON success body. Non-2xx responses become
/// [`UpstreamError::Failed`] carrying the remote `error.message` when there is one.
pub async fn send_json<T: DeserializeOwned>(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T, UpstreamError> {
    let response = request
        .send()
        .await
        .map_err(|e| UpstreamError::failed(service, e.to_string()))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| UpstreamError::failed(service, format!("failed to read response: {e}")))?;

    if !status.is_success() {
        let detail = error_message(&body).unwrap_or_else(|| status.to_string());
        warn!(service, %status, "upstream returned an error");
        return Err(UpstreamError::failed(service, detail));
    }

    serde_json::from_str(&body)
        .map_err(|e| UpstreamError::failed(service, format!("unexpected response: {e}")))
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(detail) => detail.get("message")?.as_str().map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(
            error_message(r#"{"error":{"message":"No such price","type":"invalid_request_error"}}"#)
                .as_deref(),
            Some("No such price")
        );
        assert_eq!(error_message(r#"{"error":"boom"}"#).as_deref(), Some("boom"));
        assert_eq!(error_message("<html>bad gateway</html>"), None);
    }
}
