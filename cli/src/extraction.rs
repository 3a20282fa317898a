//! Client for the remote text-extraction function used for `.docx`, `.doc` and `.pdf` uploads.

use serde::Deserialize;
use tracing::{debug, instrument};

use brigade_core::import::DocumentKind;

use crate::config::ExtractionConfig;
use crate::upstream::{UpstreamError, http_client, send_json};

const SERVICE: &str = "Text extraction";

#[derive(Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    text: String,
}

pub struct ExtractionClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl ExtractionClient {
    pub fn new(config: &ExtractionConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Send the raw document and return the text the function found in it.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn extract(
        &self,
        kind: DocumentKind,
        data: Vec<u8>,
    ) -> Result<String, UpstreamError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, kind.mime())
            .body(data);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response: ExtractionResponse = send_json(SERVICE, request).await?;
        debug!(chars = response.text.len(), "text extracted");
        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::tests::spawn_mock;
    use axum::{Json, Router, body::Bytes, http::HeaderMap, routing::post};
    use serde_json::json;

    #[tokio::test]
    async fn test_extract_posts_raw_bytes_with_mime() {
        let router = Router::new().route(
            "/extract",
            post(|headers: HeaderMap, body: Bytes| async move {
                assert_eq!(headers.get("content-type").unwrap(), "application/pdf");
                assert_eq!(headers.get("authorization").unwrap(), "Bearer ext-key");
                assert_eq!(&body[..], b"%PDF-1.4");
                Json(json!({ "text": "Pâte brisée\n250 g farine" }))
            }),
        );
        let base = spawn_mock(router).await;
        let client = ExtractionClient::new(&ExtractionConfig {
            url: format!("{base}/extract"),
            api_key: Some("ext-key".to_string()),
        })
        .unwrap();

        let text = client
            .extract(DocumentKind::Pdf, b"%PDF-1.4".to_vec())
            .await
            .unwrap();
        assert_eq!(text, "Pâte brisée\n250 g farine");
    }
}
