use tracing::{info, instrument};

use brigade_core::import::{
    DocumentKind, ImportError, SYSTEM_PROMPT, UploadedFile, decode_text, parse_completion,
    prepare_text, user_prompt,
};
use brigade_core::models::RecipeForm;

use crate::completion::CompletionClient;
use crate::config::ServicesConfig;
use crate::extraction::ExtractionClient;
use crate::upstream::UpstreamError;

#[derive(Debug, thiserror::Error)]
pub enum ImportFailure {
    #[error(transparent)]
    Document(#[from] ImportError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Turns an uploaded document into a draft recipe form.
pub struct Importer {
    completion: CompletionClient,
    extraction: Option<ExtractionClient>,
}

impl Importer {
    pub fn new(services: &ServicesConfig) -> anyhow::Result<Self> {
        let extraction = services
            .extraction
            .as_ref()
            .map(ExtractionClient::new)
            .transpose()?;
        Ok(Self {
            completion: CompletionClient::new(&services.ai)?,
            extraction,
        })
    }

    async fn document_text(&self, kind: DocumentKind, data: Vec<u8>) -> Result<String, ImportFailure> {
        if !kind.needs_extraction() {
            return Ok(decode_text(&data));
        }
        let extraction = self
            .extraction
            .as_ref()
            .ok_or(UpstreamError::NotConfigured("Text extraction"))?;
        Ok(extraction.extract(kind, data).await?)
    }

    #[instrument(skip_all, fields(filename = %file.filename, bytes = file.data.len()))]
    pub async fn import(&self, file: UploadedFile) -> Result<RecipeForm, ImportFailure> {
        let kind = DocumentKind::detect(&file.filename, file.content_type.as_deref())?;
        let raw = self.document_text(kind, file.data).await?;
        let text = prepare_text(&raw)?;

        let content = self
            .completion
            .complete_json(SYSTEM_PROMPT, &user_prompt(&text))
            .await?;
        let form = parse_completion(&content)?.into_form();
        info!(
            title = %form.title,
            sections = form.sections.len(),
            "document imported"
        );
        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::tests::{mock_completion_router, spawn_mock};
    use crate::config::AiConfig;

    const RECIPE_JSON: &str = r#"```json
{"title":"Tarte fine","servings":"6 parts","sections":[
  {"title":"Pâte","ingredients":[{"quantity":250,"unit":"g","designation":"farine"}],"instructions":["Mélanger","Reposer"]},
  {"title":"Garniture","ingredients":[{"quantity":"3","unit":"","designation":"pommes"}],"instructions":"Trancher"}
],"general_instructions":"Cuire 30 min"}
```"#;

    fn services(base_url: String) -> ServicesConfig {
        ServicesConfig {
            ai: AiConfig {
                base_url,
                api_key: Some("sk-test".to_string()),
                model: "test-model".to_string(),
            },
            ..ServicesConfig::default()
        }
    }

    fn upload(filename: &str, data: &[u8]) -> UploadedFile {
        UploadedFile {
            filename: filename.to_string(),
            content_type: None,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_import_text_document() {
        let url = spawn_mock(mock_completion_router(RECIPE_JSON)).await;
        let importer = Importer::new(&services(url)).unwrap();

        let form = importer
            .import(upload("tarte.txt", "Tarte fine aux pommes".as_bytes()))
            .await
            .unwrap();
        assert_eq!(form.title, "Tarte fine");
        assert_eq!(form.servings, 6);
        assert_eq!(form.notes, "Cuire 30 min");
        assert_eq!(form.sections.len(), 2);
        assert_eq!(form.sections[0].instructions, "Mélanger\nReposer");
        assert_eq!(form.sections[1].ingredients[0].quantity, Some(3.0));
    }

    #[tokio::test]
    async fn test_unsupported_type_rejected_before_network() {
        let importer = Importer::new(&services("http://127.0.0.1:9".to_string())).unwrap();
        let err = importer
            .import(upload("photo.png", b"\x89PNG"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportFailure::Document(ImportError::UnsupportedType(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_text_rejected() {
        let importer = Importer::new(&services("http://127.0.0.1:9".to_string())).unwrap();
        let err = importer.import(upload("empty.txt", b"  \n ")).await.unwrap_err();
        assert!(matches!(err, ImportFailure::Document(ImportError::EmptyText)));
    }

    #[tokio::test]
    async fn test_pdf_without_extraction_is_not_configured() {
        let importer = Importer::new(&services("http://127.0.0.1:9".to_string())).unwrap();
        let err = importer.import(upload("menu.pdf", b"%PDF")).await.unwrap_err();
        assert!(matches!(
            err,
            ImportFailure::Upstream(UpstreamError::NotConfigured(_))
        ));
    }
}
