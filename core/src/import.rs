//! Document import: multipart upload parsing, document kind detection, and
//! conversion of the AI completion response into an editable recipe form.
//!
//! Network calls (text extraction, AI completion) live in the CLI crate; this
//! module only handles the bytes and JSON on either side of them.

use serde::{Deserialize, Deserializer};

use crate::models::{
    DEFAULT_IMPORT_TITLE, FormIngredient, FormSection, RecipeForm, parse_quantity, parse_servings,
};

/// Text sent to the completion API is cut to this many characters.
pub const MAX_TEXT_CHARS: usize = 30_000;

pub const SYSTEM_PROMPT: &str = "You extract recipes from restaurant documents. \
Reply with a single JSON object and nothing else, using this shape: \
{\"title\": string, \"servings\": number, \"sections\": [{\"title\": string, \
\"ingredients\": [{\"quantity\": number or null, \"unit\": string, \"designation\": string}], \
\"instructions\": string}], \"general_instructions\": string or null}. \
Group ingredients and steps into the sections the document uses (for example dough, filling, sauce); \
use a single section when it has none. Keep the document's language. \
Put quantities as numbers without units, and use an empty unit when there is none.";

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Request is not multipart/form-data with a boundary")]
    MissingBoundary,
    #[error("No 'file' part in upload")]
    MissingFile,
    #[error("Unsupported document type '{0}'. Supported: .txt, .docx, .doc, .pdf")]
    UnsupportedType(String),
    #[error("No text could be extracted from the document")]
    EmptyText,
    #[error("AI response is not a usable recipe: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Txt,
    Docx,
    Doc,
    Pdf,
}

impl DocumentKind {
    /// Detect from the file extension, falling back to the declared MIME type.
    pub fn detect(filename: &str, content_type: Option<&str>) -> Result<Self, ImportError> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase());
        let by_extension = match extension.as_deref() {
            Some("txt") => Some(Self::Txt),
            Some("docx") => Some(Self::Docx),
            Some("doc") => Some(Self::Doc),
            Some("pdf") => Some(Self::Pdf),
            _ => None,
        };
        if let Some(kind) = by_extension {
            return Ok(kind);
        }
        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match mime.as_str() {
            "text/plain" => Ok(Self::Txt),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Ok(Self::Docx)
            }
            "application/msword" => Ok(Self::Doc),
            "application/pdf" => Ok(Self::Pdf),
            _ => {
                let shown = match extension {
                    Some(ext) => ext,
                    None if mime.is_empty() => filename.to_string(),
                    None => mime.clone(),
                };
                Err(ImportError::UnsupportedType(shown))
            }
        }
    }

    #[must_use]
    pub fn mime(self) -> &'static str {
        match self {
            Self::Txt => "text/plain",
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Self::Doc => "application/msword",
            Self::Pdf => "application/pdf",
        }
    }

    /// Plain text is decoded locally; everything else goes to the extractor.
    #[must_use]
    pub fn needs_extraction(self) -> bool {
        !matches!(self, Self::Txt)
    }
}

// --- Multipart ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

fn boundary(content_type: &str) -> Option<String> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|p| p + from)
}

fn header_param(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

impl MultipartPart {
    fn from_headers(headers: &str, data: Vec<u8>) -> Self {
        let mut part = Self {
            name: None,
            filename: None,
            content_type: None,
            data,
        };
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("content-disposition") {
                part.name = header_param(value, "name");
                part.filename = header_param(value, "filename");
            } else if key.eq_ignore_ascii_case("content-type") {
                part.content_type = Some(value.trim().to_string());
            }
        }
        part
    }
}

/// Split a `multipart/form-data` body into its parts.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Result<Vec<MultipartPart>, ImportError> {
    let boundary = boundary(content_type).ok_or(ImportError::MissingBoundary)?;
    let delimiter = format!("--{boundary}").into_bytes();
    let next_delimiter = [b"\r\n".as_slice(), &delimiter].concat();

    let mut parts = Vec::new();
    let Some(mut pos) = find(body, &delimiter, 0) else {
        return Ok(parts);
    };
    loop {
        pos += delimiter.len();
        let rest = body.get(pos..).unwrap_or_default();
        if rest.starts_with(b"--") {
            break;
        }
        let header_start = if rest.starts_with(b"\r\n") { pos + 2 } else { pos };
        let Some(header_end) = find(body, b"\r\n\r\n", pos) else {
            break;
        };
        let content_start = header_end + 4;
        let Some(content_end) = find(body, &next_delimiter, content_start) else {
            break;
        };
        let headers = String::from_utf8_lossy(&body[header_start.min(header_end)..header_end]);
        parts.push(MultipartPart::from_headers(
            &headers,
            body[content_start..content_end].to_vec(),
        ));
        pos = content_end + 2;
    }
    Ok(parts)
}

/// Pull the `file` part out of an upload.
pub fn extract_file(content_type: &str, body: &[u8]) -> Result<UploadedFile, ImportError> {
    let part = parse_multipart(content_type, body)?
        .into_iter()
        .find(|p| p.name.as_deref() == Some("file"))
        .ok_or(ImportError::MissingFile)?;
    Ok(UploadedFile {
        filename: part.filename.unwrap_or_default(),
        content_type: part.content_type,
        data: part.data,
    })
}

// --- Text ---

/// Decode an uploaded `.txt` file. Invalid UTF-8 is replaced, a BOM is dropped.
#[must_use]
pub fn decode_text(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    text.strip_prefix('\u{feff}').unwrap_or(&text).to_string()
}

/// Trim, reject blank text, and cut to [`MAX_TEXT_CHARS`] on a char boundary.
pub fn prepare_text(text: &str) -> Result<String, ImportError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ImportError::EmptyText);
    }
    Ok(match text.char_indices().nth(MAX_TEXT_CHARS) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    })
}

#[must_use]
pub fn user_prompt(text: &str) -> String {
    format!("Extract the recipe from this document:\n\n{text}")
}

// --- Completion response ---

#[derive(Debug, Clone, Deserialize)]
pub struct ImportedRecipe {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_servings")]
    pub servings: Option<i64>,
    #[serde(default)]
    pub sections: Vec<ImportedSection>,
    #[serde(default)]
    pub general_instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportedSection {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<ImportedIngredient>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub instructions: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportedIngredient {
    #[serde(default, deserialize_with = "lenient_quantity")]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Number(f64),
    Text(String),
    Lines(Vec<String>),
}

fn lenient_quantity<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Number(n)) => Some(n),
        Some(Loose::Text(s)) => parse_quantity(&s),
        _ => None,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn lenient_servings<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Number(n)) => Some(n.round() as i64),
        Some(Loose::Text(s)) => parse_servings(&s),
        _ => None,
    })
}

fn lenient_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Text(s)) => s,
        Some(Loose::Lines(lines)) => lines.join("\n"),
        Some(Loose::Number(n)) => n.to_string(),
        None => String::new(),
    })
}

/// Parse the completion text into a recipe. Markdown code fences and prose
/// around the JSON object are ignored.
pub fn parse_completion(content: &str) -> Result<ImportedRecipe, ImportError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => return Err(ImportError::InvalidResponse("no JSON object found".to_string())),
    };
    let recipe: ImportedRecipe = serde_json::from_str(json)
        .map_err(|e| ImportError::InvalidResponse(e.to_string()))?;
    if recipe.sections.is_empty() {
        return Err(ImportError::InvalidResponse("no sections".to_string()));
    }
    Ok(recipe)
}

impl ImportedRecipe {
    /// Convert to an editable form with fresh local ids.
    #[must_use]
    pub fn into_form(self) -> RecipeForm {
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_IMPORT_TITLE.to_string());
        let sections = self
            .sections
            .into_iter()
            .enumerate()
            .map(|(s, section)| FormSection {
                local_id: format!("import-section-{s}"),
                title: section.title.unwrap_or_default().trim().to_string(),
                instructions: section.instructions.trim().to_string(),
                ingredients: section
                    .ingredients
                    .into_iter()
                    .enumerate()
                    .map(|(i, ingredient)| FormIngredient {
                        local_id: format!("import-ingredient-{s}-{i}"),
                        quantity: ingredient.quantity,
                        unit: ingredient.unit.unwrap_or_default().trim().to_string(),
                        designation: ingredient.designation.unwrap_or_default().trim().to_string(),
                    })
                    .collect(),
            })
            .collect();
        RecipeForm {
            title,
            servings: self.servings.unwrap_or(1).max(1),
            category: String::new(),
            notes: self
                .general_instructions
                .map(|n| n.trim().to_string())
                .unwrap_or_default(),
            sections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CT: &str = "multipart/form-data; boundary=----brigade42";

    fn upload(parts: &[(&str, Option<&str>, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, content_type, data) in parts {
            body.extend_from_slice(b"------brigade42\r\n");
            let mut disposition = format!("Content-Disposition: form-data; name=\"{name}\"");
            if let Some(filename) = filename {
                disposition.push_str(&format!("; filename=\"{filename}\""));
            }
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(b"\r\n");
            if let Some(ct) = content_type {
                body.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
            }
            body.extend_from_slice(b"\r\n");
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"------brigade42--\r\n");
        body
    }

    #[test]
    fn test_parse_multipart_parts() {
        let body = upload(&[
            ("note", None, None, b"hello"),
            ("file", Some("tarte.pdf"), Some("application/pdf"), b"%PDF\r\nbinary\r\n"),
        ]);
        let parts = parse_multipart(CT, &body).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name.as_deref(), Some("note"));
        assert_eq!(parts[0].data, b"hello");
        assert_eq!(parts[1].filename.as_deref(), Some("tarte.pdf"));
        assert_eq!(parts[1].content_type.as_deref(), Some("application/pdf"));
        assert_eq!(parts[1].data, b"%PDF\r\nbinary\r\n");
    }

    #[test]
    fn test_extract_file_quoted_boundary() {
        let body = upload(&[("file", Some("r.txt"), Some("text/plain"), b"Soupe")]);
        let file = extract_file("multipart/form-data; boundary=\"----brigade42\"", &body).unwrap();
        assert_eq!(file.filename, "r.txt");
        assert_eq!(file.data, b"Soupe");
    }

    #[test]
    fn test_extract_file_errors() {
        let body = upload(&[("other", None, None, b"x")]);
        assert!(matches!(extract_file(CT, &body), Err(ImportError::MissingFile)));
        assert!(matches!(
            extract_file("application/json", &body),
            Err(ImportError::MissingBoundary)
        ));
        assert!(matches!(
            extract_file("multipart/form-data", &body),
            Err(ImportError::MissingBoundary)
        ));
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(DocumentKind::detect("Tarte.PDF", None).unwrap(), DocumentKind::Pdf);
        assert_eq!(DocumentKind::detect("a.docx", None).unwrap(), DocumentKind::Docx);
        assert_eq!(DocumentKind::detect("a.doc", None).unwrap(), DocumentKind::Doc);
        assert_eq!(
            DocumentKind::detect("upload", Some("text/plain; charset=utf-8")).unwrap(),
            DocumentKind::Txt
        );
        assert!(matches!(
            DocumentKind::detect("photo.png", Some("image/png")),
            Err(ImportError::UnsupportedType(t)) if t == "png"
        ));
        assert!(!DocumentKind::Txt.needs_extraction());
        assert!(DocumentKind::Pdf.needs_extraction());
    }

    #[test]
    fn test_prepare_text_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_TEXT_CHARS + 10);
        let prepared = prepare_text(&long).unwrap();
        assert_eq!(prepared.chars().count(), MAX_TEXT_CHARS);
        assert!(matches!(prepare_text("  \n "), Err(ImportError::EmptyText)));
        assert_eq!(prepare_text(" court ").unwrap(), "court");
    }

    #[test]
    fn test_decode_text_strips_bom() {
        assert_eq!(decode_text("\u{feff}Soupe".as_bytes()), "Soupe");
        assert_eq!(decode_text(&[0x53, 0xff]), "S\u{fffd}");
    }

    #[test]
    fn test_parse_completion_with_fences() {
        let content = "```json\n{\"title\": \"Tarte\", \"servings\": \"6 parts\", \"sections\": [\
            {\"title\": \"Pâte\", \"ingredients\": [{\"quantity\": \"200\", \"unit\": \"g\", \"designation\": \"farine\"}], \
            \"instructions\": [\"Mélanger\", \"Reposer\"]}], \"general_instructions\": \"Servir tiède\"}\n```";
        let recipe = parse_completion(content).unwrap();
        assert_eq!(recipe.servings, Some(6));
        let form = recipe.into_form();
        assert_eq!(form.title, "Tarte");
        assert_eq!(form.notes, "Servir tiède");
        assert_eq!(form.sections[0].instructions, "Mélanger\nReposer");
        assert_eq!(form.sections[0].ingredients[0].quantity, Some(200.0));
    }

    #[test]
    fn test_parse_completion_requires_sections() {
        assert!(matches!(
            parse_completion("{\"title\": \"Vide\", \"sections\": []}"),
            Err(ImportError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_completion("no json here"),
            Err(ImportError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_negative_servings_clamp_to_one() {
        let recipe = parse_completion(
            "{\"title\": \"Soupe\", \"servings\": \"-3\", \"sections\": [{\"ingredients\": []}]}",
        )
        .unwrap();
        assert_eq!(recipe.servings, Some(-3));
        assert_eq!(recipe.into_form().servings, 1);
    }

    #[test]
    fn test_into_form_defaults() {
        let recipe = parse_completion(
            "{\"sections\": [{\"ingredients\": [{\"quantity\": null, \"designation\": \"sel\"}]}]}",
        )
        .unwrap();
        let form = recipe.into_form();
        assert_eq!(form.title, DEFAULT_IMPORT_TITLE);
        assert_eq!(form.servings, 1);
        assert_eq!(form.notes, "");
        assert_eq!(form.sections[0].ingredients[0].unit, "");
        assert_eq!(form.sections[0].ingredients[0].designation, "sel");
    }
}
