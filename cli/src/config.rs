use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PAYMENTS_API_URL: &str = "https://api.stripe.com/v1";
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub services: ServicesConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "brigade").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = std::env::var_os("BRIGADE_DB")
            .map_or_else(|| data_dir.join("brigade.db"), PathBuf::from);

        Ok(Config {
            db_path,
            data_dir,
            services: ServicesConfig::from_env(),
        })
    }
}

/// Remote collaborators: AI completion, text extraction, payments.
#[derive(Debug, Clone, Default)]
pub struct ServicesConfig {
    pub ai: AiConfig,
    pub extraction: Option<ExtractionConfig>,
    pub payments: PaymentsConfig,
    pub public_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct AiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentsConfig {
    pub api_url: String,
    pub secret_key: Option<String>,
    pub price_id: Option<String>,
    pub webhook_secret: Option<String>,
}

impl ServicesConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let or_default = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        Self {
            ai: AiConfig {
                base_url: or_default("BRIGADE_AI_BASE_URL", DEFAULT_AI_BASE_URL),
                api_key: get("BRIGADE_AI_API_KEY"),
                model: or_default("BRIGADE_AI_MODEL", DEFAULT_AI_MODEL),
            },
            extraction: get("BRIGADE_EXTRACT_URL").map(|url| ExtractionConfig {
                url,
                api_key: get("BRIGADE_EXTRACT_API_KEY"),
            }),
            payments: PaymentsConfig {
                api_url: or_default("BRIGADE_PAYMENTS_API_URL", DEFAULT_PAYMENTS_API_URL),
                secret_key: get("BRIGADE_PAYMENTS_SECRET_KEY"),
                price_id: get("BRIGADE_PAYMENTS_PRICE_ID"),
                webhook_secret: get("BRIGADE_PAYMENTS_WEBHOOK_SECRET"),
            },
            public_url: or_default("BRIGADE_PUBLIC_URL", DEFAULT_PUBLIC_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }
}
