use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("json") => Self::Json,
            Some("pretty") => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    /// `RUST_LOG` (default `info`) and `BRIGADE_LOG_FORMAT` (`json`, `pretty`, `compact`).
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            format: LogFormat::parse(std::env::var("BRIGADE_LOG_FORMAT").ok().as_deref()),
        }
    }

    fn filter(&self) -> EnvFilter {
        let filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        ["hyper=warn", "reqwest=warn", "rustls=warn"]
            .into_iter()
            .filter_map(|directive| directive.parse().ok())
            .fold(filter, EnvFilter::add_directive)
    }

    /// Install the global subscriber. Logs go to stderr so `--json` output stays clean.
    pub fn init(&self) -> Result<()> {
        let registry = tracing_subscriber::registry().with(self.filter());
        let layer = fmt::layer().with_writer(std::io::stderr);
        let result = match self.format {
            LogFormat::Json => registry.with(layer.json().with_target(true)).try_init(),
            LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
            LogFormat::Compact => registry.with(layer.compact().with_target(false)).try_init(),
        };
        result.map_err(|e| anyhow!("Failed to initialise logging: {e}"))
    }
}
