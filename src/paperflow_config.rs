//! Layered configuration for paperflow.
//!
//! Settings are read from `.paperflow/paperflow.toml` (or an explicit
//! `--config` path), then overridden by environment variables, then by CLI
//! flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [worker]
//! base_url = "http://127.0.0.1:8000"
//! # ws_base_url = "ws://127.0.0.1:8000"
//! request_timeout_secs = 600
//! connect_timeout_secs = 10
//!
//! [pipeline]
//! settle_delay_ms = 500
//! log_capacity = 100
//! progress_capacity = 50
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! # dir = ".paperflow/logs"
//! ```
//!
//! # Environment
//!
//! | Variable              | Overrides              |
//! |-----------------------|------------------------|
//! | `PAPERFLOW_BASE_URL`  | `worker.base_url`      |
//! | `PAPERFLOW_WS_URL`    | `worker.ws_base_url`   |
//! | `PAPERFLOW_LOG_LEVEL` | `logging.level`        |

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::ws_base_from_http;
use crate::orchestrator::PipelineSettings;

pub const CONFIG_DIR: &str = ".paperflow";
pub const CONFIG_FILE: &str = "paperflow.toml";

pub const ENV_BASE_URL: &str = "PAPERFLOW_BASE_URL";
pub const ENV_WS_URL: &str = "PAPERFLOW_WS_URL";
pub const ENV_LOG_LEVEL: &str = "PAPERFLOW_LOG_LEVEL";

/// Written by `paperflow config init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# paperflow configuration

[worker]
# Base URL of the analysis worker's HTTP API
base_url = "http://127.0.0.1:8000"
# Progress channel base; derived from base_url (http -> ws) when unset
# ws_base_url = "ws://127.0.0.1:8000"
request_timeout_secs = 600
connect_timeout_secs = 10

[pipeline]
# Pause between opening the progress channel and submitting the request
settle_delay_ms = 500
log_capacity = 100
progress_capacity = 50

[logging]
level = "info"
# "pretty" or "json"
format = "pretty"
# dir = ".paperflow/logs"
"#;

/// Console log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Remote worker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Explicit progress channel base (`ws://` or `wss://`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_base_url: Option<String>,
    /// Upper bound for a single stage request; analysis can take minutes
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_log_capacity() -> usize {
    crate::orchestrator::state::DEFAULT_LOG_CAPACITY
}

fn default_progress_capacity() -> usize {
    crate::orchestrator::state::DEFAULT_PROGRESS_CAPACITY
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            log_capacity: default_log_capacity(),
            progress_capacity: default_progress_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for JSON log files; no file logging when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// The complete paperflow.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperflowToml {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PaperflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse paperflow.toml")
    }

    /// Load `paperflow.toml` from `config_dir`, or defaults when it is absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize paperflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Worker base URL (env → file).
    pub fn base_url(&self) -> String {
        non_empty_env(ENV_BASE_URL).unwrap_or_else(|| self.worker.base_url.clone())
    }

    /// Explicit progress channel base (env → file), if any.
    pub fn ws_base_url(&self) -> Option<String> {
        non_empty_env(ENV_WS_URL).or_else(|| self.worker.ws_base_url.clone())
    }

    /// Log level (env → file).
    pub fn log_level(&self) -> String {
        non_empty_env(ENV_LOG_LEVEL).unwrap_or_else(|| self.logging.level.clone())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let base_url = self.base_url();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            warnings.push(format!(
                "Invalid worker base_url '{}': must start with http:// or https://",
                base_url
            ));
        }
        if let Some(ws) = self.ws_base_url()
            && !(ws.starts_with("ws://") || ws.starts_with("wss://"))
        {
            warnings.push(format!(
                "Invalid worker ws_base_url '{}': must start with ws:// or wss://",
                ws
            ));
        }

        if self.worker.request_timeout_secs == 0 {
            warnings.push("worker.request_timeout_secs is 0: every request will time out".into());
        }
        if self.worker.connect_timeout_secs == 0 {
            warnings.push(
                "worker.connect_timeout_secs is 0: progress channels will never connect".into(),
            );
        }
        if self.pipeline.log_capacity == 0 {
            warnings.push("pipeline.log_capacity is 0: no log history will be kept".into());
        }
        if self.pipeline.progress_capacity == 0 {
            warnings
                .push("pipeline.progress_capacity is 0: no progress history will be kept".into());
        }

        let level = self.log_level();
        if tracing_subscriber::EnvFilter::try_new(&level).is_err() {
            warnings.push(format!("Invalid logging level '{}'", level));
        }

        warnings
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Resolved configuration for one invocation.
///
/// Merges, in increasing precedence:
/// 1. paperflow.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct PaperflowConfig {
    pub project_dir: PathBuf,
    /// Path to the .paperflow directory
    pub config_dir: PathBuf,
    /// File the configuration was read from (may not exist)
    pub config_path: PathBuf,
    pub toml: PaperflowToml,
    pub verbose: bool,
    /// CLI override for the worker base URL
    pub cli_base_url: Option<String>,
}

impl PaperflowConfig {
    /// Load configuration for a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_cli_args(project_dir, None, false, None)
    }

    /// Load configuration with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        config_path: Option<PathBuf>,
        verbose: bool,
        base_url: Option<String>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);

        let (config_path, toml) = match config_path {
            Some(path) => {
                let toml = PaperflowToml::load(&path)?;
                (path, toml)
            }
            None => (
                config_dir.join(CONFIG_FILE),
                PaperflowToml::load_or_default(&config_dir)?,
            ),
        };

        Ok(Self {
            project_dir,
            config_dir,
            config_path,
            toml,
            verbose,
            cli_base_url: base_url,
        })
    }

    /// Worker base URL (CLI → env → file), without a trailing slash.
    pub fn base_url(&self) -> String {
        self.cli_base_url
            .clone()
            .unwrap_or_else(|| self.toml.base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Progress channel base: explicit setting, else derived from the base URL.
    pub fn ws_base_url(&self) -> Result<String> {
        if self.cli_base_url.is_none()
            && let Some(ws) = self.toml.ws_base_url()
        {
            return Ok(ws.trim_end_matches('/').to_string());
        }
        let base_url = self.base_url();
        ws_base_from_http(&base_url)
            .with_context(|| format!("Invalid worker base URL '{}'", base_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.worker.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.worker.connect_timeout_secs)
    }

    /// Logging settings with env overrides applied and the log directory
    /// resolved against the project directory.
    pub fn logging(&self) -> LoggingSection {
        let mut logging = self.toml.logging.clone();
        logging.level = self.toml.log_level();
        logging.dir = logging.dir.map(|dir| {
            if dir.is_absolute() {
                dir
            } else {
                self.project_dir.join(dir)
            }
        });
        logging
    }

    /// Orchestrator settings derived from the `[worker]` and `[pipeline]` sections.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            ws_base: self.ws_base_url()?,
            settle_delay: Duration::from_millis(self.toml.pipeline.settle_delay_ms),
            connect_timeout: self.connect_timeout(),
            log_capacity: self.toml.pipeline.log_capacity,
            progress_capacity: self.toml.pipeline.progress_capacity,
        })
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if let Some(url) = &self.cli_base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            warnings.push(format!(
                "Invalid --base-url '{}': must start with http:// or https://",
                url
            ));
        }
        warnings
    }
}
