use crate::domain::{AttributeKind, GenerationKind, TraitDefaults};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub general: GeneralConfig,

    pub store: StoreConfig,

    pub generator: GeneratorConfig,

    pub materializer: MaterializerConfig,

    pub job: JobConfig,

    pub traits: TraitDefaults,

    pub scheduler: SchedulerConfig,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,

    /// Emit logs as JSON lines instead of the human-readable format.
    pub json_logs: bool,

    #[serde(default)]
    pub suppress_connection_errors: bool,

    /// Number of tokio worker threads (default: 2)
    /// Set to 0 to use the number of CPU cores
    pub worker_threads: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            suppress_connection_errors: false,
            worker_threads: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub api_url: String,

    pub table: String,

    /// Records per list request (Airtable caps this at 100)
    pub page_size: usize,

    /// Pause between consecutive page fetches
    pub page_delay_ms: u64,

    pub request_timeout_seconds: u64,

    pub fields: StoreFieldsConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.airtable.com/v0".to_string(),
            table: "Characters".to_string(),
            page_size: 100,
            page_delay_ms: 200,
            request_timeout_seconds: 30,
            fields: StoreFieldsConfig::default(),
        }
    }
}

/// Column names of the companion table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreFieldsConfig {
    pub name: String,
    pub slug: String,
    pub avatar: String,
    pub description: String,
    pub greeting: String,
    pub style: String,
    pub sex: String,
    pub ethnicity: String,
    pub hair_length: String,
    pub hair_color: String,
    pub content_filter: String,
    pub visibility: String,
    pub created_by: String,
    pub created_time: String,
}

impl Default for StoreFieldsConfig {
    fn default() -> Self {
        Self {
            name: "Name".to_string(),
            slug: "Slug".to_string(),
            avatar: "Avatar_URL".to_string(),
            description: "Character_Description".to_string(),
            greeting: "Greetings".to_string(),
            style: "companion_type".to_string(),
            sex: "sex".to_string(),
            ethnicity: "ethnicity".to_string(),
            hair_length: "hair_length".to_string(),
            hair_color: "hair_color".to_string(),
            content_filter: "content_filter".to_string(),
            visibility: "Visibility".to_string(),
            created_by: "Created_by".to_string(),
            created_time: "Created_Time".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub image: ImageGeneratorConfig,

    pub text: TextGeneratorConfig,

    /// Lowercase substrings that mark a provider error as a content-policy rejection
    pub policy_markers: Vec<String>,

    pub request_timeout_seconds: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            image: ImageGeneratorConfig::default(),
            text: TextGeneratorConfig::default(),
            policy_markers: vec![
                "nsfw".to_string(),
                "safety".to_string(),
                "content policy".to_string(),
                "flagged".to_string(),
                "sensitive".to_string(),
            ],
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGeneratorConfig {
    pub api_url: String,

    /// Model version hash submitted with every prediction
    pub model_version: String,

    pub width: u32,

    pub height: u32,

    pub num_inference_steps: u32,

    pub negative_prompt: String,

    /// Ask the provider to hold the submit request open until the prediction finishes
    pub prefer_wait: bool,

    pub poll_interval_ms: u64,

    /// Wall-clock budget for one prediction, submit to terminal status
    pub timeout_seconds: u64,
}

impl Default for ImageGeneratorConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.replicate.com/v1".to_string(),
            model_version: "5599ed30703defd1d160a25a63321b4dec97101d98b4674bcc56e41f62f35637"
                .to_string(),
            width: 768,
            height: 768,
            num_inference_steps: 4,
            negative_prompt:
                "low quality, blurry, distorted, deformed, bad anatomy, text, watermark"
                    .to_string(),
            prefer_wait: false,
            poll_interval_ms: 1000,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextGeneratorConfig {
    pub api_url: String,

    pub model: String,

    pub temperature: f32,

    pub max_tokens: u32,

    /// Sent as `HTTP-Referer` for provider attribution
    pub referer: Option<String>,
}

impl Default for TextGeneratorConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            temperature: 0.8,
            max_tokens: 250,
            referer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializerConfig {
    /// Directory artifacts are written to; `ARTIFACT_DIR` overrides it
    pub output_dir: Option<String>,

    /// Public URL prefix under which `output_dir` is served
    pub public_base_url: String,

    pub default_extension: String,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            public_base_url: "http://localhost:8888/avatars".to_string(),
            default_extension: "webp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Maximum entities processed per invocation
    pub max_per_run: usize,

    /// Entities per batch; a breather pause follows each full batch
    pub batch_size: usize,

    pub breather_seconds: u64,

    /// Minimum gap between consecutive generator calls
    pub min_request_interval_ms: u64,

    pub max_rate_limit_retries: u32,

    pub backoff_base_ms: u64,

    pub backoff_max_ms: u64,

    pub max_store_retries: u32,

    pub store_retry_delay_ms: u64,

    /// Re-read the record right before patching and skip it if someone else filled it
    pub recheck_before_patch: bool,

    /// Entities processed by `--test`
    pub test_subset: usize,

    /// Regexes marking an attribute value as stale and due for regeneration
    pub refresh_signatures: Vec<String>,

    pub only_sex: Option<String>,

    pub created_by: Option<String>,

    pub public_only: bool,

    /// Process the most recently created records first
    pub newest_first: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_per_run: 25,
            batch_size: 5,
            breather_seconds: 5,
            min_request_interval_ms: 4000,
            max_rate_limit_retries: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
            max_store_retries: 3,
            store_retry_delay_ms: 1000,
            recheck_before_patch: true,
            test_subset: 3,
            refresh_signatures: vec![
                r"replicate\.delivery".to_string(),
                r"placeholder\.(webp|png|jpe?g)".to_string(),
                r"ui-avatars\.com".to_string(),
            ],
            only_sex: None,
            created_by: None,
            public_only: false,
            newest_first: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,

    pub interval_minutes: u32,

    pub cron_expression: Option<String>,

    pub attributes: Vec<AttributeKind>,

    /// Entity cap for each scheduled run
    pub max_per_run: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 30,
            cron_expression: None,
            attributes: vec![AttributeKind::Avatar],
            max_per_run: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,

    pub metrics_port: Option<u16>,

    pub loki_enabled: bool,

    pub loki_url: String,

    pub loki_labels: std::collections::HashMap<String, String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        let mut labels = std::collections::HashMap::new();
        labels.insert("app".to_string(), "companion-enricher".to_string());

        Self {
            metrics_enabled: false,
            metrics_port: None,
            loki_enabled: false,
            loki_url: "http://localhost:3100".to_string(),
            loki_labels: labels,
        }
    }
}

impl Config {
    /// Loads `explicit` if given, otherwise the first config file found on the search path.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }

        for path in &Self::config_paths() {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Config saved to: {}", path.display());
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("companion-enricher").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".companion-enricher").join("config.toml"));
        }

        paths
    }

    #[must_use]
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("config.toml")
    }

    pub fn create_default_if_missing(path: &Path) -> Result<bool> {
        if path.exists() {
            Ok(false)
        } else {
            Self::default().save_to_path(path)?;
            info!("Created default config file: {}", path.display());
            Ok(true)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.page_size == 0 || self.store.page_size > 100 {
            return Err(ConfigError::Invalid(format!(
                "store.page_size must be between 1 and 100, got {}",
                self.store.page_size
            )));
        }

        if self.job.max_per_run == 0 {
            return Err(ConfigError::Invalid(
                "job.max_per_run must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.enabled
            && self.scheduler.interval_minutes == 0
            && self.scheduler.cron_expression.is_none()
        {
            return Err(ConfigError::Invalid(
                "Scheduler interval must be > 0 or cron expression must be set".to_string(),
            ));
        }

        for pattern in &self.job.refresh_signatures {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("invalid refresh signature '{pattern}': {e}"))
            })?;
        }

        url::Url::parse(&self.materializer.public_base_url).map_err(|e| {
            ConfigError::Invalid(format!("invalid materializer.public_base_url: {e}"))
        })?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required credential: set {0}")]
    MissingCredential(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub const STORE_BASE_ENV: &str = "AIRTABLE_BASE_ID";
pub const STORE_TOKEN_ENV: &str = "AIRTABLE_TOKEN";
pub const IMAGE_TOKEN_ENV: &str = "REPLICATE_API_TOKEN";
pub const TEXT_TOKEN_ENV: &str = "OPENROUTER_API_KEY";
pub const ARTIFACT_DIR_ENV: &str = "ARTIFACT_DIR";

/// Secrets and deployment locations, read from the process environment only.
#[derive(Clone)]
pub struct Credentials {
    pub store_base_id: Option<String>,
    pub store_token: Option<String>,
    pub image_token: Option<String>,
    pub text_token: Option<String>,
    pub artifact_dir: Option<PathBuf>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("store_base_id", &self.store_base_id)
            .field("store_token", &redact(&self.store_token))
            .field("image_token", &redact(&self.image_token))
            .field("text_token", &redact(&self.text_token))
            .field("artifact_dir", &self.artifact_dir)
            .finish()
    }
}

impl Credentials {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds credentials from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
        };

        Self {
            store_base_id: get(&[STORE_BASE_ENV, "AIRTABLE_BASE"]),
            store_token: get(&[STORE_TOKEN_ENV, "AIRTABLE_API_KEY"]),
            image_token: get(&[IMAGE_TOKEN_ENV]),
            text_token: get(&[TEXT_TOKEN_ENV]),
            artifact_dir: get(&[ARTIFACT_DIR_ENV]).map(PathBuf::from),
        }
    }

    pub fn store(&self) -> Result<(&str, &str), ConfigError> {
        let base = self
            .store_base_id
            .as_deref()
            .ok_or(ConfigError::MissingCredential(STORE_BASE_ENV))?;
        let token = self
            .store_token
            .as_deref()
            .ok_or(ConfigError::MissingCredential(STORE_TOKEN_ENV))?;
        Ok((base, token))
    }

    pub fn generator_token(&self, kind: GenerationKind) -> Result<&str, ConfigError> {
        match kind {
            GenerationKind::Image => self
                .image_token
                .as_deref()
                .ok_or(ConfigError::MissingCredential(IMAGE_TOKEN_ENV)),
            GenerationKind::Text => self
                .text_token
                .as_deref()
                .ok_or(ConfigError::MissingCredential(TEXT_TOKEN_ENV)),
        }
    }

    /// Artifact directory from the environment, falling back to `materializer.output_dir`.
    pub fn artifact_dir(&self, config: &MaterializerConfig) -> Result<PathBuf, ConfigError> {
        self.artifact_dir
            .clone()
            .or_else(|| config.output_dir.as_ref().map(PathBuf::from))
            .ok_or(ConfigError::MissingCredential(ARTIFACT_DIR_ENV))
    }
}
