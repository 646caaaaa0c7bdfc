//! Application configuration for novelkb.
//!
//! User config lives at `~/.novelkb/novelkb.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{NovelKbError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "novelkb.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".novelkb";

/// Env var that overrides `[llm].model`.
const MODEL_ENV: &str = "OPENAI_MODEL";

/// Env var that overrides `[llm].base_url`.
const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

// ---------------------------------------------------------------------------
// Config structs (matching novelkb.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM backend settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Retry/backoff policy for backend calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Chunker defaults.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Extractor defaults.
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Merger defaults.
    #[serde(default)]
    pub merge: MergeConfig,
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Completion token cap per request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-request timeout; a slow request never holds a worker longer.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LlmConfig {
    /// Parse and validate `base_url`.
    pub fn endpoint(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            NovelKbError::config(format!("invalid llm.base_url '{}': {e}", self.base_url))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(NovelKbError::config(format!(
                "llm.base_url must be http(s), got scheme '{other}'"
            ))),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4.1-mini".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1800
}
fn default_request_timeout() -> u64 {
    120
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_initial_backoff() -> u64 {
    800
}
fn default_max_backoff() -> u64 {
    20_000
}

/// `[chunking]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Character cap per chunk.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Characters repeated between consecutive pieces of a chapter group.
    #[serde(default = "default_overlap")]
    pub overlap: usize,

    /// Chapters per group (0 = unlimited).
    #[serde(default)]
    pub max_chapters: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap: default_overlap(),
            max_chapters: 0,
        }
    }
}

fn default_max_chars() -> usize {
    2800
}
fn default_overlap() -> usize {
    200
}

/// `[extract]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Concurrent in-flight backend requests.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    1
}

/// `[merge]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// How contradictory relation directions are settled.
    #[serde(default)]
    pub direction_policy: DirectionPolicy,
}

/// Resolution policy for relation evidence pointing in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionPolicy {
    /// The direction with more evidence wins; ties become bidirectional and are reported.
    #[default]
    Majority,
    /// Any disagreement makes the relation bidirectional without a report.
    Bidirectional,
    /// Any disagreement is reported as unresolved.
    Strict,
}

impl DirectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Majority => "majority",
            Self::Bidirectional => "bidirectional",
            Self::Strict => "strict",
        }
    }
}

impl FromStr for DirectionPolicy {
    type Err = NovelKbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "majority" => Ok(Self::Majority),
            "bidirectional" => Ok(Self::Bidirectional),
            "strict" => Ok(Self::Strict),
            other => Err(NovelKbError::config(format!(
                "unknown direction policy '{other}': expected majority, bidirectional or strict"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.novelkb/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| NovelKbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.novelkb/novelkb.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config. An explicit path must exist; the default
/// location falls back to built-in defaults when absent.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let config = match explicit {
        Some(path) => load_config_from(path)?,
        None => {
            let path = config_file_path()?;
            if path.exists() {
                load_config_from(&path)?
            } else {
                tracing::debug!(?path, "config file not found, using defaults");
                AppConfig::default()
            }
        }
    };

    Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NovelKbError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| NovelKbError::config(format!("failed to parse {}: {e}", path.display())))
}

impl AppConfig {
    /// Apply `OPENAI_MODEL` / `OPENAI_BASE_URL` overrides from `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.llm.model = model;
        }
        if let Some(base) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.llm.base_url = base;
        }
        self
    }
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| NovelKbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| NovelKbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| NovelKbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API key from the env var named by `[llm].api_key_env`.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(NovelKbError::config(format!(
            "LLM API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_chars"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
        assert!(toml_str.contains("direction_policy = \"majority\""));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.chunking.max_chars, 2800);
        assert_eq!(parsed.chunking.overlap, 200);
        assert_eq!(parsed.llm.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[llm]
model = "qwen-plus"
base_url = "http://localhost:8000/v1"

[merge]
direction_policy = "strict"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.llm.model, "qwen-plus");
        assert_eq!(config.llm.max_tokens, 1800);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.extract.workers, 1);
        assert_eq!(config.merge.direction_policy, DirectionPolicy::Strict);
    }

    #[test]
    fn env_overrides_apply() {
        let config = AppConfig::default().with_env_overrides(|key| match key {
            "OPENAI_MODEL" => Some("deepseek-chat".into()),
            "OPENAI_BASE_URL" => Some("".into()),
            _ => None,
        });
        assert_eq!(config.llm.model, "deepseek-chat");
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn endpoint_validation() {
        let mut llm = LlmConfig::default();
        assert!(llm.endpoint().is_ok());

        llm.base_url = "ftp://example.com".into();
        assert!(llm.endpoint().unwrap_err().to_string().contains("http(s)"));

        llm.base_url = "not a url".into();
        assert!(llm.endpoint().is_err());
    }

    #[test]
    fn direction_policy_from_str() {
        assert_eq!(
            "bidirectional".parse::<DirectionPolicy>().unwrap(),
            DirectionPolicy::Bidirectional
        );
        assert!("sideways".parse::<DirectionPolicy>().is_err());
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.llm.api_key_env = "NOVELKB_TEST_NONEXISTENT_KEY_12345".into();
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
