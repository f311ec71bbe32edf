use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LayerflowError, Result};
use crate::types::{ExecutionMode, LayerKind};

/// Top-level layerflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub layers: LayersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub default_mode: ExecutionMode,
    /// Whole-run deadline applied when a graph sets none.
    #[serde(default)]
    pub workflow_timeout_secs: Option<u64>,
    /// Extra attempts per step when the step sets none.
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Capacity of the workflow event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_mode: ExecutionMode::default(),
            workflow_timeout_secs: None,
            default_retries: default_retries(),
            retry: RetryConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_retries() -> u32 { 2 }
fn default_event_capacity() -> usize { 256 }

/// Backoff between step attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayersConfig {
    #[serde(default)]
    pub claude: CliLayerConfig,
    #[serde(default)]
    pub gemini: CliLayerConfig,
    #[serde(default)]
    pub multimodal: ApiLayerConfig,
}

/// A layer backed by a command-line tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliLayerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Executable name (resolved on PATH) or absolute path. Defaults to
    /// the layer's own name.
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl CliLayerConfig {
    /// Configured executable, or `default` when unset.
    pub fn binary_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.binary.as_deref().filter(|b| !b.is_empty()).unwrap_or(default)
    }
}

impl Default for CliLayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            model: None,
            extra_args: vec![],
            timeout_secs: None,
            max_concurrency: None,
        }
    }
}

/// A layer backed by an HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLayerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_model")]
    pub model: String,
    #[serde(default = "default_api_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// USD per 1000 tokens, used for cost accounting.
    #[serde(default)]
    pub cost_per_1k_tokens: Option<f64>,
}

impl Default for ApiLayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: default_api_base_url(),
            model: default_api_model(),
            max_tokens: default_api_max_tokens(),
            timeout_secs: None,
            max_concurrency: None,
            cost_per_1k_tokens: None,
        }
    }
}

impl ApiLayerConfig {
    /// The API key, ignoring unexpanded `${VAR}` placeholders.
    pub fn resolved_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty() && !k.starts_with("${"))
    }
}

fn default_enabled() -> bool { true }
fn default_api_base_url() -> String { "https://generativelanguage.googleapis.com/v1beta".to_string() }
fn default_api_model() -> String { "gemini-2.5-flash".to_string() }
fn default_api_max_tokens() -> u32 { 8192 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LayerflowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Load config from a file, or fall back to defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| LayerflowError::Config(e.to_string()))
    }

    /// Configured timeout override for a layer.
    pub fn layer_timeout(&self, kind: LayerKind) -> Option<Duration> {
        let secs = match kind {
            LayerKind::Claude => self.layers.claude.timeout_secs,
            LayerKind::Gemini => self.layers.gemini.timeout_secs,
            LayerKind::Multimodal => self.layers.multimodal.timeout_secs,
        };
        secs.map(Duration::from_secs)
    }

    pub fn workflow_timeout(&self) -> Option<Duration> {
        self.engine.workflow_timeout_secs.map(Duration::from_secs)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.engine.default_mode, ExecutionMode::Adaptive);
        assert_eq!(config.engine.default_retries, 2);
        assert_eq!(config.engine.retry.initial_backoff_ms, 1000);
        assert_eq!(config.layers.claude.binary_or("claude"), "claude");
        assert!(config.layers.gemini.enabled);
        assert!(config.layers.multimodal.enabled);
        assert!(config.workflow_timeout().is_none());
    }

    #[test]
    fn test_unset_env_var_kept() {
        let config = AppConfig::parse(
            r#"
[layers.multimodal]
api_key = "${LAYERFLOW_SURELY_UNSET_VAR}"
"#,
        )
        .unwrap();
        assert_eq!(
            config.layers.multimodal.api_key.as_deref(),
            Some("${LAYERFLOW_SURELY_UNSET_VAR}")
        );
        assert!(config.layers.multimodal.resolved_api_key().is_none());
    }

    #[test]
    fn test_layer_timeout_override() {
        let config = AppConfig::parse(
            r#"
[layers.gemini]
binary = "/opt/gemini"
timeout_secs = 15
"#,
        )
        .unwrap();
        assert_eq!(
            config.layer_timeout(LayerKind::Gemini),
            Some(Duration::from_secs(15))
        );
        assert_eq!(config.layer_timeout(LayerKind::Claude), None);
        assert_eq!(config.layers.gemini.binary_or("gemini"), "/opt/gemini");
    }

    #[test]
    fn test_bad_mode_is_config_error() {
        let err = AppConfig::parse("[engine]\ndefault_mode = \"eager\"\n").unwrap_err();
        assert!(matches!(err, LayerflowError::Config(_)));
    }
}
