use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{ProxyError, Result};

/// Retention profiles understood by the memory engine
pub const REWARD_PROFILES: &[&str] = &["QUALITY", "QUALITY_FOCUSED", "BALANCED", "COST", "COST_FOCUSED"];

/// Main configuration structure for memproxy
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream providers keyed by identity (e.g. "anthropic")
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,
    /// Token/cost accounting configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Memory engine policy knobs
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Forwarding pipeline configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: default_providers(),
            session: SessionConfig::default(),
            metrics: MetricsConfig::default(),
            memory: MemoryConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists. Environment overrides are applied and the result
    /// is validated.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                tracing::info!("Loading config from: {}", path.display());
                Self::from_file(path)?
            }
            None => match Self::default_paths().into_iter().find(|p| p.exists()) {
                Some(path) => {
                    tracing::info!("Loading config from: {}", path.display());
                    Self::from_file(&path)?
                }
                None => {
                    tracing::info!("No config file found, using defaults");
                    Config::default()
                }
            },
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))
    }

    fn default_paths() -> Vec<PathBuf> {
        [
            dirs::home_dir().map(|h| h.join(".memproxy").join("config.toml")),
            dirs::config_dir().map(|c| c.join("memproxy").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Apply `MEMPROXY_*` environment overrides on top of the file values.
    ///
    /// The lookup function is injected so tests don't touch the process env.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MEMPROXY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("MEMPROXY_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| ProxyError::Config(format!("Invalid MEMPROXY_PORT '{port}': {e}")))?;
        }
        if let Some(decay) = lookup("MEMPROXY_ENABLE_DECAY") {
            self.memory.enable_decay = decay.eq_ignore_ascii_case("true");
        }
        if let Some(profile) = lookup("MEMPROXY_REWARD_PROFILE") {
            self.memory.reward_profile = profile;
        }
        if let Some(threshold) = lookup("MEMPROXY_COMPRESSION_THRESHOLD") {
            self.memory.compression_threshold = threshold.parse().map_err(|e| {
                ProxyError::Config(format!(
                    "Invalid MEMPROXY_COMPRESSION_THRESHOLD '{threshold}': {e}"
                ))
            })?;
        }
        if let Some(importance) = lookup("MEMPROXY_MIN_IMPORTANCE") {
            self.memory.min_importance = importance.parse().map_err(|e| {
                ProxyError::Config(format!("Invalid MEMPROXY_MIN_IMPORTANCE '{importance}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Reject configurations the proxy cannot serve traffic with
    pub fn validate(&mut self) -> Result<()> {
        if !(1024..=65535).contains(&self.server.port) {
            return Err(ProxyError::Config(format!(
                "server.port must be between 1024 and 65535, got {}",
                self.server.port
            )));
        }

        if self.providers.is_empty() {
            return Err(ProxyError::Config(
                "At least one provider must be configured".to_string(),
            ));
        }

        for (name, provider) in &self.providers {
            let url = Url::parse(&provider.base_url).map_err(|e| {
                ProxyError::Config(format!(
                    "Invalid base_url '{}' for provider '{name}': {e}",
                    provider.base_url
                ))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ProxyError::Config(format!(
                    "Provider '{name}' base_url must use http or https"
                )));
            }
        }

        if self.session.timeout_minutes < 1 {
            return Err(ProxyError::Config(
                "session.timeout_minutes must be >= 1".to_string(),
            ));
        }

        if self.memory.compression_threshold < 1 {
            return Err(ProxyError::Config(
                "memory.compression_threshold must be >= 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.memory.min_importance) {
            return Err(ProxyError::Config(
                "memory.min_importance must be between 0.0 and 1.0".to_string(),
            ));
        }

        let profile = self.memory.reward_profile.to_uppercase();
        if !REWARD_PROFILES.contains(&profile.as_str()) {
            return Err(ProxyError::Config(format!(
                "memory.reward_profile must be one of {REWARD_PROFILES:?}, got '{}'",
                self.memory.reward_profile
            )));
        }
        self.memory.reward_profile = profile;

        if self.proxy.min_messages < 1 {
            return Err(ProxyError::Config(
                "proxy.min_messages must be >= 1".to_string(),
            ));
        }

        if self.proxy.timeout_secs < 1 {
            return Err(ProxyError::Config(
                "proxy.timeout_secs must be >= 1".to_string(),
            ));
        }

        if self.proxy.recall_limit < 1 {
            return Err(ProxyError::Config(
                "proxy.recall_limit must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address string the server binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,
    /// Attach a CORS layer to every response
    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
    /// Origins allowed by the CORS layer ("*" = any)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_enabled() -> bool {
    true
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// One upstream provider.
///
/// Pattern lists left unset fall back to the built-in table for well-known
/// provider names.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Base URL the request path is appended to
    pub base_url: String,
    /// Path substrings identifying this provider
    #[serde(default)]
    pub path_patterns: Option<Vec<String>>,
    /// Credential prefixes identifying this provider
    #[serde(default)]
    pub key_prefixes: Option<Vec<String>>,
    /// Model-name prefixes identifying this provider
    #[serde(default)]
    pub model_prefixes: Option<Vec<String>>,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path_patterns: None,
            key_prefixes: None,
            model_prefixes: None,
        }
    }
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    BTreeMap::from([
        (
            "anthropic".to_string(),
            ProviderConfig::new("https://api.anthropic.com"),
        ),
        (
            "openai".to_string(),
            ProviderConfig::new("https://api.openai.com"),
        ),
        (
            "google".to_string(),
            ProviderConfig::new("https://generativelanguage.googleapis.com"),
        ),
    ])
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is evicted from memory
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Write session snapshots to disk
    #[serde(default = "default_persist_memory")]
    pub persist_memory: bool,
    /// Directory holding one snapshot file per session key
    #[serde(default = "default_memory_dir")]
    pub memory_dir: PathBuf,
    /// How often the idle sweep runs
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            persist_memory: default_persist_memory(),
            memory_dir: default_memory_dir(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_persist_memory() -> bool {
    true
}

fn default_memory_dir() -> PathBuf {
    PathBuf::from(".memproxy_sessions")
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

/// Token and cost accounting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Track savings at all; when false `/metrics` reports "not initialized"
    #[serde(default = "default_track_savings")]
    pub track_savings: bool,
    /// USD per million input tokens
    #[serde(default = "default_input_cost_per_million")]
    pub input_cost_per_million: f64,
    /// USD per million output tokens
    #[serde(default = "default_output_cost_per_million")]
    pub output_cost_per_million: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            track_savings: default_track_savings(),
            input_cost_per_million: default_input_cost_per_million(),
            output_cost_per_million: default_output_cost_per_million(),
        }
    }
}

fn default_track_savings() -> bool {
    true
}

fn default_input_cost_per_million() -> f64 {
    3.0
}

fn default_output_cost_per_million() -> f64 {
    15.0
}

/// Policy knobs handed to the memory engine constructor
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Let older records lose importance as new ones arrive
    #[serde(default)]
    pub enable_decay: bool,
    /// Retention profile (QUALITY, BALANCED, COST)
    #[serde(default = "default_reward_profile")]
    pub reward_profile: String,
    /// Word count above which records become gist candidates
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Importance below which decayed records are forgotten
    #[serde(default = "default_min_importance")]
    pub min_importance: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable_decay: false,
            reward_profile: default_reward_profile(),
            compression_threshold: default_compression_threshold(),
            min_importance: default_min_importance(),
        }
    }
}

fn default_reward_profile() -> String {
    "QUALITY".to_string()
}

fn default_compression_threshold() -> usize {
    10
}

fn default_min_importance() -> f32 {
    0.3
}

/// Forwarding pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Path fragments whose requests go through the memory engine
    #[serde(default = "default_chat_paths")]
    pub chat_paths: Vec<String>,
    /// Minimum message count for a request to be rewritten
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,
    /// Maximum number of records recalled per request
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            chat_paths: default_chat_paths(),
            min_messages: default_min_messages(),
            recall_limit: default_recall_limit(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_chat_paths() -> Vec<String> {
    vec![
        "/messages".to_string(),
        "/chat/completions".to_string(),
        "/completions".to_string(),
    ]
}

fn default_min_messages() -> usize {
    1
}

fn default_recall_limit() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.providers.len(), 3);
        assert_eq!(
            config.providers["anthropic"].base_url,
            "https://api.anthropic.com"
        );
        assert_eq!(config.session.timeout_minutes, 60);
        assert!(config.session.persist_memory);
        assert_eq!(config.metrics.input_cost_per_million, 3.0);
        assert_eq!(config.metrics.output_cost_per_million, 15.0);
        assert_eq!(config.memory.reward_profile, "QUALITY");
        assert_eq!(config.proxy.timeout_secs, 300);
        assert_eq!(config.proxy.min_messages, 1);
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 9090
cors_enabled = false

[providers.anthropic]
base_url = "https://api.anthropic.com"

[providers.local]
base_url = "http://localhost:11434"
path_patterns = ["/api/chat"]
model_prefixes = ["llama"]

[session]
timeout_minutes = 30
persist_memory = false
memory_dir = "/tmp/sessions"

[metrics]
input_cost_per_million = 1.5

[memory]
enable_decay = true
reward_profile = "balanced"
compression_threshold = 20
min_importance = 0.5

[proxy]
timeout_secs = 60
min_messages = 3
"#;

        let mut config: Config = toml::from_str(toml_str).expect("Failed to parse TOML");
        config.validate().expect("config should validate");

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert!(!config.server.cors_enabled);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(
            config.providers["local"].path_patterns,
            Some(vec!["/api/chat".to_string()])
        );
        assert!(config.providers["local"].key_prefixes.is_none());
        assert_eq!(config.session.timeout_minutes, 30);
        assert!(!config.session.persist_memory);
        assert_eq!(config.session.memory_dir, PathBuf::from("/tmp/sessions"));
        assert_eq!(config.metrics.input_cost_per_million, 1.5);
        assert_eq!(config.metrics.output_cost_per_million, 15.0);
        assert!(config.memory.enable_decay);
        // validate() normalizes the profile name
        assert_eq!(config.memory.reward_profile, "BALANCED");
        assert_eq!(config.memory.compression_threshold, 20);
        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(config.proxy.min_messages, 3);
        assert_eq!(config.proxy.chat_paths.len(), 3);
    }

    #[test]
    fn test_missing_providers_uses_defaults() {
        let config: Config = toml::from_str("[server]\nport = 8081\n").unwrap();
        assert!(config.providers.contains_key("openai"));
        assert!(config.providers.contains_key("google"));
    }

    #[test]
    fn test_validate_rejects_bad_port() {
        let mut config = Config::default();
        config.server.port = 80;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.port"));
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut config = Config::default();
        config
            .providers
            .insert("broken".to_string(), ProviderConfig::new("not a url"));
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));

        let mut config = Config::default();
        config
            .providers
            .insert("ftp".to_string(), ProviderConfig::new("ftp://example.com"));
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_providers() {
        let mut config = Config::default();
        config.providers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_memory_policy() {
        let mut config = Config::default();
        config.memory.reward_profile = "RECKLESS".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.memory.min_importance = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.memory.compression_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_min_messages() {
        let mut config = Config::default();
        config.session.timeout_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.min_messages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_upstream_timeout_and_recall_limit() {
        let mut config = Config::default();
        config.proxy.timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("proxy.timeout_secs"));

        let mut config = Config::default();
        config.proxy.recall_limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("proxy.recall_limit"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MEMPROXY_HOST", "127.0.0.1"),
            ("MEMPROXY_PORT", "9999"),
            ("MEMPROXY_ENABLE_DECAY", "TRUE"),
            ("MEMPROXY_REWARD_PROFILE", "cost"),
            ("MEMPROXY_COMPRESSION_THRESHOLD", "5"),
            ("MEMPROXY_MIN_IMPORTANCE", "0.1"),
        ]);

        let mut config = Config::default();
        config
            .apply_env_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9999);
        assert!(config.memory.enable_decay);
        assert_eq!(config.memory.reward_profile, "COST");
        assert_eq!(config.memory.compression_threshold, 5);
        assert!((config.memory.min_importance - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_env_override_invalid_port() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|name| {
            (name == "MEMPROXY_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\ntimeout_minutes = 5\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.session.timeout_minutes, 5);
    }
}
