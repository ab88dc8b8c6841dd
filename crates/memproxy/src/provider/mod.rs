//! Upstream provider profiles
//!
//! The registry is an immutable table built once from configuration. Adding a
//! provider is a configuration change: well-known names pick up their
//! detection patterns from [`BUILTIN_PATTERNS`], anything else supplies its
//! own pattern lists.

mod detector;

pub use detector::{DEFAULT_PROVIDER, ProviderDetector, strip_bearer};

use std::collections::BTreeMap;

use url::Url;

use crate::config::ProviderConfig;
use crate::error::{ProxyError, Result};

/// Detection patterns shipped for the providers we know about
pub struct BuiltinPatterns {
    pub provider: &'static str,
    pub path_patterns: &'static [&'static str],
    pub key_prefixes: &'static [&'static str],
    pub model_prefixes: &'static [&'static str],
}

/// Built-in pattern table, in registry priority order
pub const BUILTIN_PATTERNS: &[BuiltinPatterns] = &[
    BuiltinPatterns {
        provider: "anthropic",
        path_patterns: &["/v1/messages", "/v1/complete", "claude", "anthropic"],
        key_prefixes: &["sk-ant-"],
        model_prefixes: &["claude-"],
    },
    BuiltinPatterns {
        provider: "openai",
        path_patterns: &[
            "/v1/chat/completions",
            "/v1/completions",
            "/v1/embeddings",
            "openai",
        ],
        key_prefixes: &["sk-"],
        model_prefixes: &["gpt-", "text-", "davinci", "curie"],
    },
    BuiltinPatterns {
        provider: "google",
        path_patterns: &["/v1/models/", "generativelanguage", "gemini", "google"],
        key_prefixes: &["AIza"],
        model_prefixes: &["gemini-", "palm-"],
    },
];

/// One upstream API vendor
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProfile {
    /// Provider identity (e.g. "anthropic")
    pub id: String,
    /// Base URL requests are forwarded to
    pub base_url: Url,
    /// Lowercased path substrings
    pub path_patterns: Vec<String>,
    /// Credential prefixes (case-sensitive)
    pub key_prefixes: Vec<String>,
    /// Lowercased model-name prefixes
    pub model_prefixes: Vec<String>,
}

impl ProviderProfile {
    /// Build a profile from its configuration entry, filling unset pattern
    /// lists from the built-in table
    pub fn from_config(id: &str, config: &ProviderConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ProxyError::Config(format!(
                "Invalid base_url '{}' for provider '{id}': {e}",
                config.base_url
            ))
        })?;

        let builtin = BUILTIN_PATTERNS.iter().find(|b| b.provider == id);

        Ok(Self {
            id: id.to_string(),
            base_url,
            path_patterns: lowercase(patterns_or_builtin(
                &config.path_patterns,
                builtin.map(|b| b.path_patterns),
            )),
            key_prefixes: patterns_or_builtin(&config.key_prefixes, builtin.map(|b| b.key_prefixes)),
            model_prefixes: lowercase(patterns_or_builtin(
                &config.model_prefixes,
                builtin.map(|b| b.model_prefixes),
            )),
        })
    }
}

fn patterns_or_builtin(
    configured: &Option<Vec<String>>,
    builtin: Option<&'static [&'static str]>,
) -> Vec<String> {
    match configured {
        Some(patterns) => patterns.clone(),
        None => builtin
            .map(|patterns| patterns.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default(),
    }
}

fn lowercase(patterns: Vec<String>) -> Vec<String> {
    patterns.into_iter().map(|p| p.to_lowercase()).collect()
}

/// Immutable table of configured providers, ordered by detection priority
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    profiles: Vec<ProviderProfile>,
}

impl ProviderRegistry {
    /// Build the registry from the `[providers]` configuration table.
    ///
    /// Built-in providers come first in their fixed order, followed by any
    /// other configured providers in name order.
    pub fn from_config(providers: &BTreeMap<String, ProviderConfig>) -> Result<Self> {
        let mut profiles = Vec::with_capacity(providers.len());

        for builtin in BUILTIN_PATTERNS {
            if let Some(config) = providers.get(builtin.provider) {
                profiles.push(ProviderProfile::from_config(builtin.provider, config)?);
            }
        }

        for (id, config) in providers {
            if BUILTIN_PATTERNS.iter().all(|b| b.provider != id) {
                profiles.push(ProviderProfile::from_config(id, config)?);
            }
        }

        Ok(Self { profiles })
    }

    /// Look up a provider profile by identity
    pub fn get(&self, id: &str) -> Result<&ProviderProfile> {
        self.profiles
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ProxyError::ProviderNotConfigured {
                provider: id.to_string(),
                available: self.known_providers().join(", "),
            })
    }

    /// Identities of all configured providers, in priority order
    pub fn known_providers(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.id.as_str()).collect()
    }

    /// Profiles in priority order
    pub fn profiles(&self) -> &[ProviderProfile] {
        &self.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(entries: &[(&str, &str)]) -> BTreeMap<String, ProviderConfig> {
        entries
            .iter()
            .map(|(id, url)| (id.to_string(), ProviderConfig::new(*url)))
            .collect()
    }

    #[test]
    fn test_registry_orders_builtins_first() {
        let registry = ProviderRegistry::from_config(&providers(&[
            ("zeta", "http://localhost:1"),
            ("google", "https://generativelanguage.googleapis.com"),
            ("alpha", "http://localhost:2"),
            ("anthropic", "https://api.anthropic.com"),
        ]))
        .unwrap();

        assert_eq!(
            registry.known_providers(),
            vec!["anthropic", "google", "alpha", "zeta"]
        );
    }

    #[test]
    fn test_builtin_patterns_applied() {
        let registry =
            ProviderRegistry::from_config(&providers(&[("anthropic", "https://api.anthropic.com")]))
                .unwrap();
        let profile = registry.get("anthropic").unwrap();

        assert!(profile.path_patterns.contains(&"/v1/messages".to_string()));
        assert_eq!(profile.key_prefixes, vec!["sk-ant-".to_string()]);
        assert_eq!(profile.model_prefixes, vec!["claude-".to_string()]);
    }

    #[test]
    fn test_configured_patterns_override_builtins() {
        let mut config = ProviderConfig::new("https://proxy.internal");
        config.model_prefixes = Some(vec!["GPT-5".to_string()]);

        let registry =
            ProviderRegistry::from_config(&BTreeMap::from([("openai".to_string(), config)])).unwrap();
        let profile = registry.get("openai").unwrap();

        // Overridden list is lowercased, the others still come from the table
        assert_eq!(profile.model_prefixes, vec!["gpt-5".to_string()]);
        assert!(profile.key_prefixes.contains(&"sk-".to_string()));
    }

    #[test]
    fn test_unknown_provider_has_no_patterns() {
        let registry =
            ProviderRegistry::from_config(&providers(&[("custom", "http://localhost:8000")]))
                .unwrap();
        let profile = registry.get("custom").unwrap();
        assert!(profile.path_patterns.is_empty());
        assert!(profile.key_prefixes.is_empty());
    }

    #[test]
    fn test_get_missing_provider() {
        let registry =
            ProviderRegistry::from_config(&providers(&[("openai", "https://api.openai.com")]))
                .unwrap();
        let err = registry.get("anthropic").unwrap_err();
        assert!(matches!(err, ProxyError::ProviderNotConfigured { .. }));
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn test_invalid_base_url() {
        let result = ProviderRegistry::from_config(&providers(&[("openai", "::nope::")]));
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }
}
