use std::sync::Arc;

use url::Url;

use super::{ProviderProfile, ProviderRegistry};
use crate::error::{ProxyError, Result};

/// Provider returned when no detection stage matches
pub const DEFAULT_PROVIDER: &str = "anthropic";

/// Classifies inbound requests into a provider identity
///
/// Detection runs in three stages, and the first stage that yields a match
/// wins:
/// 1. path substring
/// 2. model-name prefix (only when a model is supplied)
/// 3. credential prefix
///
/// Within a stage the longest matching pattern wins, so `sk-ant-` beats
/// `sk-` and `/v1/completions` beats `/v1/complete`. Equal-length matches
/// fall back to registry order.
#[derive(Debug, Clone)]
pub struct ProviderDetector {
    registry: Arc<ProviderRegistry>,
}

impl ProviderDetector {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        tracing::debug!(
            "ProviderDetector initialized with providers: {:?}",
            registry.known_providers()
        );
        Self { registry }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Profile for a configured provider
    pub fn get_provider(&self, provider: &str) -> Result<&ProviderProfile> {
        self.registry.get(provider)
    }

    /// Detect the provider for a request. Never fails: unknown requests map
    /// to [`DEFAULT_PROVIDER`].
    pub fn detect(&self, path: &str, credential: &str, model: Option<&str>) -> String {
        if let Some(provider) = self.detect_from_path(path) {
            tracing::debug!(provider, "Provider detected from path");
            return provider.to_string();
        }

        if let Some(model) = model.filter(|m| !m.is_empty()) {
            if let Some(provider) = self.detect_from_model(model) {
                tracing::debug!(provider, "Provider detected from model");
                return provider.to_string();
            }
        }

        if let Some(provider) = self.detect_from_credential(credential) {
            tracing::debug!(provider, "Provider detected from credential");
            return provider.to_string();
        }

        tracing::debug!("Could not detect provider, defaulting to '{DEFAULT_PROVIDER}'");
        DEFAULT_PROVIDER.to_string()
    }

    fn detect_from_path(&self, path: &str) -> Option<&str> {
        let path = path.to_lowercase();
        self.best_match(|profile| &profile.path_patterns, |pattern| path.contains(pattern))
    }

    fn detect_from_model(&self, model: &str) -> Option<&str> {
        let model = model.to_lowercase();
        self.best_match(|profile| &profile.model_prefixes, |prefix| model.starts_with(prefix))
    }

    fn detect_from_credential(&self, credential: &str) -> Option<&str> {
        let key = strip_bearer(credential);
        if key.is_empty() {
            return None;
        }
        self.best_match(|profile| &profile.key_prefixes, |prefix| key.starts_with(prefix))
    }

    /// Longest matching pattern across all profiles; ties keep the earlier
    /// profile
    fn best_match<'a, P, M>(&'a self, patterns: P, matches: M) -> Option<&'a str>
    where
        P: Fn(&'a ProviderProfile) -> &'a Vec<String>,
        M: Fn(&str) -> bool,
    {
        let mut best: Option<(&'a str, usize)> = None;

        for profile in self.registry.profiles() {
            for pattern in patterns(profile) {
                if pattern.is_empty() || !matches(pattern.as_str()) {
                    continue;
                }
                if best.is_none_or(|(_, len)| pattern.len() > len) {
                    best = Some((profile.id.as_str(), pattern.len()));
                }
            }
        }

        best.map(|(id, _)| id)
    }

    /// Build the upstream URL: the provider's base URL followed by the
    /// original request path and query.
    ///
    /// Paths with `.` or `..` segments (raw or percent-encoded) are refused,
    /// so a request can never resolve outside the base URL's path prefix.
    pub fn get_target_url(&self, provider: &str, path: &str, query: Option<&str>) -> Result<Url> {
        let profile = self.registry.get(provider)?;

        if has_dot_segment(path) {
            return Err(ProxyError::Upstream(format!(
                "Refusing to forward path with dot segments: '{path}'"
            )));
        }

        let base = profile.base_url.as_str().trim_end_matches('/');
        let clean_path = path.trim_start_matches('/');

        let mut target = format!("{base}/{clean_path}");
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(q);
        }

        let url = Url::parse(&target)
            .map_err(|e| ProxyError::Upstream(format!("Invalid target URL '{target}': {e}")))?;

        let base_path = profile.base_url.path().trim_end_matches('/');
        if !url.path().starts_with(base_path) {
            return Err(ProxyError::Upstream(format!(
                "Target URL '{url}' escapes the base path of provider '{provider}'"
            )));
        }

        Ok(url)
    }
}

/// Whether any `/`- or `\`-separated segment is `.` or `..`, including the
/// `%2e` spellings the URL parser also resolves
fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Strip a leading `Bearer ` scheme (any case) and surrounding whitespace
pub fn strip_bearer(value: &str) -> &str {
    let trimmed = value.trim();
    match trimmed.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim(),
        _ => trimmed,
    }
}
