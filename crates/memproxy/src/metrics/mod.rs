//! Token and cost savings accounting
//!
//! Counts are whitespace-token estimates of the message text before and after
//! rewriting. `tokens_saved` is signed: replaying history can make the
//! outgoing request larger than the incoming one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::MetricsConfig;

/// Which price list a token count is billed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Input,
    Output,
}

/// Running totals for one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub session_key: String,
    pub requests: u64,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    pub tokens_saved: i64,
    pub cost_saved: f64,
    pub total_time_ms: f64,
    pub created_at: DateTime<Utc>,
    pub last_request: Option<DateTime<Utc>>,
}

impl SessionMetrics {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            requests: 0,
            original_tokens: 0,
            compressed_tokens: 0,
            tokens_saved: 0,
            cost_saved: 0.0,
            total_time_ms: 0.0,
            created_at: Utc::now(),
            last_request: None,
        }
    }

    fn update(&mut self, original: u64, compressed: u64, elapsed_ms: f64, input_cost_per_million: f64) {
        self.requests += 1;
        self.original_tokens += original;
        self.compressed_tokens += compressed;
        self.tokens_saved = self.original_tokens as i64 - self.compressed_tokens as i64;
        self.total_time_ms += elapsed_ms;
        self.last_request = Some(Utc::now());
        self.cost_saved = self.tokens_saved as f64 / 1_000_000.0 * input_cost_per_million;
    }

    /// Saved tokens as a percentage of original tokens (0 when nothing was sent)
    pub fn reduction_percentage(&self) -> f64 {
        percentage(self.tokens_saved, self.original_tokens)
    }

    pub fn avg_time_ms(&self) -> f64 {
        average(self.total_time_ms, self.requests)
    }
}

/// Aggregate over every tracked session, computed on demand
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalMetrics {
    pub sessions: usize,
    pub requests: u64,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    pub tokens_saved: i64,
    pub reduction_percentage: f64,
    pub cost_saved: f64,
    pub avg_time_ms: f64,
}

/// Per-session metrics keyed by session key
pub struct MetricsAggregator {
    sessions: DashMap<String, SessionMetrics>,
    input_cost_per_million: f64,
    output_cost_per_million: f64,
}

impl MetricsAggregator {
    pub fn new(config: &MetricsConfig) -> Self {
        tracing::info!(
            input_cost_per_million = config.input_cost_per_million,
            output_cost_per_million = config.output_cost_per_million,
            "Metrics tracking enabled"
        );
        Self {
            sessions: DashMap::new(),
            input_cost_per_million: config.input_cost_per_million,
            output_cost_per_million: config.output_cost_per_million,
        }
    }

    /// Add one request to a session's totals and return the updated totals
    pub fn record_request(
        &self,
        session_key: &str,
        original_tokens: u64,
        compressed_tokens: u64,
        elapsed_ms: f64,
    ) -> SessionMetrics {
        let mut entry = self
            .sessions
            .entry(session_key.to_string())
            .or_insert_with(|| SessionMetrics::new(session_key));

        entry.update(
            original_tokens,
            compressed_tokens,
            elapsed_ms,
            self.input_cost_per_million,
        );

        tracing::debug!(
            session = session_key.get(..8).unwrap_or(session_key),
            tokens_saved = entry.tokens_saved,
            "Metrics updated ({:.1}% reduction)",
            entry.reduction_percentage()
        );

        entry.clone()
    }

    /// Totals for one session; zero-valued if the session was never seen
    pub fn get_session_metrics(&self, session_key: &str) -> SessionMetrics {
        self.sessions
            .get(session_key)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| SessionMetrics::new(session_key))
    }

    pub fn get_global_metrics(&self) -> GlobalMetrics {
        let mut global = GlobalMetrics {
            sessions: 0,
            requests: 0,
            original_tokens: 0,
            compressed_tokens: 0,
            tokens_saved: 0,
            reduction_percentage: 0.0,
            cost_saved: 0.0,
            avg_time_ms: 0.0,
        };
        let mut total_time_ms = 0.0;

        for entry in self.sessions.iter() {
            let m = entry.value();
            global.sessions += 1;
            global.requests += m.requests;
            global.original_tokens += m.original_tokens;
            global.compressed_tokens += m.compressed_tokens;
            global.tokens_saved += m.tokens_saved;
            global.cost_saved += m.cost_saved;
            total_time_ms += m.total_time_ms;
        }

        global.reduction_percentage = percentage(global.tokens_saved, global.original_tokens);
        global.avg_time_ms = average(total_time_ms, global.requests);
        global
    }

    /// Sessions with the most tokens saved, best first
    pub fn get_top_sessions(&self, limit: usize) -> Vec<SessionMetrics> {
        let mut sessions: Vec<SessionMetrics> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| b.tokens_saved.cmp(&a.tokens_saved));
        sessions.truncate(limit);
        sessions
    }

    /// Dollar value of `tokens` at the configured per-million price
    pub fn calculate_cost_saved(&self, tokens: i64, kind: TokenKind) -> f64 {
        let per_million = match kind {
            TokenKind::Input => self.input_cost_per_million,
            TokenKind::Output => self.output_cost_per_million,
        };
        tokens as f64 / 1_000_000.0 * per_million
    }

    pub fn reset_session(&self, session_key: &str) {
        if self.sessions.remove(session_key).is_some() {
            tracing::info!(session = session_key.get(..8).unwrap_or(session_key), "Metrics reset");
        }
    }

    pub fn reset_all(&self) {
        self.sessions.clear();
        tracing::info!("All metrics reset");
    }

    /// Log the global totals; called at shutdown
    pub fn log_summary(&self) {
        let global = self.get_global_metrics();
        tracing::info!(
            sessions = global.sessions,
            requests = global.requests,
            tokens_saved = global.tokens_saved,
            cost_saved = %format!("${:.4}", global.cost_saved),
            avg_time_ms = %format!("{:.1}", global.avg_time_ms),
            "Metrics summary ({:.1}% reduction)",
            global.reduction_percentage
        );
    }
}

fn percentage(saved: i64, original: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    saved as f64 / original as f64 * 100.0
}

fn average(total: f64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    total / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::new(&MetricsConfig {
            track_savings: true,
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
        })
    }

    #[test]
    fn test_record_request_accumulates() {
        let metrics = aggregator();
        metrics.record_request("abc", 100, 40, 10.0);
        let m = metrics.record_request("abc", 50, 10, 30.0);

        assert_eq!(m.requests, 2);
        assert_eq!(m.original_tokens, 150);
        assert_eq!(m.compressed_tokens, 50);
        assert_eq!(m.tokens_saved, 100);
        assert!((m.reduction_percentage() - 66.666).abs() < 0.01);
        assert_eq!(m.avg_time_ms(), 20.0);
        assert!((m.cost_saved - 0.0003).abs() < 1e-12);
        assert!(m.last_request.is_some());
    }

    #[test]
    fn test_tokens_saved_can_be_negative() {
        let metrics = aggregator();
        let m = metrics.record_request("abc", 10, 25, 1.0);
        assert_eq!(m.tokens_saved, -15);
        assert!(m.reduction_percentage() < 0.0);
        assert!(m.cost_saved < 0.0);
    }

    #[test]
    fn test_unknown_session_is_zero_valued() {
        let metrics = aggregator();
        let m = metrics.get_session_metrics("missing");
        assert_eq!(m.session_key, "missing");
        assert_eq!(m.requests, 0);
        assert_eq!(m.reduction_percentage(), 0.0);
        assert_eq!(m.avg_time_ms(), 0.0);
    }

    #[test]
    fn test_zero_token_requests_still_counted() {
        let metrics = aggregator();
        metrics.record_request("abc", 0, 0, 5.0);
        let global = metrics.get_global_metrics();
        assert_eq!(global.requests, 1);
        assert_eq!(global.reduction_percentage, 0.0);
    }

    #[test]
    fn test_global_metrics() {
        let metrics = aggregator();
        metrics.record_request("a", 100, 50, 10.0);
        metrics.record_request("b", 100, 100, 30.0);

        let global = metrics.get_global_metrics();
        assert_eq!(global.sessions, 2);
        assert_eq!(global.requests, 2);
        assert_eq!(global.original_tokens, 200);
        assert_eq!(global.compressed_tokens, 150);
        assert_eq!(global.tokens_saved, 50);
        assert_eq!(global.reduction_percentage, 25.0);
        assert_eq!(global.avg_time_ms, 20.0);
    }

    #[test]
    fn test_top_sessions_ordering() {
        let metrics = aggregator();
        metrics.record_request("low", 10, 9, 1.0);
        metrics.record_request("high", 100, 10, 1.0);
        metrics.record_request("mid", 50, 25, 1.0);

        let top = metrics.get_top_sessions(2);
        let keys: Vec<&str> = top.iter().map(|m| m.session_key.as_str()).collect();
        assert_eq!(keys, vec!["high", "mid"]);
    }

    #[test]
    fn test_calculate_cost_saved() {
        let metrics = aggregator();
        assert_eq!(metrics.calculate_cost_saved(1_000_000, TokenKind::Input), 3.0);
        assert_eq!(metrics.calculate_cost_saved(1_000_000, TokenKind::Output), 15.0);
        assert_eq!(metrics.calculate_cost_saved(0, TokenKind::Input), 0.0);
    }

    #[test]
    fn test_reset() {
        let metrics = aggregator();
        metrics.record_request("a", 1, 1, 1.0);
        metrics.record_request("b", 1, 1, 1.0);

        metrics.reset_session("a");
        assert_eq!(metrics.get_global_metrics().sessions, 1);

        metrics.reset_all();
        assert_eq!(metrics.get_global_metrics().sessions, 0);
    }
}
