//! In-process memory engine
//!
//! A small, dependency-free engine that keeps every session's records in a
//! vector. Importance comes from the message role, repeated utterances are
//! reinforced rather than duplicated, optional decay forgets stale records,
//! and the retention profile decides how aggressively long records are
//! replaced by a gist.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{MemoryRecord, RecordMetadata};
use super::{MemoryContext, MemoryEngine};
use crate::config::MemoryConfig;
use crate::error::{ProxyError, Result};

/// Snapshot format version written by [`LocalMemory::snapshot`]
pub const SNAPSHOT_VERSION: u32 = 1;

/// Importance multiplier applied to older records on every new record
const DECAY_FACTOR: f32 = 0.95;

/// Importance added each time an utterance is remembered again
const REINFORCEMENT_BONUS: f32 = 0.1;

/// How aggressively long records are summarized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionProfile {
    /// Never replace content with a gist
    Quality,
    /// Gist only very long records
    Balanced,
    /// Gist anything over the compression threshold
    Cost,
}

impl RetentionProfile {
    /// Parse a profile name; unknown names fall back to `Quality`
    pub fn parse(name: &str) -> Self {
        match name.to_uppercase().as_str() {
            "BALANCED" => RetentionProfile::Balanced,
            "COST" | "COST_FOCUSED" => RetentionProfile::Cost,
            _ => RetentionProfile::Quality,
        }
    }

    /// Word count above which a record gets a gist, if ever
    fn gist_threshold(self, compression_threshold: usize) -> Option<usize> {
        match self {
            RetentionProfile::Quality => None,
            RetentionProfile::Balanced => Some(compression_threshold.saturating_mul(4)),
            RetentionProfile::Cost => Some(compression_threshold),
        }
    }
}

/// Policy shared by every context an engine creates
#[derive(Debug, Clone)]
struct Policy {
    enable_decay: bool,
    profile: RetentionProfile,
    compression_threshold: usize,
    min_importance: f32,
}

/// Engine building [`LocalMemory`] contexts from the `[memory]` config
#[derive(Debug, Clone)]
pub struct LocalMemoryEngine {
    policy: Policy,
}

impl LocalMemoryEngine {
    pub fn new(config: &MemoryConfig) -> Self {
        let policy = Policy {
            enable_decay: config.enable_decay,
            profile: RetentionProfile::parse(&config.reward_profile),
            compression_threshold: config.compression_threshold.max(1),
            min_importance: config.min_importance,
        };
        tracing::debug!(
            profile = ?policy.profile,
            decay = policy.enable_decay,
            compression_threshold = policy.compression_threshold,
            "Local memory engine configured"
        );
        Self { policy }
    }
}

impl MemoryEngine for LocalMemoryEngine {
    fn create(&self) -> Box<dyn MemoryContext> {
        Box::new(LocalMemory {
            policy: self.policy.clone(),
            records: Vec::new(),
        })
    }

    fn restore(&self, blob: &[u8]) -> Result<Box<dyn MemoryContext>> {
        let snapshot: LocalSnapshot = serde_json::from_slice(blob)
            .map_err(|e| ProxyError::Serialization(format!("Invalid memory snapshot: {e}")))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ProxyError::Memory(format!(
                "Unsupported memory snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }

        Ok(Box::new(LocalMemory {
            policy: self.policy.clone(),
            records: snapshot.records,
        }))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[derive(Serialize, Deserialize)]
struct LocalSnapshot {
    version: u32,
    records: Vec<MemoryRecord>,
}

/// One session's records, oldest first
pub struct LocalMemory {
    policy: Policy,
    records: Vec<MemoryRecord>,
}

impl LocalMemory {
    fn apply_decay(&mut self) {
        if !self.policy.enable_decay {
            return;
        }

        for record in &mut self.records {
            record.importance *= DECAY_FACTOR;
        }

        let floor = self.policy.min_importance;
        let before = self.records.len();
        self.records.retain(|r| r.importance >= floor);
        let forgotten = before - self.records.len();
        if forgotten > 0 {
            tracing::debug!(forgotten, "Decayed records dropped below importance floor");
        }
    }
}

#[async_trait]
impl MemoryContext for LocalMemory {
    async fn remember(&mut self, content: &str, metadata: RecordMetadata) -> Result<MemoryRecord> {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.metadata.role == metadata.role && r.verbatim == content)
        {
            existing.importance = (existing.importance + REINFORCEMENT_BONUS).min(1.0);
            existing.reinforcements += 1;
            return Ok(existing.clone());
        }

        self.apply_decay();

        let importance = initial_importance(&metadata.role, content);
        let mut record = MemoryRecord::new(content.to_string(), importance, metadata);
        if let Some(threshold) = self
            .policy
            .profile
            .gist_threshold(self.policy.compression_threshold)
        {
            record.gist = make_gist(content, threshold, self.policy.compression_threshold);
        }

        self.records.push(record.clone());
        Ok(record)
    }

    async fn recall(
        &mut self,
        query: &str,
        min_importance: f32,
        top_k: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let query = query.trim().to_lowercase();

        let matching: Vec<&MemoryRecord> = self
            .records
            .iter()
            .filter(|r| r.importance >= min_importance)
            .filter(|r| {
                query.is_empty()
                    || r.verbatim.to_lowercase().contains(&query)
                    || r.gist
                        .as_deref()
                        .is_some_and(|g| g.to_lowercase().contains(&query))
            })
            .collect();

        let skip = matching.len().saturating_sub(top_k);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&LocalSnapshot {
            version: SNAPSHOT_VERSION,
            records: self.records.clone(),
        })
        .map_err(|e| ProxyError::Serialization(format!("Failed to serialize memory: {e}")))
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Role-based salience with a small bonus for substantive content
fn initial_importance(role: &str, content: &str) -> f32 {
    let base = match role {
        "system" => 0.9,
        "user" => 0.7,
        "assistant" => 0.5,
        _ => 0.4,
    };
    let words = content.split_whitespace().count() as f32;
    (base + (words / 500.0).min(0.1)).min(1.0)
}

/// Leading sentence of `content`, capped at `max_words` words.
///
/// Returns `None` when the content is at or under `threshold` words or the
/// gist would not be shorter than the original.
fn make_gist(content: &str, threshold: usize, max_words: usize) -> Option<String> {
    let total_words = content.split_whitespace().count();
    if total_words <= threshold {
        return None;
    }

    let first_sentence = content
        .char_indices()
        .find(|&(i, c)| {
            matches!(c, '.' | '!' | '?')
                && content[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace)
        })
        .map(|(i, c)| &content[..i + c.len_utf8()])
        .unwrap_or(content);

    let words: Vec<&str> = first_sentence.split_whitespace().take(max_words).collect();
    if words.is_empty() || words.len() >= total_words {
        return None;
    }

    let mut gist = words.join(" ");
    if words.len() == max_words && !gist.ends_with(['.', '!', '?']) {
        gist.push_str("...");
    }
    Some(gist)
}
