//! Memory record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to every remembered utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Chat role of the message ("user", "assistant", "system", ...)
    pub role: String,
    /// Session the record was stored under
    pub session_key: String,
}

impl RecordMetadata {
    pub fn new(role: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            session_key: session_key.into(),
        }
    }
}

/// One remembered utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier for this record
    pub id: Uuid,
    /// The original content, unmodified
    pub verbatim: String,
    /// Compressed paraphrase, when the engine produced one
    pub gist: Option<String>,
    /// Salience score in [0, 1]
    pub importance: f32,
    /// Role and session tags
    pub metadata: RecordMetadata,
    /// How many times the same utterance was remembered again
    pub reinforcements: u32,
    /// When this record was first stored
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(verbatim: String, importance: f32, metadata: RecordMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            verbatim,
            gist: None,
            importance: importance.clamp(0.0, 1.0),
            metadata,
            reinforcements: 0,
            created_at: Utc::now(),
        }
    }

    /// Text to send upstream: the gist when present, otherwise the verbatim
    /// content. `None` when the record carries no usable text.
    pub fn content(&self) -> Option<&str> {
        self.gist
            .as_deref()
            .filter(|g| !g.trim().is_empty())
            .or_else(|| Some(self.verbatim.as_str()).filter(|v| !v.trim().is_empty()))
    }

    pub fn role(&self) -> &str {
        &self.metadata.role
    }
}
