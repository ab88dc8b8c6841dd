//! Memory engine boundary
//!
//! The proxy talks to the memory engine only through [`MemoryEngine`] (build
//! or restore a per-session context) and [`MemoryContext`] (remember, recall,
//! snapshot). Scoring, decay and gist extraction live behind these traits.

pub mod local;
pub mod types;

pub use local::{LocalMemoryEngine, RetentionProfile};
pub use types::{MemoryRecord, RecordMetadata};

use async_trait::async_trait;

use crate::error::Result;

/// One session's stateful memory
#[async_trait]
pub trait MemoryContext: Send + Sync {
    /// Store one utterance and return the record that now represents it
    async fn remember(&mut self, content: &str, metadata: RecordMetadata) -> Result<MemoryRecord>;

    /// Records matching `query` (empty = everything) with importance of at
    /// least `min_importance`, at most `top_k`, oldest first
    async fn recall(
        &mut self,
        query: &str,
        min_importance: f32,
        top_k: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// Serialize the whole context to an engine-defined durable blob
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Number of records currently held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory for memory contexts; policy knobs are fixed at construction
pub trait MemoryEngine: Send + Sync {
    /// A fresh, empty context
    fn create(&self) -> Box<dyn MemoryContext>;

    /// Rebuild a context from a blob produced by [`MemoryContext::snapshot`]
    fn restore(&self, blob: &[u8]) -> Result<Box<dyn MemoryContext>>;

    /// Engine name for logging
    fn name(&self) -> &'static str;
}
