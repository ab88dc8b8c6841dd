//! Session registry
//!
//! Maps session keys to live [`Session`]s. The map itself is a sharded
//! [`DashMap`] whose locks are only held for lookups and inserts; every
//! session additionally carries its own async mutex, held for the duration of
//! the memory-engine calls of one request. Requests on the same key
//! serialize on that mutex while different keys never contend.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::{SessionKey, SnapshotStore};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::memory::{MemoryContext, MemoryEngine, MemoryRecord, RecordMetadata};

/// Mutable per-session state, only reachable through the session mutex
struct SessionState {
    context: Box<dyn MemoryContext>,
    /// Records were added since the last successful snapshot
    dirty: bool,
    /// Removed from the registry; holders must re-resolve the key
    evicted: bool,
}

/// One credential's memory context plus bookkeeping
pub struct Session {
    key: SessionKey,
    state: Arc<Mutex<SessionState>>,
    created_at: DateTime<Utc>,
    /// Milliseconds since the Unix epoch
    last_activity: AtomicI64,
}

impl Session {
    fn new(key: SessionKey, context: Box<dyn MemoryContext>) -> Self {
        let now = Utc::now();
        Self {
            key,
            state: Arc::new(Mutex::new(SessionState {
                context,
                dirty: false,
                evicted: false,
            })),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Acquire))
            .unwrap_or(self.created_at)
    }

    fn touch(&self) {
        self.last_activity
            .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
    }

    fn is_idle(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        let idle_ms = now.timestamp_millis() - self.last_activity.load(Ordering::Acquire);
        idle_ms >= 0 && idle_ms as u128 >= idle_timeout.as_millis()
    }
}

/// Exclusive access to one session's memory context
///
/// Dropping the guard releases the session for the next request on the same
/// key.
pub struct SessionGuard {
    session: Arc<Session>,
    state: OwnedMutexGuard<SessionState>,
}

impl SessionGuard {
    pub fn key(&self) -> &SessionKey {
        &self.session.key
    }

    pub async fn remember(&mut self, content: &str, metadata: RecordMetadata) -> Result<MemoryRecord> {
        let record = self.state.context.remember(content, metadata).await?;
        self.state.dirty = true;
        Ok(record)
    }

    pub async fn recall(
        &mut self,
        query: &str,
        min_importance: f32,
        top_k: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.state.context.recall(query, min_importance, top_k).await
    }

    /// Number of records in this session's context
    pub fn len(&self) -> usize {
        self.state.context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.context.is_empty()
    }
}

/// Snapshot of registry occupancy for `/health` and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub persisted_sessions: usize,
}

/// Keyed map of live sessions with optional snapshot persistence
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<Session>>,
    engine: Arc<dyn MemoryEngine>,
    store: Option<SnapshotStore>,
}

impl SessionRegistry {
    /// Create a registry. Without a store, sessions live only in memory.
    pub fn new(engine: Arc<dyn MemoryEngine>, store: Option<SnapshotStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            engine,
            store,
        }
    }

    /// Create a registry from the `[session]` config section
    pub fn from_config(config: &SessionConfig, engine: Arc<dyn MemoryEngine>) -> Self {
        let store = config
            .persist_memory
            .then(|| SnapshotStore::new(config.memory_dir.clone()));

        match &store {
            Some(store) => tracing::info!(
                engine = engine.name(),
                "Session persistence enabled at {}",
                store.dir().display()
            ),
            None => tracing::info!(engine = engine.name(), "Session persistence disabled"),
        }

        Self::new(engine, store)
    }

    /// Number of sessions currently in memory
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Resolve the live session for `key`, loading its snapshot or creating
    /// an empty context on first use.
    pub async fn get_or_create(&self, key: &SessionKey) -> Arc<Session> {
        let existing = self.sessions.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(session) = existing {
            session.touch();
            return session;
        }

        let context = self.load_context(key).await;

        // A racing creator may have inserted first; whichever got in wins and
        // the other context is dropped unused.
        let session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Session::new(key.clone(), context)))
            .value()
            .clone();
        session.touch();
        session
    }

    /// Lock the session for `key`.
    ///
    /// If the session was evicted between lookup and lock, the key is
    /// resolved again so the caller never writes into a dead context.
    pub async fn acquire(&self, key: &SessionKey) -> SessionGuard {
        loop {
            let session = self.get_or_create(key).await;
            let state = Arc::clone(&session.state).lock_owned().await;

            if state.evicted {
                tracing::debug!(session = key.short(), "Session evicted while waiting, retrying");
                continue;
            }

            session.touch();
            return SessionGuard { session, state };
        }
    }

    async fn load_context(&self, key: &SessionKey) -> Box<dyn MemoryContext> {
        let Some(store) = &self.store else {
            return self.engine.create();
        };

        match store.load(key).await {
            Ok(Some(blob)) => match self.engine.restore(&blob) {
                Ok(context) => {
                    tracing::info!(
                        session = key.short(),
                        records = context.len(),
                        "Restored session from snapshot"
                    );
                    context
                }
                Err(e) => {
                    tracing::warn!(
                        session = key.short(),
                        "Corrupt snapshot, starting with empty memory: {e}"
                    );
                    self.engine.create()
                }
            },
            Ok(None) => {
                tracing::debug!(session = key.short(), "Creating new session");
                self.engine.create()
            }
            Err(e) => {
                tracing::warn!(
                    session = key.short(),
                    "Unreadable snapshot, starting with empty memory: {e}"
                );
                self.engine.create()
            }
        }
    }

    /// Evict every session idle for at least `idle_timeout` as of `now`,
    /// persisting dirty ones first. Returns the number evicted.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>, idle_timeout: Duration) -> usize {
        let candidates: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle(now, idle_timeout))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = 0;
        for session in candidates {
            let mut state = session.state.lock().await;

            // A request may have touched the session while we waited
            if state.evicted || !session.is_idle(now, idle_timeout) {
                continue;
            }

            if state.dirty {
                match self.persist_state(&session.key, &state).await {
                    Ok(true) => state.dirty = false,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        session = session.key.short(),
                        "Failed to persist session before eviction: {e}"
                    ),
                }
            }

            state.evicted = true;
            self.sessions
                .remove_if(&session.key, |_, live| Arc::ptr_eq(live, &session));
            evicted += 1;

            tracing::debug!(
                session = session.key.short(),
                created_at = %session.created_at,
                last_activity = %session.last_activity(),
                "Evicted idle session"
            );
        }

        if evicted > 0 {
            tracing::info!(evicted, remaining = self.sessions.len(), "Cleaned up idle sessions");
        }
        evicted
    }

    /// Write a snapshot for every dirty session. Returns the number written.
    pub async fn persist_all(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut written = 0;
        for session in sessions {
            let blob = {
                let mut state = session.state.lock().await;
                if state.evicted || !state.dirty {
                    continue;
                }
                match state.context.snapshot() {
                    Ok(blob) => {
                        state.dirty = false;
                        blob
                    }
                    Err(e) => {
                        tracing::warn!(session = session.key.short(), "Failed to snapshot session: {e}");
                        continue;
                    }
                }
            };

            match store.save(&session.key, &blob).await {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(session = session.key.short(), "Failed to persist session: {e}");
                    session.state.lock().await.dirty = true;
                }
            }
        }

        if written > 0 {
            tracing::info!(written, "Persisted sessions");
        }
        written
    }

    /// Snapshot and save one locked session; `Ok(false)` without a store
    async fn persist_state(&self, key: &SessionKey, state: &SessionState) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let blob = state.context.snapshot()?;
        store.save(key, &blob).await?;
        Ok(true)
    }

    pub async fn stats(&self) -> SessionStats {
        let persisted_sessions = match &self.store {
            Some(store) => match store.keys().await {
                Ok(keys) => keys.len(),
                Err(e) => {
                    tracing::warn!("Failed to count persisted sessions: {e}");
                    0
                }
            },
            None => 0,
        };

        SessionStats {
            active_sessions: self.sessions.len(),
            persisted_sessions,
        }
    }

    /// Periodically evict idle sessions until the returned handle is aborted
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            tracing::debug!(?interval, ?idle_timeout, "Session cleanup task started");

            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            timer.tick().await;

            loop {
                timer.tick().await;
                registry.cleanup_expired(Utc::now(), idle_timeout).await;
            }
        })
    }
}
