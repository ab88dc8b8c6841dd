//! Integration tests for per-credential sessions
//!
//! Covers key derivation, memory isolation between credentials, eviction,
//! snapshot persistence, and serialization of concurrent requests on one key.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;

use memproxy::config::MemoryConfig;
use memproxy::memory::{LocalMemoryEngine, MemoryEngine, RecordMetadata};
use memproxy::session::{
    SessionKey, SessionRegistry, SnapshotStore, generate_session_key,
};

// =============================================================================
// Test Fixtures and Helpers
// =============================================================================

fn engine() -> Arc<dyn MemoryEngine> {
    Arc::new(LocalMemoryEngine::new(&MemoryConfig::default()))
}

fn persistent_registry(dir: &std::path::Path) -> SessionRegistry {
    SessionRegistry::new(engine(), Some(SnapshotStore::new(dir)))
}

async fn remember(registry: &SessionRegistry, key: &SessionKey, content: &str) {
    let mut guard = registry.acquire(key).await;
    guard
        .remember(content, RecordMetadata::new("user", key.as_str()))
        .await
        .unwrap();
}

async fn recall_all(registry: &SessionRegistry, key: &SessionKey) -> Vec<String> {
    let mut guard = registry.acquire(key).await;
    guard
        .recall("", 0.0, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.verbatim)
        .collect()
}

// =============================================================================
// Key Derivation Tests
// =============================================================================

#[test]
fn test_same_credential_same_key() {
    assert_eq!(
        generate_session_key("sk-ant-api03-abc"),
        generate_session_key("sk-ant-api03-abc")
    );
}

#[test]
fn test_keys_are_unique_across_credentials() {
    let keys: std::collections::HashSet<SessionKey> = (0..500)
        .map(|i| generate_session_key(&format!("sk-test-{i}")))
        .collect();
    assert_eq!(keys.len(), 500);
}

#[test]
fn test_generated_key_is_valid_session_key() {
    let key = generate_session_key("AIzaSyExample");
    assert_eq!(SessionKey::try_from(key.as_str()).unwrap(), key);
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[tokio::test]
async fn test_sessions_are_isolated() {
    let registry = SessionRegistry::new(engine(), None);
    let alice = generate_session_key("sk-alice");
    let bob = generate_session_key("sk-bob");

    remember(&registry, &alice, "alice likes tea").await;
    remember(&registry, &bob, "bob likes coffee").await;

    assert_eq!(recall_all(&registry, &alice).await, vec!["alice likes tea"]);
    assert_eq!(recall_all(&registry, &bob).await, vec!["bob likes coffee"]);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[tokio::test]
async fn test_evicted_session_reloads_from_snapshot() {
    let dir = tempdir().unwrap();
    let registry = persistent_registry(dir.path());
    let key = generate_session_key("sk-ant-test");

    remember(&registry, &key, "remember me").await;

    let evicted = registry
        .cleanup_expired(Utc::now() + chrono::Duration::hours(2), Duration::from_secs(3600))
        .await;
    assert_eq!(evicted, 1);
    assert!(registry.is_empty());
    assert!(dir.path().join(format!("{key}.snapshot")).exists());

    assert_eq!(recall_all(&registry, &key).await, vec!["remember me"]);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_persist_all_survives_restart() {
    let dir = tempdir().unwrap();
    let key = generate_session_key("sk-ant-test");

    {
        let registry = persistent_registry(dir.path());
        remember(&registry, &key, "first").await;
        remember(&registry, &key, "second").await;
        assert_eq!(registry.persist_all().await, 1);
    }

    let restarted = persistent_registry(dir.path());
    assert_eq!(restarted.stats().await.persisted_sessions, 1);
    assert_eq!(recall_all(&restarted, &key).await, vec!["first", "second"]);
}

#[tokio::test]
async fn test_corrupt_snapshot_is_cold_start() {
    let dir = tempdir().unwrap();
    let key = generate_session_key("sk-ant-test");
    std::fs::write(dir.path().join(format!("{key}.snapshot")), b"\x00garbage").unwrap();

    let registry = persistent_registry(dir.path());
    assert!(recall_all(&registry, &key).await.is_empty());

    // The session is usable and the next snapshot replaces the bad file
    remember(&registry, &key, "fresh start").await;
    registry.persist_all().await;

    let restarted = persistent_registry(dir.path());
    assert_eq!(recall_all(&restarted, &key).await, vec!["fresh start"]);
}

#[tokio::test]
async fn test_eviction_without_persistence_forgets() {
    let registry = SessionRegistry::new(engine(), None);
    let key = generate_session_key("sk-ant-test");
    remember(&registry, &key, "ephemeral").await;

    registry
        .cleanup_expired(Utc::now() + chrono::Duration::hours(2), Duration::from_secs(60))
        .await;

    assert!(recall_all(&registry, &key).await.is_empty());
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_requests_serialize() {
    let registry = Arc::new(SessionRegistry::new(engine(), None));
    let key = generate_session_key("sk-shared");
    let in_flight = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..20 {
        let registry = Arc::clone(&registry);
        let key = key.clone();
        let in_flight = Arc::clone(&in_flight);
        handles.push(tokio::spawn(async move {
            let mut guard = registry.acquire(&key).await;
            assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(2)).await;
            guard
                .remember(&format!("message {i}"), RecordMetadata::new("user", key.as_str()))
                .await
                .unwrap();
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.len(), 1);
    assert_eq!(recall_all(&registry, &key).await.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_different_keys_do_not_block() {
    let registry = SessionRegistry::new(engine(), None);
    let a = generate_session_key("sk-a");
    let b = generate_session_key("sk-b");

    let _held = registry.acquire(&a).await;
    let other = tokio::time::timeout(Duration::from_secs(1), registry.acquire(&b)).await;
    assert!(other.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_first_use_creates_one_session() {
    let registry = Arc::new(SessionRegistry::new(engine(), None));
    let key = generate_session_key("sk-race");

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let key = key.clone();
            tokio::spawn(async move { registry.get_or_create(&key).await })
        })
        .collect();

    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap());
    }

    assert_eq!(registry.len(), 1);
    assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cleanup_waits_for_in_flight_request() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(persistent_registry(dir.path()));
    let key = generate_session_key("sk-busy");

    let mut guard = registry.acquire(&key).await;

    let cleanup = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry
                .cleanup_expired(Utc::now() + chrono::Duration::hours(2), Duration::from_secs(60))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!cleanup.is_finished());
    assert!(registry.contains(&key));

    guard
        .remember("written mid-request", RecordMetadata::new("user", key.as_str()))
        .await
        .unwrap();
    drop(guard);

    assert_eq!(cleanup.await.unwrap(), 1);
    assert!(registry.is_empty());

    // The record written under the guard was persisted before eviction
    assert_eq!(recall_all(&registry, &key).await, vec!["written mid-request"]);
}
