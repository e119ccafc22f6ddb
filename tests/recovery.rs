//! Integration tests for session recovery on host restart.
//! These tests use Storage and the session manager directly (no real
//! embedder needed) — they run in CI.

use std::sync::Arc;

use tabgate::config::SessionConfig;
use tabgate::events::EventBroadcaster;
use tabgate::policy::{GatePolicy, PolicyEngine};
use tabgate::session::{SessionLock, SessionManager};
use tabgate::storage::Storage;
use tabgate::tabs::{EdgeMode, TabRegistry, TabState};
use tempfile::TempDir;
use tokio::sync::RwLock;

fn registry() -> Arc<RwLock<TabRegistry>> {
    let engine = Arc::new(PolicyEngine::in_memory(GatePolicy::default()));
    Arc::new(RwLock::new(TabRegistry::new(
        engine,
        EventBroadcaster::new(),
        EdgeMode::Block,
        0,
    )))
}

fn manager(storage: Arc<Storage>, registry: Arc<RwLock<TabRegistry>>) -> SessionManager {
    SessionManager::new(
        storage,
        registry,
        EventBroadcaster::new(),
        SessionConfig::default(),
    )
}

#[tokio::test]
async fn mid_load_session_restores_dormant() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());

    // 1. A session with a tab that was still loading when it was saved
    //    (simulates a crash mid-load).
    storage
        .save_session(
            "autosave",
            "autosave",
            Some(0),
            &[
                (
                    Some("https://slow.example.org/".to_string()),
                    String::new(),
                    "loading".to_string(),
                ),
                (
                    Some("https://done.example.org/".to_string()),
                    "Done".to_string(),
                    "loaded".to_string(),
                ),
            ],
        )
        .await
        .unwrap();

    // 2. Simulate restart: fresh storage + registry over the same dir.
    let storage2 = Arc::new(Storage::new(dir.path()).await.unwrap());
    let reg = registry();
    let mgr = manager(storage2, reg.clone());

    let row = mgr.restore_latest().await.unwrap().expect("snapshot found");
    assert_eq!(row.tab_count, 2);

    // 3. Nothing auto-retries: every tab is dormant, including the one
    //    that was mid-load.
    let guard = reg.read().await;
    assert_eq!(guard.len(), 2);
    for tab in guard.tabs() {
        assert_eq!(tab.state, TabState::Dormant, "no load before focus");
    }
    assert_eq!(guard.focused_index(), Some(0));
}

#[tokio::test]
async fn stale_lock_round_trip_records_unclean_shutdown() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());

    // 1. First run acquires the lock and never releases it (crash).
    let (lock, stale) = SessionLock::acquire(dir.path()).unwrap();
    assert!(!stale);
    std::mem::forget(lock);

    // 2. Second run detects the stale marker and records the crash.
    let (lock2, stale2) = SessionLock::acquire(dir.path()).unwrap();
    assert!(stale2);
    if stale2 {
        let reporter =
            tabgate::crash::CrashReporter::new(storage.clone(), EventBroadcaster::new());
        reporter.record(None, "host did not shut down cleanly").await;
    }

    let reports = storage.list_crash_reports().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].url_fingerprint.is_none());

    // 3. Clean shutdown clears the marker for the next run.
    lock2.release();
    let (_lock3, stale3) = SessionLock::acquire(dir.path()).unwrap();
    assert!(!stale3);
}

#[tokio::test]
async fn autosaves_rotate_but_latest_always_restores() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let reg = registry();
    let mgr = SessionManager::new(
        storage.clone(),
        reg.clone(),
        EventBroadcaster::new(),
        SessionConfig {
            keep_snapshots: 2,
            ..SessionConfig::default()
        },
    );

    // Three autosave cycles with a growing tab strip.
    for i in 0..3 {
        {
            let mut guard = reg.write().await;
            guard
                .open(
                    Some(url::Url::parse(&format!("https://site{i}.org/")).unwrap()),
                    false,
                )
                .unwrap();
        }
        mgr.autosave().await.unwrap();
    }

    // Keep-count pruning applied.
    assert_eq!(storage.count_sessions().await.unwrap(), 2);

    // The newest snapshot has all three tabs.
    {
        let mut guard = reg.write().await;
        guard.restore_tabs(Vec::new(), None);
    }
    let row = mgr.restore_latest().await.unwrap().unwrap();
    assert_eq!(row.tab_count, 3);
    assert_eq!(reg.read().await.len(), 3);
}

#[tokio::test]
async fn crashed_tabs_restore_clean() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let reg = registry();
    let mgr = manager(storage, reg.clone());

    {
        let mut guard = reg.write().await;
        let a = guard
            .open(Some(url::Url::parse("https://a.org/").unwrap()), true)
            .unwrap();
        guard.finish_load(a).unwrap();
        guard.mark_crashed(a, "renderer gone").unwrap();
    }
    mgr.save("after-crash", "manual").await.unwrap();

    {
        let mut guard = reg.write().await;
        guard.restore_tabs(Vec::new(), None);
    }
    mgr.restore_named("after-crash").await.unwrap().unwrap();

    // Crash state is a report, not persistent tab state.
    let guard = reg.read().await;
    assert_eq!(guard.tabs()[0].state, TabState::Dormant);
}
