//! Integration tests for lazy loading and governor suspension: tabs
//! load only when focused, and pressure puts background tabs back to
//! sleep.

use std::sync::Arc;

use tabgate::config::ResourceConfig;
use tabgate::events::EventBroadcaster;
use tabgate::governor::{suspend_for_pressure, PressureLevel, TabGovernor};
use tabgate::policy::{GatePolicy, PolicyEngine, ResourceKind};
use tabgate::storage::Storage;
use tabgate::tabs::{EdgeMode, TabRegistry, TabState};
use tempfile::TempDir;
use tokio::sync::RwLock;
use url::Url;

fn registry(edge_mode: EdgeMode) -> Arc<RwLock<TabRegistry>> {
    let engine = Arc::new(PolicyEngine::in_memory(GatePolicy::default()));
    Arc::new(RwLock::new(TabRegistry::new(
        engine,
        EventBroadcaster::new(),
        edge_mode,
        0,
    )))
}

#[tokio::test]
async fn background_tabs_do_no_work_until_focused() {
    let reg = registry(EdgeMode::Block);
    let mut guard = reg.write().await;

    let front = guard
        .open(Some(Url::parse("https://front.org/").unwrap()), true)
        .unwrap();
    let back = guard
        .open(Some(Url::parse("https://back.org/").unwrap()), false)
        .unwrap();

    // The background tab is inert: dormant, zero requests possible.
    assert_eq!(guard.get(back).unwrap().state, TabState::Dormant);
    assert!(guard
        .request_resource(back, Url::parse("https://back.org/x").unwrap(), ResourceKind::Image)
        .is_err());

    // The foreground tab is loading and gated normally.
    assert_eq!(guard.get(front).unwrap().state, TabState::Loading);
    let d = guard
        .request_resource(
            front,
            Url::parse("https://front.org/app.js").unwrap(),
            ResourceKind::Script,
        )
        .unwrap();
    assert!(d.is_allowed());

    // First focus wakes the background tab.
    guard.focus(back).unwrap();
    assert_eq!(guard.get(back).unwrap().state, TabState::Loading);
}

#[tokio::test]
async fn focus_traversal_respects_edge_mode() {
    let reg = registry(EdgeMode::Wrap);
    let mut guard = reg.write().await;

    let a = guard
        .open(Some(Url::parse("https://a.org/").unwrap()), true)
        .unwrap();
    let _b = guard
        .open(Some(Url::parse("https://b.org/").unwrap()), false)
        .unwrap();
    let c = guard
        .open(Some(Url::parse("https://c.org/").unwrap()), false)
        .unwrap();

    guard.focus(a).unwrap();
    assert_eq!(guard.focus_prev().unwrap(), c, "wrap from first to last");
    assert_eq!(guard.focus_next().unwrap(), a, "and back around");
}

#[tokio::test]
async fn pressure_suspends_lru_and_refocus_reloads() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let governor = TabGovernor::new(ResourceConfig::default(), storage);
    let reg = registry(EdgeMode::Block);

    let (oldest, newer, focused) = {
        let mut guard = reg.write().await;
        let mut open_loaded = |host: &str| {
            let id = guard
                .open(Some(Url::parse(&format!("https://{host}/")).unwrap()), false)
                .unwrap();
            guard.focus(id).unwrap();
            guard.finish_load(id).unwrap();
            id
        };
        let oldest = open_loaded("old.org");
        let newer = open_loaded("new.org");
        let focused = open_loaded("front.org");
        (oldest, newer, focused)
    };

    // Warning pressure: exactly one tab — the least recently focused.
    let n = suspend_for_pressure(&governor, &reg, PressureLevel::Warning).await;
    assert_eq!(n, 1);
    {
        let guard = reg.read().await;
        assert_eq!(guard.get(oldest).unwrap().state, TabState::Suspended);
        assert_eq!(guard.get(newer).unwrap().state, TabState::Loaded);
        assert_eq!(guard.get(focused).unwrap().state, TabState::Loaded);
    }

    // Emergency: every background tab, never the focused one.
    let n = suspend_for_pressure(&governor, &reg, PressureLevel::Emergency).await;
    assert_eq!(n, 1);
    {
        let guard = reg.read().await;
        assert_eq!(guard.get(newer).unwrap().state, TabState::Suspended);
        assert_eq!(guard.get(focused).unwrap().state, TabState::Loaded);
    }

    // Suspension is lossless: refocusing reloads from the kept URL.
    {
        let mut guard = reg.write().await;
        guard.focus(oldest).unwrap();
        let tab = guard.get(oldest).unwrap();
        assert_eq!(tab.state, TabState::Loading);
        assert_eq!(tab.url.as_ref().unwrap().as_str(), "https://old.org/");
    }
}

#[tokio::test]
async fn normal_pressure_suspends_nothing() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let governor = TabGovernor::new(ResourceConfig::default(), storage);
    let reg = registry(EdgeMode::Block);

    {
        let mut guard = reg.write().await;
        let id = guard
            .open(Some(Url::parse("https://a.org/").unwrap()), false)
            .unwrap();
        guard.focus(id).unwrap();
        guard.finish_load(id).unwrap();
        let id2 = guard
            .open(Some(Url::parse("https://b.org/").unwrap()), false)
            .unwrap();
        guard.focus(id2).unwrap();
        guard.finish_load(id2).unwrap();
    }

    let n = suspend_for_pressure(&governor, &reg, PressureLevel::Normal).await;
    assert_eq!(n, 0);
    let guard = reg.read().await;
    assert!(guard.tabs().iter().all(|t| t.state == TabState::Loaded));
}
