//! Integration tests for crash isolation: one tab's death never takes
//! the host, the registry, or its neighbors with it.

use std::sync::Arc;

use tabgate::crash::CrashReporter;
use tabgate::events::EventBroadcaster;
use tabgate::policy::{GatePolicy, PolicyEngine, ResourceKind};
use tabgate::storage::Storage;
use tabgate::tabs::{EdgeMode, TabRegistry, TabState, TabSupervisor};
use tempfile::TempDir;
use tokio::sync::RwLock;
use url::Url;

struct Fixture {
    registry: Arc<RwLock<TabRegistry>>,
    supervisor: TabSupervisor,
    storage: Arc<Storage>,
    bus: EventBroadcaster,
}

async fn fixture(dir: &TempDir) -> Fixture {
    let bus = EventBroadcaster::new();
    let engine = Arc::new(PolicyEngine::in_memory(GatePolicy::default()));
    let registry = Arc::new(RwLock::new(TabRegistry::new(
        engine,
        bus.clone(),
        EdgeMode::Block,
        0,
    )));
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let reporter = Arc::new(CrashReporter::new(storage.clone(), bus.clone()));
    let supervisor = TabSupervisor::new(registry.clone(), reporter);
    Fixture {
        registry,
        supervisor,
        storage,
        bus,
    }
}

#[tokio::test]
async fn panicking_tab_is_contained_and_reported() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir).await;

    let (victim, bystander) = {
        let mut reg = f.registry.write().await;
        let victim = reg
            .open(Some(Url::parse("https://victim.org/").unwrap()), true)
            .unwrap();
        let bystander = reg
            .open(Some(Url::parse("https://bystander.org/").unwrap()), false)
            .unwrap();
        (victim, bystander)
    };

    let mut rx = f.bus.subscribe();

    // The tab's driver panics mid-load.
    f.supervisor
        .supervise(victim, async { panic!("use-after-free in renderer") })
        .await;

    // 1. Only the victim is crashed.
    {
        let reg = f.registry.read().await;
        assert_eq!(reg.get(victim).unwrap().state, TabState::Crashed);
        assert_eq!(reg.get(bystander).unwrap().state, TabState::Dormant);
    }

    // 2. A crash report exists, with a fingerprint instead of the URL.
    let reports = f.storage.list_crash_reports().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].reason.contains("use-after-free"));
    let fp = reports[0].url_fingerprint.as_deref().unwrap();
    assert!(!fp.contains("victim.org"));

    // 3. The crash was announced on the bus.
    let mut saw_crash_event = false;
    while let Ok(n) = rx.try_recv() {
        if n.event == "tab.crashed" {
            saw_crash_event = true;
        }
    }
    assert!(saw_crash_event, "tab.crashed should be published");
}

#[tokio::test]
async fn registry_stays_usable_after_a_crash() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir).await;

    let victim = {
        let mut reg = f.registry.write().await;
        reg.open(Some(Url::parse("https://victim.org/").unwrap()), true)
            .unwrap()
    };

    f.supervisor
        .supervise(victim, async { panic!("boom") })
        .await;

    // Life goes on: open, load, and gate new tabs normally.
    let mut reg = f.registry.write().await;
    let fresh = reg
        .open(Some(Url::parse("https://fresh.org/").unwrap()), true)
        .unwrap();
    let d = reg
        .request_resource(
            fresh,
            Url::parse("https://fresh.org/app.js").unwrap(),
            ResourceKind::Script,
        )
        .unwrap();
    assert!(d.is_allowed());
    reg.finish_load(fresh).unwrap();

    // And the crashed tab can be explicitly reloaded.
    reg.reload(victim).unwrap();
    assert_eq!(reg.get(victim).unwrap().state, TabState::Loading);
}

#[tokio::test]
async fn crashed_tab_session_still_saves() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir).await;

    {
        let mut reg = f.registry.write().await;
        let a = reg
            .open(Some(Url::parse("https://a.org/").unwrap()), true)
            .unwrap();
        reg.finish_load(a).unwrap();
        let b = reg
            .open(Some(Url::parse("https://b.org/").unwrap()), false)
            .unwrap();
        reg.focus(b).unwrap();
    }

    let victim = {
        let reg = f.registry.read().await;
        reg.tabs()[0].id
    };
    f.supervisor
        .supervise(victim, async { panic!("boom") })
        .await;

    // The session, crashed tab included, is still snapshot-able.
    let manager = tabgate::session::SessionManager::new(
        f.storage.clone(),
        f.registry.clone(),
        f.bus.clone(),
        tabgate::config::SessionConfig::default(),
    );
    let row = manager.save("post-crash", "manual").await.unwrap();
    assert_eq!(row.tab_count, 2);

    let tabs = f.storage.session_tabs(&row.id).await.unwrap();
    assert_eq!(tabs[0].state, "crashed");
}
