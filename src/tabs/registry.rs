//! Ordered tab registry with focus traversal and the gated load path.
//!
//! The registry owns every open tab and the focus index. Focus is what
//! makes things happen: focusing a `Dormant` or `Suspended` tab starts
//! its load, and every resource request a loading tab makes is routed
//! through the policy engine before it counts.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::{LoadCounters, Tab, TabError, TabId, TabState};
use crate::events::EventBroadcaster;
use crate::policy::decision_log::DecisionEntry;
use crate::policy::{Decision, PolicyEngine, ResourceKind, ResourceRequest};

/// What focus traversal does at the first/last tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeMode {
    /// Stay on the edge tab.
    #[default]
    Block,
    /// Cycle around to the other end.
    Wrap,
}

impl FromStr for EdgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(EdgeMode::Block),
            "wrap" => Ok(EdgeMode::Wrap),
            other => Err(format!("unknown edge mode: {other} (expected block|wrap)")),
        }
    }
}

/// The ordered set of open tabs plus the focus index.
pub struct TabRegistry {
    tabs: Vec<Tab>,
    focused: Option<usize>,
    edge_mode: EdgeMode,
    /// 0 = unlimited.
    max_tabs: usize,
    engine: Arc<PolicyEngine>,
    bus: EventBroadcaster,
}

impl TabRegistry {
    pub fn new(
        engine: Arc<PolicyEngine>,
        bus: EventBroadcaster,
        edge_mode: EdgeMode,
        max_tabs: usize,
    ) -> Self {
        Self {
            tabs: Vec::new(),
            focused: None,
            edge_mode,
            max_tabs,
            engine,
            bus,
        }
    }

    // ── Opening and closing ───────────────────────────────────────────

    /// Open a tab. Foreground opens focus (and therefore load)
    /// immediately; background opens stay `Dormant`.
    pub fn open(&mut self, url: Option<Url>, foreground: bool) -> Result<TabId, TabError> {
        if self.max_tabs > 0 && self.tabs.len() >= self.max_tabs {
            return Err(TabError::TabLimit(self.max_tabs));
        }
        let tab = Tab::new(url.clone());
        let id = tab.id;
        self.tabs.push(tab);
        info!(tab = %id, foreground, "tab opened");
        self.emit(
            "tab.opened",
            json!({ "id": id.to_string(), "url": url.as_ref().map(Url::as_str) }),
        );
        if foreground {
            self.focus(id)?;
        }
        Ok(id)
    }

    /// Close a tab. If it was focused, focus moves to its nearest
    /// neighbor (which loads if it was dormant or suspended).
    pub fn close(&mut self, id: TabId) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        self.tabs.remove(idx);
        self.emit("tab.closed", json!({ "id": id.to_string() }));

        if self.tabs.is_empty() {
            self.focused = None;
            return Ok(());
        }
        match self.focused {
            Some(f) if f > idx => self.focused = Some(f - 1),
            Some(f) if f == idx => {
                self.focused = None;
                let neighbor = self.tabs[idx.min(self.tabs.len() - 1)].id;
                self.focus(neighbor)?;
            }
            _ => {}
        }
        Ok(())
    }

    // ── Focus ─────────────────────────────────────────────────────────

    /// Focus a tab. A `Dormant` or `Suspended` tab starts loading —
    /// this is the whole point of lazy tabs.
    pub fn focus(&mut self, id: TabId) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        self.focused = Some(idx);
        self.tabs[idx].last_focused_at = Some(Utc::now());
        let state = self.tabs[idx].state;
        self.emit("tab.focused", json!({ "id": id.to_string() }));
        if matches!(state, TabState::Dormant | TabState::Suspended) {
            self.begin_load(idx);
        }
        Ok(())
    }

    /// Focus the next tab; [`EdgeMode`] decides what the last tab does.
    pub fn focus_next(&mut self) -> Result<TabId, TabError> {
        self.focus_offset(1)
    }

    /// Focus the previous tab.
    pub fn focus_prev(&mut self) -> Result<TabId, TabError> {
        self.focus_offset(-1)
    }

    pub fn focus_first(&mut self) -> Result<TabId, TabError> {
        let id = self.tabs.first().ok_or(TabError::Empty)?.id;
        self.focus(id)?;
        Ok(id)
    }

    pub fn focus_last(&mut self) -> Result<TabId, TabError> {
        let id = self.tabs.last().ok_or(TabError::Empty)?.id;
        self.focus(id)?;
        Ok(id)
    }

    fn focus_offset(&mut self, offset: isize) -> Result<TabId, TabError> {
        if self.tabs.is_empty() {
            return Err(TabError::Empty);
        }
        let cur = match self.focused {
            Some(i) => i as isize,
            // Nothing focused yet: next goes to the first tab, prev to
            // the last.
            None => {
                return if offset >= 0 {
                    self.focus_first()
                } else {
                    self.focus_last()
                };
            }
        };
        let len = self.tabs.len() as isize;
        let target = cur + offset;
        let idx = if (0..len).contains(&target) {
            target
        } else {
            match self.edge_mode {
                EdgeMode::Block => cur,
                EdgeMode::Wrap => target.rem_euclid(len),
            }
        };
        let id = self.tabs[idx as usize].id;
        self.focus(id)?;
        Ok(id)
    }

    // ── Loading ───────────────────────────────────────────────────────

    /// Point a tab at a new URL and start loading it.
    pub fn navigate(&mut self, id: TabId, url: Url) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        let tab = &mut self.tabs[idx];
        tab.transition(TabState::Loading)?;
        tab.url = Some(url);
        tab.title.clear();
        tab.progress = 0;
        tab.counters = LoadCounters::default();
        let url_str = self.tabs[idx].url.as_ref().map(|u| u.to_string());
        self.emit(
            "tab.loading",
            json!({ "id": id.to_string(), "url": url_str }),
        );
        Ok(())
    }

    /// The gate: one resource request from a tab. The decision is
    /// recorded on the tab's counters and published (with the URL
    /// fingerprinted) for the decision log.
    pub fn request_resource(
        &mut self,
        id: TabId,
        url: Url,
        kind: ResourceKind,
    ) -> Result<Decision, TabError> {
        let idx = self.index_of(id)?;
        let tab = &mut self.tabs[idx];
        if !tab.accepts_requests() {
            return Err(TabError::NotAcceptingRequests(id, tab.state));
        }
        let request = ResourceRequest::new(url, kind);
        let decision = self.engine.decide(tab.url.as_ref(), &request);
        match decision.verdict {
            crate::policy::Verdict::Allow => tab.counters.allowed += 1,
            crate::policy::Verdict::Block => tab.counters.blocked += 1,
            // Unanswered asks do not load; count them separately so the
            // UI can badge them.
            crate::policy::Verdict::Ask => tab.counters.asked += 1,
        }
        debug!(
            tab = %id,
            url = %request.url,
            kind = %kind,
            verdict = %decision.verdict,
            "gate decision"
        );
        let entry = DecisionEntry::new(id, request.url.as_str(), kind.as_str(), &decision);
        self.emit(
            "policy.decision",
            serde_json::to_value(&entry).unwrap_or_default(),
        );
        Ok(decision)
    }

    /// Report load progress (0–100). Monotone within a load: a lower
    /// value than the current one is ignored.
    pub fn set_progress(&mut self, id: TabId, pct: u8) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        let tab = &mut self.tabs[idx];
        if tab.state != TabState::Loading {
            return Err(TabError::NotAcceptingRequests(id, tab.state));
        }
        tab.progress = tab.progress.max(pct.min(100));
        Ok(())
    }

    pub fn set_title(&mut self, id: TabId, title: &str) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        self.tabs[idx].title = title.to_string();
        Ok(())
    }

    pub fn finish_load(&mut self, id: TabId) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        let tab = &mut self.tabs[idx];
        tab.transition(TabState::Loaded)?;
        tab.progress = 100;
        let counters = tab.counters;
        self.emit(
            "tab.loaded",
            json!({
                "id": id.to_string(),
                "allowed": counters.allowed,
                "blocked": counters.blocked,
                "asked": counters.asked,
            }),
        );
        Ok(())
    }

    /// A load that did not complete. The tab goes back to `Dormant` so
    /// a later focus retries it; nothing retries automatically.
    pub fn fail_load(&mut self, id: TabId, reason: &str) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        let tab = &mut self.tabs[idx];
        tab.transition(TabState::Dormant)?;
        tab.progress = 0;
        warn!(tab = %id, reason, "load failed");
        self.emit(
            "tab.loadFailed",
            json!({ "id": id.to_string(), "reason": reason }),
        );
        Ok(())
    }

    // ── Suspension and crashes ────────────────────────────────────────

    /// Governor eviction: drop a loaded background tab's contents.
    pub fn suspend(&mut self, id: TabId) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        if self.focused == Some(idx) {
            return Err(TabError::SuspendFocused);
        }
        self.tabs[idx].transition(TabState::Suspended)?;
        self.tabs[idx].progress = 0;
        info!(tab = %id, "tab suspended");
        self.emit("tab.suspended", json!({ "id": id.to_string() }));
        Ok(())
    }

    /// Loaded background tabs, least recently focused first — the
    /// governor's eviction order.
    pub fn suspend_candidates(&self) -> Vec<TabId> {
        let mut candidates: Vec<&Tab> = self
            .tabs
            .iter()
            .enumerate()
            .filter(|(i, t)| t.state == TabState::Loaded && self.focused != Some(*i))
            .map(|(_, t)| t)
            .collect();
        candidates.sort_by_key(|t| t.last_focused_at);
        candidates.iter().map(|t| t.id).collect()
    }

    /// One tab died. Every other tab is untouched.
    pub fn mark_crashed(&mut self, id: TabId, reason: &str) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        let tab = &mut self.tabs[idx];
        tab.transition(TabState::Crashed)?;
        let url = tab.url.as_ref().map(|u| u.to_string());
        warn!(tab = %id, reason, "tab crashed");
        self.emit(
            "tab.crashed",
            json!({ "id": id.to_string(), "url": url, "reason": reason }),
        );
        Ok(())
    }

    /// Explicit reload of a crashed tab.
    pub fn reload(&mut self, id: TabId) -> Result<(), TabError> {
        let idx = self.index_of(id)?;
        self.begin_load(idx);
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn get(&self, id: TabId) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == id)
    }

    pub fn focused(&self) -> Option<&Tab> {
        self.focused.map(|i| &self.tabs[i])
    }

    pub fn focused_index(&self) -> Option<usize> {
        self.focused
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// Replace the registry contents from persisted state. Every tab
    /// comes back `Dormant` — restored sessions load nothing until
    /// focused. The focus index is remembered but not acted on.
    pub fn restore_tabs(&mut self, tabs: Vec<(Option<Url>, String)>, focused: Option<usize>) {
        self.tabs = tabs
            .into_iter()
            .map(|(url, title)| {
                let mut tab = Tab::new(url);
                tab.title = title;
                tab
            })
            .collect();
        self.focused = focused.filter(|i| *i < self.tabs.len());
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn index_of(&self, id: TabId) -> Result<usize, TabError> {
        self.tabs
            .iter()
            .position(|t| t.id == id)
            .ok_or(TabError::UnknownTab(id))
    }

    fn begin_load(&mut self, idx: usize) {
        let tab = &mut self.tabs[idx];
        // Focus-triggered loads come from states where Loading is
        // always legal; keep the expect to catch registry bugs.
        tab.transition(TabState::Loading)
            .expect("focus-triggered load transition");
        tab.progress = 0;
        tab.counters = LoadCounters::default();
        let id = tab.id;
        let url = tab.url.as_ref().map(|u| u.to_string());
        self.emit("tab.loading", json!({ "id": id.to_string(), "url": url }));
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        self.bus.publish(event, payload);
    }
}
