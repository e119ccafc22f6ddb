//! `tabs` — the tab model and registry.
//!
//! A tab here is bookkeeping, not a rendering surface: its URL, title,
//! lifecycle state, and the counters of what the gate let through.
//! Tabs open `Dormant` and load nothing until focused; the governor can
//! put loaded background tabs back to `Suspended`; a crash touches one
//! tab and nothing else.

pub mod registry;
pub mod supervisor;

pub use registry::{EdgeMode, TabRegistry};
pub use supervisor::TabSupervisor;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Tab identifier.
pub type TabId = Uuid;

/// Errors from registry and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum TabError {
    #[error("unknown tab {0}")]
    UnknownTab(TabId),
    #[error("no tabs open")]
    Empty,
    #[error("tab limit reached ({0})")]
    TabLimit(usize),
    #[error("invalid tab transition {from} -> {to}")]
    InvalidTransition { from: TabState, to: TabState },
    #[error("tab {0} is {1} — not accepting resource requests")]
    NotAcceptingRequests(TabId, TabState),
    #[error("cannot suspend the focused tab")]
    SuspendFocused,
}

/// Tab lifecycle.
///
/// ```text
/// Dormant ──focus──► Loading ──finish──► Loaded ──governor──► Suspended
///    ▲                  │                  │                      │
///    └────fail──────────┘                  └──navigate──► Loading ◄┘ (refocus)
///                 (any) ──panic──► Crashed ──reload──► Loading
/// ```
///
/// `Dormant` is the lazy state: URL and title only, nothing loaded.
/// `Suspended` keeps URL and title but dropped contents; refocusing
/// loads again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabState {
    Dormant,
    Loading,
    Loaded,
    Suspended,
    Crashed,
}

impl TabState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabState::Dormant => "dormant",
            TabState::Loading => "loading",
            TabState::Loaded => "loaded",
            TabState::Suspended => "suspended",
            TabState::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dormant" => Some(TabState::Dormant),
            "loading" => Some(TabState::Loading),
            "loaded" => Some(TabState::Loaded),
            "suspended" => Some(TabState::Suspended),
            "crashed" => Some(TabState::Crashed),
            _ => None,
        }
    }

    /// Whether `self -> to` is a legal lifecycle step.
    pub fn can_transition(&self, to: TabState) -> bool {
        use TabState::*;
        match (self, to) {
            // Crashing is always possible except from Crashed itself.
            (Crashed, Crashed) => false,
            (_, Crashed) => true,
            // Loading starts from anywhere: focus, navigate, reload.
            (_, Loading) => true,
            (Loading, Loaded) => true,
            (Loading, Dormant) => true, // failed load, retry on refocus
            (Loaded, Suspended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-load counters of gate outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadCounters {
    pub allowed: u32,
    pub blocked: u32,
    pub asked: u32,
}

/// One tab.
#[derive(Debug, Clone)]
pub struct Tab {
    pub id: TabId,
    pub url: Option<Url>,
    pub title: String,
    pub state: TabState,
    pub opened_at: DateTime<Utc>,
    pub last_focused_at: Option<DateTime<Utc>>,
    /// Load progress 0–100, monotone within one load.
    pub progress: u8,
    pub counters: LoadCounters,
}

impl Tab {
    pub(crate) fn new(url: Option<Url>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            title: String::new(),
            state: TabState::Dormant,
            opened_at: Utc::now(),
            last_focused_at: None,
            progress: 0,
            counters: LoadCounters::default(),
        }
    }

    /// Validated state change.
    pub(crate) fn transition(&mut self, to: TabState) -> Result<(), TabError> {
        if !self.state.can_transition(to) {
            return Err(TabError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Whether the tab may issue resource requests right now.
    pub fn accepts_requests(&self) -> bool {
        matches!(self.state, TabState::Loading | TabState::Loaded)
    }
}
