//! The resource-loading gate.
//!
//! [`PolicyEngine::decide`] is consulted once per resource request a tab
//! wants to make. Precedence is fixed: **block list > allow list >
//! per-kind default**. A host on both lists is blocked.
//!
//! The shipped defaults are private-by-default: third-party cookies are
//! blocked and third-party scripts ask. `Ask` is a real verdict — it is
//! surfaced on the event bus, and a load pipeline that gets no answer
//! treats it as a block.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::rules::{HostPattern, PatternError, RuleSet};

// ─── Request vocabulary ───────────────────────────────────────────────────────

/// What kind of resource a tab is asking to load.
///
/// `Cookie` is the acceptance gate only — whether a site's cookie would
/// be honored at all. Nothing here stores cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Document,
    Subframe,
    Script,
    Stylesheet,
    Image,
    Media,
    Cookie,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Document => "document",
            ResourceKind::Subframe => "subframe",
            ResourceKind::Script => "script",
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Image => "image",
            ResourceKind::Media => "media",
            ResourceKind::Cookie => "cookie",
            ResourceKind::Other => "other",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" => Ok(ResourceKind::Document),
            "subframe" => Ok(ResourceKind::Subframe),
            "script" => Ok(ResourceKind::Script),
            "stylesheet" => Ok(ResourceKind::Stylesheet),
            "image" => Ok(ResourceKind::Image),
            "media" => Ok(ResourceKind::Media),
            "cookie" => Ok(ResourceKind::Cookie),
            "other" => Ok(ResourceKind::Other),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate outcome for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block,
    Ask,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Block => "block",
            Verdict::Ask => "ask",
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Verdict::Allow),
            "block" => Ok(Verdict::Block),
            "ask" => Ok(Verdict::Ask),
            other => Err(format!("unknown verdict: {other} (expected allow|block|ask)")),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource request from a tab.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub url: Url,
    pub kind: ResourceKind,
}

impl ResourceRequest {
    pub fn new(url: Url, kind: ResourceKind) -> Self {
        Self { url, kind }
    }
}

/// Why a verdict was reached — kept so the decision log and the UI can
/// explain themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "pattern")]
pub enum DecisionReason {
    /// Matched a block-list pattern.
    BlockListed(String),
    /// Matched an allow-list pattern.
    AllowListed(String),
    /// Fell through to the per-kind default.
    KindDefault,
}

/// The gate's answer for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: DecisionReason,
    pub third_party: bool,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

// ─── Per-kind defaults ────────────────────────────────────────────────────────

/// Default verdicts applied when neither list matches.
///
/// First-party requests always get `first_party_default`. Third-party
/// cookies and scripts have their own knobs; every other third-party
/// kind gets `third_party_default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub first_party_default: Verdict,
    pub third_party_default: Verdict,
    pub third_party_cookies: Verdict,
    pub third_party_scripts: Verdict,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            first_party_default: Verdict::Allow,
            third_party_default: Verdict::Allow,
            third_party_cookies: Verdict::Block,
            third_party_scripts: Verdict::Ask,
        }
    }
}

impl GatePolicy {
    fn default_verdict(&self, kind: ResourceKind, first_party: bool) -> Verdict {
        if first_party {
            return self.first_party_default;
        }
        match kind {
            ResourceKind::Cookie => self.third_party_cookies,
            ResourceKind::Script => self.third_party_scripts,
            _ => self.third_party_default,
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

const ALLOW_FILE: &str = "allow.txt";
const BLOCK_FILE: &str = "block.txt";

/// The policy engine: allow list, block list, per-kind defaults.
///
/// Cheap to share behind an `Arc`; `decide` takes `&self`.
pub struct PolicyEngine {
    allow: RwLock<RuleSet>,
    block: RwLock<RuleSet>,
    policy: GatePolicy,
    /// Directory holding `allow.txt` / `block.txt`; `None` for an
    /// in-memory engine (tests, `policy check` on ad-hoc lists).
    dir: Option<PathBuf>,
}

impl PolicyEngine {
    /// An engine with the given defaults and empty lists, not backed by
    /// any files.
    pub fn in_memory(policy: GatePolicy) -> Self {
        Self {
            allow: RwLock::new(RuleSet::new()),
            block: RwLock::new(RuleSet::new()),
            policy,
            dir: None,
        }
    }

    /// Load rule files from `{data_dir}/policies/`. Missing files mean
    /// empty lists.
    pub fn open(data_dir: &Path, policy: GatePolicy) -> Self {
        let dir = data_dir.join("policies");
        let allow = RuleSet::load(&dir.join(ALLOW_FILE));
        let block = RuleSet::load(&dir.join(BLOCK_FILE));
        info!(
            allow_rules = allow.len(),
            block_rules = block.len(),
            "policy engine loaded"
        );
        Self {
            allow: RwLock::new(allow),
            block: RwLock::new(block),
            policy,
            dir: Some(dir),
        }
    }

    /// Decide one request. `origin` is the requesting tab's document
    /// URL; a tab with no origin yet gets kind defaults as third-party
    /// unless the request itself has no host (inline data).
    pub fn decide(&self, origin: Option<&Url>, request: &ResourceRequest) -> Decision {
        let host = match request.url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => {
                // data:/about: style — nothing to match, inline content.
                return Decision {
                    verdict: self.policy.default_verdict(request.kind, true),
                    reason: DecisionReason::KindDefault,
                    third_party: false,
                };
            }
        };

        let first_party = origin
            .and_then(Url::host_str)
            .map(|o| same_site(&o.to_ascii_lowercase(), &host))
            .unwrap_or(false);

        if let Some(p) = self.block.read().expect("block list lock").matched(&host) {
            debug!(host = %host, pattern = %p, "blocked by list");
            return Decision {
                verdict: Verdict::Block,
                reason: DecisionReason::BlockListed(p.to_string()),
                third_party: !first_party,
            };
        }

        if let Some(p) = self.allow.read().expect("allow list lock").matched(&host) {
            return Decision {
                verdict: Verdict::Allow,
                reason: DecisionReason::AllowListed(p.to_string()),
                third_party: !first_party,
            };
        }

        Decision {
            verdict: self.policy.default_verdict(request.kind, first_party),
            reason: DecisionReason::KindDefault,
            third_party: !first_party,
        }
    }

    // ── List mutation ─────────────────────────────────────────────────

    /// Add a pattern to the allow list and persist.
    pub fn allow_host(&self, pattern: &str) -> Result<HostPattern, PatternError> {
        let p = HostPattern::parse(pattern)?;
        {
            let mut allow = self.allow.write().expect("allow list lock");
            allow.insert(p.clone());
        }
        self.persist();
        Ok(p)
    }

    /// Add a pattern to the block list and persist.
    pub fn block_host(&self, pattern: &str) -> Result<HostPattern, PatternError> {
        let p = HostPattern::parse(pattern)?;
        {
            let mut block = self.block.write().expect("block list lock");
            block.insert(p.clone());
        }
        self.persist();
        Ok(p)
    }

    /// Remove a pattern from both lists. Returns whether anything was
    /// removed.
    pub fn remove_host(&self, pattern: &str) -> Result<bool, PatternError> {
        let p = HostPattern::parse(pattern)?;
        let removed = {
            let mut allow = self.allow.write().expect("allow list lock");
            let mut block = self.block.write().expect("block list lock");
            let a = allow.remove(&p);
            let b = block.remove(&p);
            a || b
        };
        if removed {
            self.persist();
        }
        Ok(removed)
    }

    /// Current allow-list patterns, file order.
    pub fn allow_patterns(&self) -> Vec<HostPattern> {
        self.allow
            .read()
            .expect("allow list lock")
            .patterns()
            .cloned()
            .collect()
    }

    /// Current block-list patterns, file order.
    pub fn block_patterns(&self) -> Vec<HostPattern> {
        self.block
            .read()
            .expect("block list lock")
            .patterns()
            .cloned()
            .collect()
    }

    fn persist(&self) {
        let Some(dir) = &self.dir else { return };
        let allow = self.allow.read().expect("allow list lock");
        if let Err(e) = allow.save(&dir.join(ALLOW_FILE)) {
            tracing::warn!(err = %e, "failed to save allow list");
        }
        let block = self.block.read().expect("block list lock");
        if let Err(e) = block.save(&dir.join(BLOCK_FILE)) {
            tracing::warn!(err = %e, "failed to save block list");
        }
    }
}

/// Suffix same-site check: `sub.example.org` is first-party to
/// `example.org` and vice versa. No public-suffix list — unrelated
/// hosts sharing only a TLD do not match because the comparison runs on
/// whole label boundaries of the *other* host, not of the TLD.
pub fn same_site(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (long, short) = if a.len() > b.len() { (a, b) } else { (b, a) };
    long.len() > short.len() + 1
        && long.ends_with(short)
        && long.as_bytes()[long.len() - short.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PolicyEngine {
        PolicyEngine::in_memory(GatePolicy::default())
    }

    fn req(url: &str, kind: ResourceKind) -> ResourceRequest {
        ResourceRequest::new(Url::parse(url).unwrap(), kind)
    }

    fn origin(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn first_party_defaults_allow() {
        let e = engine();
        let o = origin("https://example.org/page");
        let d = e.decide(Some(&o), &req("https://example.org/app.js", ResourceKind::Script));
        assert_eq!(d.verdict, Verdict::Allow);
        assert!(!d.third_party);
        assert_eq!(d.reason, DecisionReason::KindDefault);
    }

    #[test]
    fn subdomain_is_first_party() {
        let e = engine();
        let o = origin("https://example.org/");
        let d = e.decide(
            Some(&o),
            &req("https://static.example.org/app.js", ResourceKind::Script),
        );
        assert_eq!(d.verdict, Verdict::Allow);
        assert!(!d.third_party);
    }

    #[test]
    fn third_party_cookie_blocked_by_default() {
        let e = engine();
        let o = origin("https://example.org/");
        let d = e.decide(Some(&o), &req("https://tracker.net/pixel", ResourceKind::Cookie));
        assert_eq!(d.verdict, Verdict::Block);
        assert!(d.third_party);
    }

    #[test]
    fn third_party_script_asks_by_default() {
        let e = engine();
        let o = origin("https://example.org/");
        let d = e.decide(Some(&o), &req("https://cdn.net/lib.js", ResourceKind::Script));
        assert_eq!(d.verdict, Verdict::Ask);
    }

    #[test]
    fn third_party_image_allowed_by_default() {
        let e = engine();
        let o = origin("https://example.org/");
        let d = e.decide(Some(&o), &req("https://cdn.net/logo.png", ResourceKind::Image));
        assert_eq!(d.verdict, Verdict::Allow);
    }

    #[test]
    fn block_list_beats_allow_list() {
        let e = engine();
        e.allow_host("*.tracker.net").unwrap();
        e.block_host("*.tracker.net").unwrap();
        let o = origin("https://example.org/");
        let d = e.decide(Some(&o), &req("https://eu.tracker.net/x", ResourceKind::Image));
        assert_eq!(d.verdict, Verdict::Block);
        assert_eq!(
            d.reason,
            DecisionReason::BlockListed("*.tracker.net".into())
        );
    }

    #[test]
    fn allow_list_beats_kind_default() {
        let e = engine();
        e.allow_host("cdn.net").unwrap();
        let o = origin("https://example.org/");
        let d = e.decide(Some(&o), &req("https://cdn.net/lib.js", ResourceKind::Script));
        assert_eq!(d.verdict, Verdict::Allow);
        assert_eq!(d.reason, DecisionReason::AllowListed("cdn.net".into()));
    }

    #[test]
    fn no_origin_is_third_party() {
        let e = engine();
        let d = e.decide(None, &req("https://cdn.net/lib.js", ResourceKind::Script));
        assert_eq!(d.verdict, Verdict::Ask);
        assert!(d.third_party);
    }

    #[test]
    fn hostless_request_is_inline_first_party() {
        let e = engine();
        let d = e.decide(None, &req("data:text/plain,hi", ResourceKind::Other));
        assert_eq!(d.verdict, Verdict::Allow);
        assert!(!d.third_party);
    }

    #[test]
    fn same_site_requires_label_boundary() {
        assert!(same_site("example.org", "example.org"));
        assert!(same_site("a.example.org", "example.org"));
        assert!(!same_site("badexample.org", "example.org"));
        assert!(!same_site("example.org", "example.com"));
    }

    #[test]
    fn remove_host_clears_both_lists() {
        let e = engine();
        e.allow_host("example.org").unwrap();
        e.block_host("example.org").unwrap();
        assert!(e.remove_host("example.org").unwrap());
        assert!(e.allow_patterns().is_empty());
        assert!(e.block_patterns().is_empty());
        assert!(!e.remove_host("example.org").unwrap());
    }

    #[test]
    fn rule_files_persist_across_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let e = PolicyEngine::open(dir.path(), GatePolicy::default());
            e.block_host("*.tracker.net").unwrap();
            e.allow_host("example.org").unwrap();
        }
        let e = PolicyEngine::open(dir.path(), GatePolicy::default());
        assert_eq!(e.block_patterns().len(), 1);
        assert_eq!(e.allow_patterns().len(), 1);
        let o = origin("https://example.org/");
        let d = e.decide(Some(&o), &req("https://eu.tracker.net/x", ResourceKind::Image));
        assert_eq!(d.verdict, Verdict::Block);
    }
}
