//! Host pattern rules — the user-editable allow/block lists.
//!
//! A rule file is plain text, one pattern per line. `#` starts a comment
//! and blank lines are allowed; both survive a save. Patterns are either
//! an exact hostname (`example.org`) or a subdomain wildcard
//! (`*.example.org`, which also matches the bare domain). Malformed
//! lines are skipped with a warning — a typo in a rule file must never
//! keep the host from starting.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use tracing::warn;

/// Errors produced when parsing a single host pattern.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("pattern contains whitespace")]
    Whitespace,
    #[error("'*' is only allowed as a leading '*.' wildcard")]
    WildcardPosition,
}

/// A hostname matcher: exact, or a `*.`-prefixed subdomain wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Matches the hostname exactly.
    Exact(String),
    /// `*.example.org` — matches `example.org` and every label under it.
    Suffix(String),
}

impl HostPattern {
    /// Parse a pattern, lowercasing the host part.
    pub fn parse(input: &str) -> Result<Self, PatternError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(PatternError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(PatternError::Whitespace);
        }
        if let Some(rest) = s.strip_prefix("*.") {
            if rest.is_empty() || rest.contains('*') {
                return Err(PatternError::WildcardPosition);
            }
            return Ok(HostPattern::Suffix(rest.to_ascii_lowercase()));
        }
        if s.contains('*') {
            return Err(PatternError::WildcardPosition);
        }
        Ok(HostPattern::Exact(s.to_ascii_lowercase()))
    }

    /// Whether `host` (already lowercased) matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(h) => host == h,
            HostPattern::Suffix(base) => {
                host == base
                    || (host.len() > base.len()
                        && host.ends_with(base)
                        && host.as_bytes()[host.len() - base.len() - 1] == b'.')
            }
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Exact(h) => write!(f, "{h}"),
            HostPattern::Suffix(base) => write!(f, "*.{base}"),
        }
    }
}

/// One line of a rule file. Comments and blank lines are kept so a save
/// round-trips the user's file.
#[derive(Debug, Clone)]
enum Line {
    Pattern(HostPattern),
    /// Comment or blank line, stored verbatim.
    Verbatim(String),
}

/// An ordered set of host patterns with fast lookup.
///
/// Lookup is an exact-host set probe plus one probe per label suffix of
/// the host, so matching cost is bounded by the label count, not the
/// rule count.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    lines: Vec<Line>,
    exact: HashSet<String>,
    suffixes: HashSet<String>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse rule-file contents. Malformed lines are dropped with a
    /// warning, never an error.
    pub fn parse(contents: &str) -> Self {
        let mut set = Self::new();
        for (lineno, raw) in contents.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                set.lines.push(Line::Verbatim(raw.to_string()));
                continue;
            }
            match HostPattern::parse(trimmed) {
                Ok(p) => set.insert(p),
                Err(e) => {
                    warn!(line = lineno + 1, pattern = %trimmed, err = %e, "skipping malformed rule");
                }
            }
        }
        set
    }

    /// Load a rule file. A missing file is an empty set.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::new(),
            Err(e) => {
                warn!(path = %path.display(), err = %e, "rule file unreadable — treating as empty");
                Self::new()
            }
        }
    }

    /// Write the set back out, comments and ordering intact.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Pattern(p) => out.push_str(&p.to_string()),
                Line::Verbatim(s) => out.push_str(s),
            }
            out.push('\n');
        }
        std::fs::write(path, out)
    }

    /// Add a pattern. Duplicates are ignored.
    pub fn insert(&mut self, pattern: HostPattern) {
        let added = match &pattern {
            HostPattern::Exact(h) => self.exact.insert(h.clone()),
            HostPattern::Suffix(base) => self.suffixes.insert(base.clone()),
        };
        if added {
            self.lines.push(Line::Pattern(pattern));
        }
    }

    /// Remove a pattern. Returns whether it was present.
    pub fn remove(&mut self, pattern: &HostPattern) -> bool {
        let removed = match pattern {
            HostPattern::Exact(h) => self.exact.remove(h),
            HostPattern::Suffix(base) => self.suffixes.remove(base),
        };
        if removed {
            self.lines
                .retain(|l| !matches!(l, Line::Pattern(p) if p == pattern));
        }
        removed
    }

    /// Find the pattern matching `host`, if any.
    ///
    /// Exact matches win over wildcards; among wildcards the longest
    /// (most specific) suffix wins.
    pub fn matched(&self, host: &str) -> Option<HostPattern> {
        if self.exact.contains(host) {
            return Some(HostPattern::Exact(host.to_string()));
        }
        // Probe every label suffix: a.b.example.org → a.b.example.org,
        // b.example.org, example.org, org.
        let mut rest = host;
        loop {
            if self.suffixes.contains(rest) {
                return Some(HostPattern::Suffix(rest.to_string()));
            }
            match rest.split_once('.') {
                Some((_, tail)) => rest = tail,
                None => return None,
            }
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.matched(host).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.suffixes.len()
    }

    /// Patterns in file order (comments excluded).
    pub fn patterns(&self) -> impl Iterator<Item = &HostPattern> {
        self.lines.iter().filter_map(|l| match l {
            Line::Pattern(p) => Some(p),
            Line::Verbatim(_) => None,
        })
    }
}
