//! `policy` — the resource-loading gate.
//!
//! Everything a tab loads passes through here:
//!
//! - **Rules** — user-editable allow/block host lists, plain-text files.
//! - **Engine** — verdicts with reasons; block > allow > per-kind
//!   default, private-by-default third-party handling.
//! - **Decision log** — append-only JSONL audit of every verdict, URLs
//!   stored as SHA-256 fingerprints only.

pub mod decision_log;
pub mod engine;
pub mod rules;

pub use engine::{
    Decision, DecisionReason, GatePolicy, PolicyEngine, ResourceKind, ResourceRequest, Verdict,
};
pub use rules::{HostPattern, PatternError, RuleSet};

use sha2::{Digest, Sha256};
use url::Url;

/// Lowercase hex SHA-256 of a URL. Decision log and crash reports store
/// this instead of the URL itself.
pub fn url_fingerprint(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse user input as a URL, trying `https://` when no scheme was
/// given — `example.org/x` works on the command line.
pub fn fuzzy_url(input: &str) -> Result<Url, url::ParseError> {
    match Url::parse(input) {
        Ok(u) => Ok(u),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{input}")),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = url_fingerprint("https://example.org/");
        let b = url_fingerprint("https://example.org/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fuzzy_url_accepts_bare_hosts() {
        assert_eq!(
            fuzzy_url("example.org/x").unwrap().as_str(),
            "https://example.org/x"
        );
        assert_eq!(fuzzy_url("http://example.org/").unwrap().scheme(), "http");
        assert!(fuzzy_url("http://").is_err());
    }
}
