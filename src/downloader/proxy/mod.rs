// Cross-origin proxying
//
// - ladder: ordered fetch strategies for whole-body content (engine requests)
// - edge: transport decorator that rewrites requests to restricted domains

mod edge;
mod ladder;

pub use edge::EdgeProxy;
pub use ladder::{DirectStrategy, FetchStrategy, MirrorStrategy, ProxyLadder};

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Host suffix list ("youtube.com" matches "www.youtube.com" and "youtube.com")
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainList(Vec<String>);

impl DomainList {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            domains
                .into_iter()
                .map(|d| {
                    let d: String = d.into();
                    d.trim().trim_start_matches('.').to_ascii_lowercase()
                })
                .filter(|d| !d.is_empty())
                .collect(),
        )
    }

    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.0.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    pub fn matches_url(&self, url: &Url) -> bool {
        url.host_str().map_or(false, |h| self.matches_host(h))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

/// A mirror proxy base such as `https://corsproxy.io/?` or
/// `https://api.allorigins.win/raw?url=`; the percent-encoded target is appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyEndpoint(String);

impl ProxyEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        Self(base.into())
    }

    pub fn base(&self) -> &str {
        &self.0
    }

    /// `base + urlEncode(target)`
    pub fn rewrite(&self, target: &str) -> String {
        format!("{}{}", self.0, urlencoding::encode(target))
    }

    /// Host of the proxy itself, used for loop prevention
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.0)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }
}

/// How one ladder step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Failed(String),
    /// Strategy does not apply to this URL (e.g. direct fetch of a blocking domain)
    Skipped,
}

/// Record of one ladder step, for iteration and logging only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAttempt {
    pub strategy_index: usize,
    pub strategy: &'static str,
    pub target_url: String,
    pub outcome: AttemptOutcome,
}
