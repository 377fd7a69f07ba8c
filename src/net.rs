//! Network predicates used by the admission filter: host resolution, address
//! scope, blacklist membership and robots.txt.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use robotstxt::DefaultMatcher;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// IP literals resolve to themselves, anything else goes through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Some(ip);
        }
        match tokio::net::lookup_host((bare, 0)).await {
            Ok(mut addrs) => addrs.next().map(|a| a.ip()),
            Err(e) => {
                debug!("DNS lookup failed for {}: {}", host, e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    SiteLocal,
    Loopback,
    Public,
}

/// Site-local covers the IPv4 private ranges and IPv6 `fec0::/10`.
pub fn classify_address(ip: &IpAddr) -> AddressScope {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() {
                AddressScope::SiteLocal
            } else if v4.is_loopback() {
                AddressScope::Loopback
            } else {
                AddressScope::Public
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return classify_address(&IpAddr::V4(mapped));
            }
            if v6.segments()[0] & 0xffc0 == 0xfec0 {
                AddressScope::SiteLocal
            } else if v6.is_loopback() {
                AddressScope::Loopback
            } else {
                AddressScope::Public
            }
        }
    }
}

pub trait Blacklist: Send + Sync {
    /// `path` is the URL path without its leading slash.
    fn is_listed(&self, host: &str, path: &str) -> bool;
}

/// Blacklist of `host/path` entries. The host part may use `*` wildcards,
/// the path part is a regular expression matched against the whole path.
#[derive(Debug, Default)]
pub struct HostBlacklist {
    entries: Vec<(Regex, Regex)>,
}

impl HostBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one entry, e.g. `*.ads.example.com/.*` or `example.org/private/.*`.
    /// A bare host blocks every path.
    pub fn add(&mut self, entry: &str) -> Result<(), regex::Error> {
        let entry = entry.trim();
        let (host, path) = match entry.split_once('/') {
            Some((host, path)) => (host, path),
            None => (entry, ".*"),
        };
        let host_pattern = format!(
            "^{}$",
            regex::escape(&host.to_ascii_lowercase()).replace(r"\*", ".*")
        );
        let host_re = RegexBuilder::new(&host_pattern).case_insensitive(true).build()?;
        let path_re = Regex::new(&format!("^(?:{})$", path))?;
        self.entries.push((host_re, path_re));
        Ok(())
    }

    /// Build from newline-separated entries, skipping blanks and `#` comments.
    pub fn from_lines(text: &str) -> Result<Self, regex::Error> {
        let mut list = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            list.add(line)?;
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Blacklist for HostBlacklist {
    fn is_listed(&self, host: &str, path: &str) -> bool {
        self.entries
            .iter()
            .any(|(h, p)| h.is_match(host) && p.is_match(path))
    }
}

#[async_trait]
pub trait RobotsPolicy: Send + Sync {
    async fn is_disallowed(&self, url: &Url) -> bool;
}

/// robots.txt fetched once per origin and cached. Missing or unreachable
/// files allow everything.
pub struct CachedRobots {
    client: reqwest::Client,
    agent: String,
    cache: DashMap<String, Option<Arc<str>>>,
}

impl CachedRobots {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(Config::USER_AGENT)
            .timeout(Duration::from_secs(Config::ROBOTS_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        // Product token only, robots groups never carry a version.
        let agent = Config::USER_AGENT
            .split('/')
            .next()
            .unwrap_or(Config::USER_AGENT)
            .to_string();

        Ok(Self {
            client,
            agent,
            cache: DashMap::new(),
        })
    }

    /// Seed the cache for `origin` (e.g. `http://example.com`).
    pub fn preload(&self, origin: &str, robots_txt: &str) {
        self.cache
            .insert(origin.trim_end_matches('/').to_string(), Some(Arc::from(robots_txt)));
    }

    async fn robots_for(&self, url: &Url) -> Option<Arc<str>> {
        let origin = url.origin().ascii_serialization();
        if let Some(cached) = self.cache.get(&origin) {
            return cached.value().clone();
        }

        let fetched = self.fetch(url).await;
        self.cache.insert(origin, fetched.clone());
        fetched
    }

    async fn fetch(&self, url: &Url) -> Option<Arc<str>> {
        let robots_url = url.join("/robots.txt").ok()?;
        let response = match self.client.get(robots_url.as_str()).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("robots.txt fetch failed for {}: {}", robots_url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok().map(Arc::from)
    }
}

#[async_trait]
impl RobotsPolicy for CachedRobots {
    async fn is_disallowed(&self, url: &Url) -> bool {
        match self.robots_for(url).await {
            Some(robots_txt) => {
                let mut matcher = DefaultMatcher::default();
                !matcher.one_agent_allowed_by_robots(&robots_txt, &self.agent, url.as_str())
            }
            None => false,
        }
    }
}
