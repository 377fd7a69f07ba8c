//! Ordered admission checks for one crawl candidate.

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::message::StackMessage;
use crate::net::{classify_address, AddressScope, Blacklist, HostResolver, RobotsPolicy};
use crate::profile::CrawlProfile;
use crate::seed::{PeerIdentity, Seed};
use crate::store::{FrontierEntry, FrontierStore, StackClass};
use crate::url_utils::{self, DUMMY_HASH};

/// Why a candidate was refused. `code()` gives the stable reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UrlNull,
    UrlMalformed,
    UnknownHost,
    PrivateIpAddress,
    LoopbackIpAddress,
    Blacklisted,
    FilterMismatch,
    CgiUrl,
    PostUrl,
    /// Already known to the frontier, at the given location.
    Double(String),
    RobotsTxt,
}

impl RejectReason {
    pub fn code(&self) -> String {
        match self {
            RejectReason::UrlNull => "denied_(url_null)".to_string(),
            RejectReason::UrlMalformed => "denied_(url_malformed)".to_string(),
            RejectReason::UnknownHost => "denied_(unknown_host)".to_string(),
            RejectReason::PrivateIpAddress => "denied_(private_ip_address)".to_string(),
            RejectReason::LoopbackIpAddress => "denied_(loopback_ip_address)".to_string(),
            RejectReason::Blacklisted => "denied_(url_in_blacklist)".to_string(),
            RejectReason::FilterMismatch => "denied_(does_not_match_filter)".to_string(),
            RejectReason::CgiUrl => "denied_(cgi_url)".to_string(),
            RejectReason::PostUrl => "denied_(post_url)".to_string(),
            RejectReason::Double(location) => format!("double_(registered_in_{})", location),
            RejectReason::RobotsTxt => "denied_(robots.txt)".to_string(),
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code())
    }
}

/// One candidate as seen by the filter.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub url: &'a str,
    pub referrer_hash: &'a str,
    /// Empty or the dummy hash for local discoveries.
    pub initiator: &'a str,
    pub name: &'a str,
    pub load_date: NaiveDate,
    pub depth: u32,
    pub anchors: u32,
    pub fork_factor: u32,
    pub profile: Option<&'a CrawlProfile>,
}

impl<'a> Candidate<'a> {
    pub fn from_message(msg: &'a StackMessage, profile: &'a CrawlProfile) -> Self {
        Self {
            url: &msg.url,
            referrer_hash: &msg.referrer_hash,
            initiator: &msg.initiator,
            name: &msg.name,
            load_date: msg.load_date,
            depth: msg.depth,
            anchors: msg.anchors,
            fork_factor: msg.fork_factor,
            profile: Some(profile),
        }
    }
}

/// A candidate that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub url_hash: String,
    pub stack: StackClass,
}

/// Routing class for an accepted candidate.
///
/// Global needs remote indexing granted, a leaf depth, the local peer as
/// initiator and a senior or principal local seed. Otherwise local
/// initiators stay local and everything else is remote.
pub fn classify(
    profile: Option<&CrawlProfile>,
    depth: u32,
    initiator: &str,
    local: &Seed,
) -> StackClass {
    let global = profile.is_some_and(|p| p.remote_indexing() && depth == p.general_depth())
        && initiator == local.hash
        && local.status.can_index_remotely();
    if global {
        StackClass::Global
    } else if is_local_initiator(initiator, &local.hash) {
        StackClass::Local
    } else {
        StackClass::Remote
    }
}

fn is_local_initiator(initiator: &str, local_hash: &str) -> bool {
    initiator.is_empty() || initiator == DUMMY_HASH || initiator == local_hash
}

pub struct AdmissionFilter {
    resolver: Arc<dyn HostResolver>,
    blacklist: Arc<dyn Blacklist>,
    robots: Arc<dyn RobotsPolicy>,
    frontier: Arc<dyn FrontierStore>,
    identity: Arc<dyn PeerIdentity>,
}

impl AdmissionFilter {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        blacklist: Arc<dyn Blacklist>,
        robots: Arc<dyn RobotsPolicy>,
        frontier: Arc<dyn FrontierStore>,
        identity: Arc<dyn PeerIdentity>,
    ) -> Self {
        Self {
            resolver,
            blacklist,
            robots,
            frontier,
            identity,
        }
    }

    pub fn local_seed(&self) -> Seed {
        self.identity.my_seed()
    }

    /// Run every check in order, stopping at the first failure.
    pub async fn check(&self, candidate: &Candidate<'_>) -> Result<Admission, RejectReason> {
        let raw = candidate.url.trim();
        if raw.is_empty() {
            return Err(RejectReason::UrlNull);
        }
        let url = Url::parse(raw).map_err(|_| RejectReason::UrlMalformed)?;
        let host = url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or(RejectReason::UrlMalformed)?;

        let address = self
            .resolver
            .resolve(&host)
            .await
            .ok_or(RejectReason::UnknownHost)?;
        match classify_address(&address) {
            AddressScope::SiteLocal => return Err(RejectReason::PrivateIpAddress),
            AddressScope::Loopback => return Err(RejectReason::LoopbackIpAddress),
            AddressScope::Public => {}
        }

        if self
            .blacklist
            .is_listed(&host, url.path().trim_start_matches('/'))
        {
            return Err(RejectReason::Blacklisted);
        }

        if let Some(profile) = candidate.profile {
            if candidate.depth > 0 && !profile.matches(raw) {
                return Err(RejectReason::FilterMismatch);
            }
        }

        if url_utils::is_cgi(raw) {
            return Err(RejectReason::CgiUrl);
        }

        if url_utils::is_post(raw) && candidate.profile.is_some_and(|p| !p.crawl_dynamic()) {
            return Err(RejectReason::PostUrl);
        }

        let url_hash = url_utils::url_hash(&url);
        if let Some(location) = self.frontier.exists(&url_hash) {
            return Err(RejectReason::Double(location));
        }

        if self.robots.is_disallowed(&url).await {
            return Err(RejectReason::RobotsTxt);
        }

        let local = self.identity.my_seed();
        let stack = classify(candidate.profile, candidate.depth, candidate.initiator, &local);
        if stack == StackClass::Remote {
            warn!("URL '{}' can neither be crawled local nor global", raw);
        }

        Ok(Admission { url_hash, stack })
    }

    /// Check `candidate` and insert it into the frontier when accepted.
    /// Returns the rejection reason, `None` on acceptance.
    pub async fn stack_crawl(&self, candidate: &Candidate<'_>) -> Option<RejectReason> {
        let start = Instant::now();
        let admission = match self.check(candidate).await {
            Ok(admission) => admission,
            Err(reason) => {
                debug!(
                    "URL '{}' rejected: {} ({} ms)",
                    candidate.url,
                    reason,
                    start.elapsed().as_millis()
                );
                return Some(reason);
            }
        };

        let initiator = if candidate.initiator.is_empty() {
            DUMMY_HASH
        } else {
            candidate.initiator
        };
        self.frontier.insert(FrontierEntry {
            url_hash: admission.url_hash,
            initiator: initiator.to_string(),
            url: candidate.url.trim().to_string(),
            load_date: candidate.load_date,
            referrer_hash: candidate.referrer_hash.to_string(),
            name: candidate.name.to_string(),
            profile_handle: candidate
                .profile
                .map(|p| p.handle().to_string())
                .unwrap_or_default(),
            depth: candidate.depth,
            anchors: candidate.anchors,
            fork_factor: candidate.fork_factor,
            stack: admission.stack,
        });
        debug!(
            "URL '{}' stacked as {} ({} ms)",
            candidate.url,
            admission.stack,
            start.elapsed().as_millis()
        );
        None
    }
}
