use chrono::{NaiveDate, TimeDelta, Utc};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::url_utils::{self, DUMMY_HASH};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("URL is empty")]
    UrlNull,

    #[error("malformed URL '{0}'")]
    MalformedUrl(String),

    #[error("stored record for {0} has no profile handle")]
    MissingProfileHandle(String),

    #[error("stored record for {0} has an invalid load date")]
    InvalidLoadDate(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A crawl candidate waiting in the stack queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMessage {
    pub url_hash: String,
    /// Initiating peer hash, empty when the candidate was found locally.
    pub initiator: String,
    pub url: String,
    pub referrer_hash: String,
    /// Anchor text the URL was found under.
    pub name: String,
    pub load_date: NaiveDate,
    pub profile_handle: String,
    pub depth: u32,
    pub anchors: u32,
    /// Sum of anchors over all ancestors.
    pub fork_factor: u32,
    pub flags: u32,
    /// Sequence handle, assigned by the queue on insertion.
    pub handle: u64,
}

impl StackMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initiator: Option<&str>,
        url: &str,
        referrer: Option<&str>,
        name: Option<&str>,
        load_date: Option<NaiveDate>,
        profile_handle: &str,
        depth: u32,
        anchors: u32,
        fork_factor: u32,
    ) -> Result<Self, MessageError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(MessageError::UrlNull);
        }
        let parsed =
            Url::parse(trimmed).map_err(|_| MessageError::MalformedUrl(trimmed.to_string()))?;

        Ok(Self {
            url_hash: url_utils::url_hash(&parsed),
            initiator: initiator.unwrap_or_default().to_string(),
            url: trimmed.to_string(),
            referrer_hash: url_utils::referrer_hash(referrer),
            name: name.unwrap_or_default().to_string(),
            load_date: load_date.unwrap_or_else(|| Utc::now().date_naive()),
            profile_handle: profile_handle.to_string(),
            depth,
            anchors,
            fork_factor,
            flags: 0,
            handle: 0,
        })
    }

    /// Initiator hash, `None` for locally discovered candidates.
    pub fn initiator_hash(&self) -> Option<&str> {
        if self.initiator.is_empty() {
            None
        } else {
            Some(&self.initiator)
        }
    }

    /// Encode the record stored under `url_hash`.
    pub fn to_record(&self) -> Result<AlignedVec, MessageError> {
        let stored = StoredMessage {
            initiator: self.initiator.clone(),
            url: self.url.clone(),
            referrer_hash: self.referrer_hash.clone(),
            name: self.name.clone(),
            load_day: days_since_epoch(self.load_date),
            profile_handle: Some(self.profile_handle.clone()),
            depth: self.depth,
            anchors: self.anchors,
            fork_factor: self.fork_factor,
            flags: self.flags,
            handle: self.handle,
        };
        rkyv::to_bytes::<_, 512>(&stored)
            .map_err(|e| MessageError::Serialization(format!("Serialize failed: {:?}", e)))
    }

    /// Rebuild a message from its key and stored bytes.
    pub fn from_record(url_hash: &str, bytes: &[u8]) -> Result<Self, MessageError> {
        // redb hands out unaligned slices.
        let mut aligned = AlignedVec::new();
        aligned.extend_from_slice(bytes);
        let stored: StoredMessage = rkyv::from_bytes(&aligned)
            .map_err(|e| MessageError::Serialization(format!("Deserialize failed: {:?}", e)))?;

        let profile_handle = stored
            .profile_handle
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| MessageError::MissingProfileHandle(url_hash.to_string()))?;
        let load_date = date_from_days(stored.load_day)
            .ok_or_else(|| MessageError::InvalidLoadDate(url_hash.to_string()))?;

        Ok(Self {
            url_hash: url_hash.to_string(),
            initiator: stored.initiator,
            url: stored.url.trim().to_string(),
            referrer_hash: if stored.referrer_hash.is_empty() {
                DUMMY_HASH.to_string()
            } else {
                stored.referrer_hash
            },
            name: stored.name.trim().to_string(),
            load_date,
            profile_handle: profile_handle.trim().to_string(),
            depth: stored.depth,
            anchors: stored.anchors,
            fork_factor: stored.fork_factor,
            flags: stored.flags,
            handle: stored.handle,
        })
    }
}

impl std::fmt::Display for StackMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "urlHash: {} | initiator: {} | url: {} | referrer: {} | name: {} | loaddate: {} | profile: {} | depth: {} | forkfactor: {}",
            self.url_hash,
            self.initiator_hash().unwrap_or("null"),
            self.url,
            self.referrer_hash,
            self.name,
            self.load_date,
            self.profile_handle,
            self.depth,
            self.fork_factor
        )
    }
}

/// On-disk layout of a queued message; the url hash is the table key.
#[derive(Debug, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct StoredMessage {
    initiator: String,
    url: String,
    referrer_hash: String,
    name: String,
    load_day: i64,
    profile_handle: Option<String>,
    depth: u32,
    anchors: u32,
    fork_factor: u32,
    flags: u32,
    handle: u64,
}

fn days_since_epoch(date: NaiveDate) -> i64 {
    (date - NaiveDate::default()).num_days()
}

fn date_from_days(days: i64) -> Option<NaiveDate> {
    TimeDelta::try_days(days).and_then(|delta| NaiveDate::default().checked_add_signed(delta))
}
