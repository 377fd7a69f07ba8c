use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

use crate::url_utils::short_hash;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("invalid URL filter '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Crawl policy bundle. Never changes after creation; queued messages refer
/// to it by `handle`.
#[derive(Debug, Clone)]
pub struct CrawlProfile {
    handle: String,
    name: String,
    general_filter: Regex,
    general_depth: u32,
    remote_indexing: bool,
    crawl_dynamic: bool,
}

impl CrawlProfile {
    /// A profile whose filter must match the whole URL.
    pub fn new(name: &str, filter: &str, general_depth: u32) -> Result<Self, ProfileError> {
        let anchored = format!("^(?:{})$", filter);
        let general_filter = Regex::new(&anchored).map_err(|source| ProfileError::InvalidFilter {
            pattern: filter.to_string(),
            source,
        })?;
        let seed = format!(
            "{}|{}|{}",
            name,
            filter,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        Ok(Self {
            handle: short_hash(seed.as_bytes()),
            name: name.to_string(),
            general_filter,
            general_depth,
            remote_indexing: false,
            crawl_dynamic: false,
        })
    }

    pub fn with_handle(mut self, handle: &str) -> Self {
        self.handle = handle.to_string();
        self
    }

    pub fn with_remote_indexing(mut self, enabled: bool) -> Self {
        self.remote_indexing = enabled;
        self
    }

    /// Allow URLs carrying query parameters.
    pub fn with_crawl_dynamic(mut self, enabled: bool) -> Self {
        self.crawl_dynamic = enabled;
        self
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn general_depth(&self) -> u32 {
        self.general_depth
    }

    pub fn remote_indexing(&self) -> bool {
        self.remote_indexing
    }

    pub fn crawl_dynamic(&self) -> bool {
        self.crawl_dynamic
    }

    pub fn matches(&self, url: &str) -> bool {
        self.general_filter.is_match(url)
    }
}

/// Lookup of crawl profiles by handle.
pub trait ProfileStore: Send + Sync {
    fn get_entry(&self, handle: &str) -> Option<Arc<CrawlProfile>>;
}

#[derive(Default)]
pub struct MemoryProfiles {
    entries: DashMap<String, Arc<CrawlProfile>>,
}

impl MemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `profile` and return its shared handle.
    pub fn insert(&self, profile: CrawlProfile) -> Arc<CrawlProfile> {
        let profile = Arc::new(profile);
        self.entries
            .insert(profile.handle().to_string(), Arc::clone(&profile));
        profile
    }

    pub fn remove(&self, handle: &str) -> Option<Arc<CrawlProfile>> {
        self.entries.remove(handle).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProfileStore for MemoryProfiles {
    fn get_entry(&self, handle: &str) -> Option<Arc<CrawlProfile>> {
        self.entries.get(handle).map(|e| Arc::clone(e.value()))
    }
}
