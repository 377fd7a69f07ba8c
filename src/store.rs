//! Frontier and error-URL store contracts, with in-memory implementations.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::url_utils;

/// Routing class of an admitted URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StackClass {
    Local,
    Global,
    Remote,
}

impl StackClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackClass::Local => "local",
            StackClass::Global => "global",
            StackClass::Remote => "remote",
        }
    }
}

impl std::fmt::Display for StackClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrontierEntry {
    pub url_hash: String,
    pub initiator: String,
    pub url: String,
    pub load_date: NaiveDate,
    pub referrer_hash: String,
    pub name: String,
    pub profile_handle: String,
    pub depth: u32,
    pub anchors: u32,
    pub fork_factor: u32,
    pub stack: StackClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub url: String,
    pub referrer_hash: String,
    pub initiator_hash: String,
    pub local_seed_hash: String,
    pub name: String,
    pub reason_code: String,
    pub flags: u32,
    pub permanent: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Store of URLs admitted for crawling.
pub trait FrontierStore: Send + Sync {
    /// Where `url_hash` is already known, if anywhere.
    fn exists(&self, url_hash: &str) -> Option<String>;

    fn insert(&self, entry: FrontierEntry);
}

/// Sink for rejected URLs.
pub trait ErrorStore: Send + Sync {
    fn record(&self, record: ErrorRecord);
}

#[derive(Default)]
pub struct MemoryFrontier {
    entries: DashMap<String, FrontierEntry>,
}

impl MemoryFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url_hash: &str) -> Option<FrontierEntry> {
        self.entries.get(url_hash).map(|e| e.value().clone())
    }

    pub fn get_url(&self, url: &str) -> Option<FrontierEntry> {
        url_utils::url_hash_str(url).and_then(|hash| self.get(&hash))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, stack: StackClass) -> usize {
        self.entries.iter().filter(|e| e.stack == stack).count()
    }
}

impl FrontierStore for MemoryFrontier {
    fn exists(&self, url_hash: &str) -> Option<String> {
        self.entries
            .get(url_hash)
            .map(|e| e.stack.as_str().to_string())
    }

    fn insert(&self, entry: FrontierEntry) {
        self.entries.insert(entry.url_hash.clone(), entry);
    }
}

#[derive(Default)]
pub struct MemoryErrorStore {
    records: Mutex<Vec<ErrorRecord>>,
}

impl MemoryErrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.lock().clone()
    }

    pub fn reason_for(&self, url: &str) -> Option<String> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.url == url)
            .map(|r| r.reason_code.clone())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ErrorStore for MemoryErrorStore {
    fn record(&self, record: ErrorRecord) {
        self.records.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, stack: StackClass) -> FrontierEntry {
        FrontierEntry {
            url_hash: url_utils::url_hash_str(url).unwrap(),
            initiator: String::new(),
            url: url.to_string(),
            load_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            referrer_hash: url_utils::DUMMY_HASH.to_string(),
            name: String::new(),
            profile_handle: "p".to_string(),
            depth: 0,
            anchors: 0,
            fork_factor: 0,
            stack,
        }
    }

    #[test]
    fn test_frontier_reports_location() {
        let frontier = MemoryFrontier::new();
        let e = entry("http://example.com/", StackClass::Global);
        let hash = e.url_hash.clone();
        assert!(frontier.exists(&hash).is_none());

        frontier.insert(e);
        assert_eq!(frontier.exists(&hash).as_deref(), Some("global"));
        assert_eq!(frontier.count(StackClass::Global), 1);
        assert!(frontier.get_url("http://example.com/").is_some());
    }

    #[test]
    fn test_error_store_keeps_latest_reason() {
        let store = MemoryErrorStore::new();
        for code in ["first", "second"] {
            store.record(ErrorRecord {
                url: "http://example.com/".to_string(),
                referrer_hash: String::new(),
                initiator_hash: String::new(),
                local_seed_hash: String::new(),
                name: String::new(),
                reason_code: code.to_string(),
                flags: 0,
                permanent: false,
                recorded_at: Utc::now(),
            });
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.reason_for("http://example.com/").as_deref(), Some("second"));
    }

    #[test]
    fn test_stack_class_names() {
        assert_eq!(StackClass::Local.to_string(), "local");
        assert_eq!(
            serde_json::to_string(&StackClass::Remote).unwrap(),
            "\"remote\""
        );
    }
}
