use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk has no word containers")]
    Empty,
}

/// Lifecycle of one chunk transfer. The last three states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferStatus {
    #[default]
    Undefined,
    Running,
    Complete,
    Failed,
    Interrupted,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Complete | TransferStatus::Failed | TransferStatus::Interrupted
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::Undefined => "UNDEFINED",
            TransferStatus::Running => "RUNNING",
            TransferStatus::Complete => "COMPLETE",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Interrupted => "INTERRUPTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub url_hash: String,
    #[serde(default)]
    pub hit_count: u32,
    #[serde(default)]
    pub position: u32,
}

/// All postings for one word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordContainer {
    pub word_hash: String,
    pub postings: Vec<Posting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMetadata {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub size: u64,
}

/// A batch of word postings plus the metadata of every URL they reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChunk {
    pub containers: Vec<WordContainer>,
    #[serde(default)]
    pub url_cache: BTreeMap<String, UrlMetadata>,
}

impl IndexChunk {
    pub fn new(containers: Vec<WordContainer>, url_cache: BTreeMap<String, UrlMetadata>) -> Self {
        Self {
            containers,
            url_cache,
        }
    }

    /// Read a chunk from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ChunkError> {
        let text = std::fs::read_to_string(path)?;
        let chunk: IndexChunk = serde_json::from_str(&text)?;
        if chunk.containers.is_empty() {
            return Err(ChunkError::Empty);
        }
        Ok(chunk)
    }

    /// Total postings over all containers.
    pub fn index_count(&self) -> usize {
        self.containers.iter().map(|c| c.postings.len()).sum()
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn url_count(&self) -> usize {
        self.url_cache.len()
    }

    pub fn first_word_hash(&self) -> Option<&str> {
        self.containers.first().map(|c| c.word_hash.as_str())
    }

    pub fn last_word_hash(&self) -> Option<&str> {
        self.containers.last().map(|c| c.word_hash.as_str())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub fn sample_chunk() -> IndexChunk {
        let containers = vec![
            WordContainer {
                word_hash: "aaaaaaaaaaaa".to_string(),
                postings: vec![
                    Posting {
                        url_hash: "url000000001".to_string(),
                        hit_count: 2,
                        position: 4,
                    },
                    Posting {
                        url_hash: "url000000002".to_string(),
                        hit_count: 1,
                        position: 9,
                    },
                ],
            },
            WordContainer {
                word_hash: "zzzzzzzzzzzz".to_string(),
                postings: vec![Posting {
                    url_hash: "url000000001".to_string(),
                    hit_count: 1,
                    position: 1,
                }],
            },
        ];
        let mut url_cache = BTreeMap::new();
        for (hash, url) in [
            ("url000000001", "http://example.com/a"),
            ("url000000002", "http://example.com/b"),
        ] {
            url_cache.insert(
                hash.to_string(),
                UrlMetadata {
                    url: url.to_string(),
                    title: String::new(),
                    size: 1024,
                },
            );
        }
        IndexChunk::new(containers, url_cache)
    }

    #[test]
    fn test_counts_and_bounds() {
        let chunk = sample_chunk();
        assert_eq!(chunk.index_count(), 3);
        assert_eq!(chunk.container_count(), 2);
        assert_eq!(chunk.url_count(), 2);
        assert_eq!(chunk.first_word_hash(), Some("aaaaaaaaaaaa"));
        assert_eq!(chunk.last_word_hash(), Some("zzzzzzzzzzzz"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.json");
        std::fs::write(&path, serde_json::to_string(&sample_chunk()).unwrap()).unwrap();
        assert_eq!(IndexChunk::load(&path).unwrap(), sample_chunk());

        std::fs::write(&path, r#"{"containers": []}"#).unwrap();
        assert!(matches!(IndexChunk::load(&path), Err(ChunkError::Empty)));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransferStatus::Undefined.is_terminal());
        assert!(!TransferStatus::Running.is_terminal());
        assert!(TransferStatus::Complete.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Interrupted.is_terminal());
        assert_eq!(TransferStatus::Interrupted.to_string(), "INTERRUPTED");
    }
}
