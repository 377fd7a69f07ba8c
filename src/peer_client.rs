//! Peer transfer RPC: response model and an HTTP/JSON client.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::backoff::clamp_peer_pause;
use crate::chunk::{IndexChunk, UrlMetadata, WordContainer};
use crate::config::Config;
use crate::seed::Seed;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Key/value answer of a transfer call. A missing or null `result` means
/// success; any other value is an error code such as `busy`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferResponse {
    fields: Map<String, Value>,
}

impl TransferResponse {
    pub fn from_json(text: &str) -> Result<Self, PeerError> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(other) => Err(PeerError::Decode(format!("expected an object, got {}", other))),
            Err(e) => Err(PeerError::Decode(e.to_string())),
        }
    }

    pub fn success(payload_size: u64) -> Self {
        let mut fields = Map::new();
        fields.insert("payloadSize".to_string(), Value::from(payload_size));
        Self { fields }
    }

    pub fn failure(code: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("result".to_string(), Value::from(code));
        Self { fields }
    }

    /// Attach a `resultTransferRWI.pause` value.
    pub fn with_pause(mut self, pause: Value) -> Self {
        let mut rwi = Map::new();
        rwi.insert("pause".to_string(), pause);
        self.fields
            .insert("resultTransferRWI".to_string(), Value::Object(rwi));
        self
    }

    /// Error code, `None` on success.
    pub fn error(&self) -> Option<String> {
        match self.fields.get("result") {
            None | Some(Value::Null) => None,
            Some(Value::String(code)) => Some(code.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.error().as_deref() == Some("busy")
    }

    pub fn payload_size(&self) -> u64 {
        self.fields
            .get("payloadSize")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Pause requested by the peer, clamped. Unparseable values count as negative.
    pub fn requested_pause(&self) -> Option<Duration> {
        let raw = self
            .fields
            .get("resultTransferRWI")?
            .as_object()?
            .get("pause")?;
        let ms = match raw {
            Value::String(s) => s.trim().parse::<i64>().unwrap_or(-1),
            Value::Number(n) => n.as_i64().unwrap_or(-1),
            _ => -1,
        };
        Some(clamp_peer_pause(ms))
    }
}

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Push `chunk` to `target`. Transport failures come back as error responses.
    async fn transfer_index(
        &self,
        target: &Seed,
        chunk: &IndexChunk,
        compress: bool,
        timeout: Duration,
    ) -> TransferResponse;

    /// Announce `me` to the peer at `address`. Returns the number of seeds
    /// the peer added, negative on failure.
    async fn publish_my_seed(&self, me: &Seed, address: &str, peer_hash: &str) -> i64;
}

#[derive(Serialize)]
struct TransferBody<'a> {
    target: &'a str,
    containers: &'a [WordContainer],
    url_cache: &'a std::collections::BTreeMap<String, UrlMetadata>,
    compress: bool,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct HelloBody<'a> {
    seed: &'a Seed,
    target: &'a str,
}

/// JSON over HTTP: `POST /peer/transfer` and `POST /peer/hello`.
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new() -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .user_agent(Config::USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    async fn post_transfer(
        &self,
        target: &Seed,
        chunk: &IndexChunk,
        compress: bool,
        timeout: Duration,
    ) -> Result<TransferResponse, PeerError> {
        let body = TransferBody {
            target: &target.hash,
            containers: &chunk.containers,
            url_cache: &chunk.url_cache,
            compress,
            timeout_ms: timeout.as_millis() as u64,
        };
        let response = self
            .client
            .post(format!("http://{}/peer/transfer", target.address))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PeerError::Status(response.status().as_u16()));
        }
        let text = response.text().await?;
        TransferResponse::from_json(&text)
    }

    async fn post_hello(&self, me: &Seed, address: &str, peer_hash: &str) -> Result<i64, PeerError> {
        let response = self
            .client
            .post(format!("http://{}/peer/hello", address))
            .timeout(Duration::from_millis(Config::TRANSFER_TIMEOUT_MS))
            .json(&HelloBody {
                seed: me,
                target: peer_hash,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PeerError::Status(response.status().as_u16()));
        }
        let value: Value = response.json().await?;
        value
            .get("added")
            .and_then(Value::as_i64)
            .ok_or_else(|| PeerError::Decode("missing 'added' field".to_string()))
    }
}

#[async_trait]
impl PeerNetwork for HttpPeerClient {
    async fn transfer_index(
        &self,
        target: &Seed,
        chunk: &IndexChunk,
        compress: bool,
        timeout: Duration,
    ) -> TransferResponse {
        match self.post_transfer(target, chunk, compress, timeout).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Transfer to {} failed: {}", target.address, e);
                TransferResponse::failure(&format!("unreachable: {}", e))
            }
        }
    }

    async fn publish_my_seed(&self, me: &Seed, address: &str, peer_hash: &str) -> i64 {
        match self.post_hello(me, address, peer_hash).await {
            Ok(added) => added,
            Err(e) => {
                debug!("Ping of {} failed: {}", address, e);
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_error_codes() {
        let ok = TransferResponse::from_json(r#"{"result": null, "payloadSize": 2048}"#).unwrap();
        assert_eq!(ok.error(), None);
        assert_eq!(ok.payload_size(), 2048);

        let missing = TransferResponse::from_json("{}").unwrap();
        assert_eq!(missing.error(), None);

        let busy = TransferResponse::from_json(r#"{"result": "busy"}"#).unwrap();
        assert!(busy.is_busy());
        assert_eq!(busy.requested_pause(), None);

        let failed = TransferResponse::from_json(r#"{"result": "not granted"}"#).unwrap();
        assert_eq!(failed.error().as_deref(), Some("not granted"));
        assert!(!failed.is_busy());
    }

    #[test]
    fn test_pause_parsing() {
        let busy = TransferResponse::from_json(
            r#"{"result":"busy","resultTransferRWI":{"pause":"45000"}}"#,
        )
        .unwrap();
        assert_eq!(busy.requested_pause(), Some(Duration::from_millis(30_000)));

        let cases = [
            (Value::from("-5"), 5_000),
            (Value::from("0"), 0),
            (Value::from(15_000), 15_000),
            (Value::from("soon"), 5_000),
            (Value::from(1.5), 5_000),
        ];
        for (raw, expected) in cases {
            let response = TransferResponse::failure("busy").with_pause(raw.clone());
            assert_eq!(
                response.requested_pause(),
                Some(Duration::from_millis(expected)),
                "pause {}",
                raw
            );
        }
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            TransferResponse::from_json("[1, 2]"),
            Err(PeerError::Decode(_))
        ));
        assert!(TransferResponse::from_json("not json").is_err());
    }
}
