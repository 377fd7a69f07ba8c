//! URL helpers shared by the stacker and the admission filter.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use url::Url;

/// Length of every url and peer hash.
pub const HASH_LENGTH: usize = 12;

/// Placeholder hash for "no referrer" and "local / unknown initiator".
pub const DUMMY_HASH: &str = "------------";

/// Deterministic 12-character hash of a parsed URL.
///
/// The hash is computed over the normalized serialization, so `HTTP://Example.com`
/// and `http://example.com/` collapse to the same key.
pub fn url_hash(url: &Url) -> String {
    short_hash(url.as_str().as_bytes())
}

/// `HASH_LENGTH`-character base64 digest of arbitrary bytes.
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    // Every 3 digest bytes encode to 4 base64 characters.
    URL_SAFE_NO_PAD.encode(&digest[..HASH_LENGTH / 4 * 3])
}

/// Hash a URL string, `None` when it does not parse.
pub fn url_hash_str(url: &str) -> Option<String> {
    Url::parse(url.trim()).ok().map(|u| url_hash(&u))
}

/// Referrer hash, falling back to the dummy hash for absent or unparseable referrers.
pub fn referrer_hash(referrer: Option<&str>) -> String {
    referrer
        .and_then(url_hash_str)
        .unwrap_or_else(|| DUMMY_HASH.to_string())
}

/// Dynamic / session-bound URLs that are never worth crawling.
pub fn is_cgi(url: &str) -> bool {
    const MARKERS: &[&str] = &[
        ".cgi",
        ".exe",
        ";jsessionid=",
        "sessionid/",
        "phpsessid=",
        "search.php?sid=",
        "memberlist.php?sid=",
    ];
    let lower = url.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

/// URLs carrying query parameters.
pub fn is_post(url: &str) -> bool {
    url.contains('?') || url.contains('&')
}
