//! Shared utility functions

use sha2::{Digest, Sha256};
use url::Url;

/// Hex-encoded SHA-256 of a URL string.
///
/// This is the canonical opaque key for a URL: it doubles as the crawl
/// request id returned on submission and as the cache key suffix for the
/// deduplication flag.
pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Resolve a possibly-relative URL reference against a base document URL.
///
/// Returns `None` for empty input or references the base cannot absorb
/// (e.g. `data:` URIs are returned as-is since they are already absolute).
pub fn to_absolute_url(base: &Url, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    base.join(reference).ok().map(|u| u.to_string())
}
