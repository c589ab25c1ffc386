//! Cache key derivation from request descriptors
//!
//! A key is the hex SHA-256 of the normalized URL followed by the
//! cache-relevant headers in canonical order. Keys double as file names in
//! the disk tier, so they only ever contain `[0-9a-f]`.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// URL plus the headers that affect the identity of the fetched image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    url: String,
    headers: Vec<(String, String)>,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Attach a header that changes what the server returns (e.g. `Accept`).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// Stable, filename-safe identifier shared by both cache tiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Length of a hex-encoded SHA-256 digest.
    pub const LEN: usize = 64;

    /// Recover a key from a file stem found in the cache directory.
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let valid = stem.len() == Self::LEN
            && stem
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| CacheKey(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CacheKey::from_file_stem(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid cache key: {}", raw)))
    }
}

/// Derive the cache key for a request.
///
/// Descriptors that differ only in URL spelling the server cannot observe
/// (host case, default port, fragment) or in header order/name case map to
/// the same key.
pub fn derive_key(descriptor: &RequestDescriptor) -> Result<CacheKey> {
    let url = normalize_url(&descriptor.url)?;

    let mut headers = descriptor
        .headers
        .iter()
        .map(|(name, value)| {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(CacheError::InvalidKeyDerivation(
                    "empty header name".to_string(),
                ));
            }
            Ok((name, value.trim().to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    headers.sort();

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    // Length prefixes keep `a: b:c` and `a:b: c` apart.
    for (name, value) in &headers {
        for part in [name, value] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
    }

    Ok(CacheKey(hex::encode(hasher.finalize())))
}

/// Key for a bare URL with no cache-relevant headers
pub fn derive_url_key(url: &str) -> Result<CacheKey> {
    derive_key(&RequestDescriptor::new(url))
}

fn normalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| CacheError::InvalidKeyDerivation(format!("{}: {}", raw, e)))?;

    if url.cannot_be_a_base() {
        return Err(CacheError::InvalidKeyDerivation(format!(
            "{}: not a fetchable URL",
            raw
        )));
    }

    url.set_fragment(None);
    Ok(url.into())
}
