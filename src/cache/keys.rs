//! Cache key derivation.
//!
//! A route's record is addressed by the SHA-256 of the literal route string.
//! The cache never rewrites routes; callers that want `/x` and `/x/` to share
//! an entry must normalize before asking (see [`normalize_route`]).

use std::fmt;

use sha2::{Digest, Sha256};

/// Filesystem-safe, fixed-length identifier of a cached route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `route`.
    pub fn for_route(route: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(route.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a record file stem back into a key, rejecting anything that is
    /// not a 64-character lowercase hex digest.
    pub(crate) fn from_file_stem(stem: &str) -> Option<Self> {
        let valid = stem.len() == 64
            && stem
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(stem.to_string()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form used by the HTTP front door before consulting the cache.
///
/// Strips a trailing slash (except for the root) and guarantees a leading
/// slash. Query strings are left untouched.
pub fn normalize_route(raw: &str) -> String {
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };

    let mut path = path.trim().to_string();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    match query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path,
    }
}
