use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::ContentType;

use super::CacheError;

/// Separates key parts before hashing, so that `["ab", "c"]` and `["a", "bc"]` differ.
const PART_SEPARATOR: &[u8] = b"\0";

/// The identity of one cached asset.
///
/// The key is made up of string parts: the (display) identity of the source, followed by a
/// non-default request method and request body if present, and finally the requested content
/// interpretation if that changes what ends up on disk.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    parts: Arc<[String]>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash_hex(64))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Starts building a key for the given source identity.
    pub fn builder(identity: impl Into<String>) -> CacheKeyBuilder {
        let identity = identity.into();
        let mut metadata = String::new();
        // writing into a `String` can not fail
        let _ = writeln!(metadata, "identity: {identity}");

        CacheKeyBuilder {
            parts: vec![identity],
            metadata,
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The raw key parts.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The comma-joined key parts, used to coalesce concurrent requests.
    pub fn uid(&self) -> String {
        self.parts.join(",")
    }

    /// The lowercase hex digest truncated to `length` characters.
    ///
    /// `length` is clamped to `1..=64`.
    pub fn hash_hex(&self, length: usize) -> String {
        hex_prefix(&self.hash, length)
    }
}

/// A builder for [`CacheKey`]s.
pub struct CacheKeyBuilder {
    parts: Vec<String>,
    metadata: String,
}

impl CacheKeyBuilder {
    /// Folds the shape of the request into the key.
    ///
    /// A `GET` (explicit or implied) adds nothing, so both spellings share one key. Any other
    /// method, and a non-empty body, become separate key parts.
    pub fn request_shape(mut self, method: Option<&str>, body: Option<&str>) -> Self {
        if let Some(method) = method.filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("GET")) {
            let method = method.to_ascii_uppercase();
            let _ = writeln!(self.metadata, "method: {method}");
            self.parts.push(method);
        }
        if let Some(body) = body.filter(|b| !b.is_empty()) {
            let _ = writeln!(self.metadata, "body: {body}");
            self.parts.push(body.to_owned());
        }
        self
    }

    /// Folds the requested content interpretation into the key, if it affects what is stored.
    pub fn interpretation(mut self, ty: ContentType) -> Self {
        if ty.affects_cache_key() {
            let _ = writeln!(self.metadata, "type: {ty}");
            self.parts.push(ty.as_str().to_owned());
        }
        self
    }

    /// Finalize the [`CacheKey`].
    ///
    /// Fails if any of the parts is empty.
    pub fn build(self) -> Result<CacheKey, CacheError> {
        let hash = digest(&self.parts)?;
        Ok(CacheKey {
            metadata: self.metadata.into(),
            parts: self.parts.into(),
            hash,
        })
    }
}

/// Hashes the given parts into a stable, lowercase hex string of `length` characters.
///
/// Every part has to be non-empty, otherwise [`CacheError::InvalidKeyPart`] names the offending
/// index. `length` is clamped to `1..=64`.
pub fn get_hash<I, S>(parts: I, length: usize) -> Result<String, CacheError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let hash = digest(parts)?;
    Ok(hex_prefix(&hash, length))
}

fn digest<I, S>(parts: I) -> Result<[u8; 32], CacheError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    let mut count = 0;
    for (index, part) in parts.into_iter().enumerate() {
        let part = part.as_ref();
        if part.is_empty() {
            return Err(CacheError::InvalidKeyPart(index));
        }
        if index > 0 {
            hasher.update(PART_SEPARATOR);
        }
        hasher.update(part.as_bytes());
        count += 1;
    }
    if count == 0 {
        return Err(CacheError::InvalidKeyPart(0));
    }
    Ok(hasher.finalize().into())
}

fn hex_prefix(hash: &[u8; 32], length: usize) -> String {
    let length = length.clamp(1, 64);
    let mut hex = String::with_capacity(64);
    for b in hash {
        let _ = write!(hex, "{b:02x}");
    }
    hex.truncate(length);
    hex
}
