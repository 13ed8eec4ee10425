//! Sha1Hash and Address: content identity and its `sha1://` URI form.
//!
//! A blob is named by the SHA-1 of its bytes (40 lowercase hex chars). An
//! [`Address`] pairs that hash with an optional basename so tools that care
//! about file extensions can be handed a sensible file name:
//!
//! ```text
//! sha1://2aae6c35c94fcfb415dbe95f408b9ce91ee846ed
//! sha1://2aae6c35c94fcfb415dbe95f408b9ce91ee846ed/recording.mda
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use thiserror::Error;

/// URI scheme prefix for content addresses.
pub const SHA1_SCHEME: &str = "sha1://";

/// A SHA-1 content hash - 160 bits (20 bytes, 40 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha1Hash(String);

/// Errors that can occur when parsing hashes and addresses.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hash length: expected 40 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in hash")]
    InvalidHex,

    #[error("not a content address: {0}")]
    InvalidAddress(String),
}

impl Sha1Hash {
    /// Hash data and return the content hash.
    pub fn from_data(data: &[u8]) -> Self {
        Self(hex::encode(Sha1::digest(data)))
    }

    /// Hash everything readable from `reader` without buffering it whole.
    pub fn from_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Create from an existing hash string (validates format).
    pub fn from_str_checked(s: &str) -> Result<Self, HashError> {
        if s.len() != 40 {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex);
        }
        Ok(Self(s.to_lowercase()))
    }

    /// First directory level: one hex char.
    pub fn shard_outer(&self) -> &str {
        &self.0[0..1]
    }

    /// Second directory level: the next two hex chars.
    pub fn shard_inner(&self) -> &str {
        &self.0[1..3]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Sha1Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}

impl AsRef<str> for Sha1Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A content address: hash plus optional basename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub hash: Sha1Hash,
    pub basename: Option<String>,
}

impl Address {
    pub fn new(hash: Sha1Hash) -> Self {
        Self {
            hash,
            basename: None,
        }
    }

    pub fn with_basename(mut self, basename: impl Into<String>) -> Self {
        let basename = basename.into();
        self.basename = if basename.is_empty() {
            None
        } else {
            Some(basename)
        };
        self
    }

    /// Whether a string looks like a content address (`sha1://...`).
    pub fn is_address(s: &str) -> bool {
        s.starts_with(SHA1_SCHEME)
    }

    /// Parse `sha1://<hex>[/<basename>]` or a bare 40-char hex hash.
    pub fn parse(s: &str) -> Result<Self, HashError> {
        let rest = s.strip_prefix(SHA1_SCHEME).unwrap_or(s);
        let (hex_part, basename) = match rest.split_once('/') {
            Some((h, b)) => (h, Some(b)),
            None => (rest, None),
        };
        if !Self::is_address(s) && basename.is_some() {
            return Err(HashError::InvalidAddress(s.to_string()));
        }
        let hash = Sha1Hash::from_str_checked(hex_part)
            .map_err(|_| HashError::InvalidAddress(s.to_string()))?;
        let address = Self::new(hash);
        Ok(match basename {
            Some(b) => address.with_basename(b),
            None => address,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.basename {
            Some(basename) => write!(f, "{}{}/{}", SHA1_SCHEME, self.hash, basename),
            None => write!(f, "{}{}", SHA1_SCHEME, self.hash),
        }
    }
}

impl FromStr for Address {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Sha1Hash> for Address {
    fn from(hash: Sha1Hash) -> Self {
        Self::new(hash)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_known_vector() {
        let hash = Sha1Hash::from_data(b"abc");
        assert_eq!(hash.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_empty_input_hash() {
        let hash = Sha1Hash::from_data(b"");
        assert_eq!(hash.as_str(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_from_reader_matches_from_data() {
        let data = vec![7u8; 200_000];
        let streamed = Sha1Hash::from_reader(&data[..]).unwrap();
        assert_eq!(streamed, Sha1Hash::from_data(&data));
    }

    #[test]
    fn test_shards() {
        let hash = Sha1Hash::from_data(b"abc");
        assert_eq!(hash.shard_outer(), "a");
        assert_eq!(hash.shard_inner(), "99");
    }

    #[test]
    fn test_from_str_invalid() {
        assert!(matches!(
            "short".parse::<Sha1Hash>(),
            Err(HashError::InvalidLength(5))
        ));
        assert!(matches!(
            "z".repeat(40).parse::<Sha1Hash>(),
            Err(HashError::InvalidHex)
        ));
    }

    #[test]
    fn test_address_parse_and_display() {
        let s = "sha1://a9993e364706816aba3e25717850c26c9cd0d89d/data/firings.mda";
        let address = Address::parse(s).unwrap();
        assert_eq!(address.hash.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(address.basename.as_deref(), Some("data/firings.mda"));
        assert_eq!(address.to_string(), s);
    }

    #[test]
    fn test_address_bare_hash() {
        let address = Address::parse("A9993E364706816ABA3E25717850C26C9CD0D89D").unwrap();
        assert_eq!(
            address.to_string(),
            "sha1://a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!(Address::parse("sha1://nothex").is_err());
        assert!(Address::parse("/tmp/some/file").is_err());
    }

    #[test]
    fn test_address_serde_as_string() {
        let address = Address::new(Sha1Hash::from_data(b"abc")).with_basename("x.txt");
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(
            json,
            "\"sha1://a9993e364706816aba3e25717850c26c9cd0d89d/x.txt\""
        );
        let restored: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, address);
    }
}
