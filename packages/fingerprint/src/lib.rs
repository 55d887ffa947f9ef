#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Content fingerprints for file chunks.
//!
//! A [`Fingerprint`] identifies the exact bytes of one chunk and is the key
//! of the content index. Two hashing modes exist:
//!
//! | Mode | Digests | Collision resistance |
//! |---|---|---|
//! | [`HashMode::Default`] | SHA3-512 + BLAKE2b-512 | Cryptographic, both must match |
//! | [`HashMode::Fast`] | XXH64 | None |
//!
//! **`fast` mode can produce false-positive matches.** Two different chunks
//! with the same 64-bit hash are treated as identical, and the second chunk
//! silently becomes a copy of the first one's bytes. It must only ever be
//! selected explicitly by the operator.

use blake2::Blake2b512;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_512};
use strum_macros::{AsRefStr, Display, EnumString};

/// Placeholder stored in the second key slot for [`Fingerprint::Fast`].
pub const FAST_PLACEHOLDER: &str = "-";

/// Which digests to compute for each chunk.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HashMode {
    /// SHA3-512 and BLAKE2b-512.
    #[default]
    Default,
    /// XXH64 only. Trades collision resistance for throughput.
    Fast,
}

impl HashMode {
    /// Names of the two digest slots, as stored in the index.
    #[must_use]
    pub const fn digest_names(self) -> (&'static str, &'static str) {
        match self {
            Self::Default => ("sha3", "blake2"),
            Self::Fast => ("xxhash", "blank"),
        }
    }
}

/// Hex-encoded digests of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Fingerprint {
    /// Two independent cryptographic digests.
    Default {
        /// SHA3-512 hex digest.
        sha3: String,
        /// BLAKE2b-512 hex digest.
        blake2: String,
    },
    /// Single non-cryptographic digest.
    Fast {
        /// XXH64 hex digest (16 characters, big-endian).
        xxhash: String,
    },
}

/// Error returned when stored key parts cannot be turned back into a
/// [`Fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidKeyError {
    /// The first key slot as stored.
    pub first: String,
    /// The second key slot as stored.
    pub second: String,
}

impl std::fmt::Display for InvalidKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid fingerprint key ({:?}, {:?})",
            self.first, self.second
        )
    }
}

impl std::error::Error for InvalidKeyError {}

impl Fingerprint {
    /// The hashing mode this fingerprint was computed with.
    #[must_use]
    pub const fn mode(&self) -> HashMode {
        match self {
            Self::Default { .. } => HashMode::Default,
            Self::Fast { .. } => HashMode::Fast,
        }
    }

    /// The two key slots used by the keyed store.
    ///
    /// Fast fingerprints put the XXH64 digest in the first slot and
    /// [`FAST_PLACEHOLDER`] in the second, so the two variants can never
    /// produce the same key pair.
    #[must_use]
    pub fn key_parts(&self) -> (&str, &str) {
        match self {
            Self::Default { sha3, blake2 } => (sha3, blake2),
            Self::Fast { xxhash } => (xxhash, FAST_PLACEHOLDER),
        }
    }

    /// Rebuilds a fingerprint from the two key slots of a stored item.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidKeyError`] if either slot is empty.
    pub fn from_key_parts(first: &str, second: &str) -> Result<Self, InvalidKeyError> {
        if first.is_empty() || second.is_empty() {
            return Err(InvalidKeyError {
                first: first.to_string(),
                second: second.to_string(),
            });
        }

        if second == FAST_PLACEHOLDER {
            Ok(Self::Fast {
                xxhash: first.to_string(),
            })
        } else {
            Ok(Self::Default {
                sha3: first.to_string(),
                blake2: second.to_string(),
            })
        }
    }

    /// Short form for log lines (first 12 hex characters of each digest).
    #[must_use]
    pub fn short(&self) -> String {
        let (first, second) = self.key_parts();
        let first = &first[..first.len().min(12)];
        match self {
            Self::Default { .. } => format!("{first}/{}", &second[..second.len().min(12)]),
            Self::Fast { .. } => first.to_string(),
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (first, second) = self.key_parts();
        write!(f, "{}:{first}:{second}", self.mode())
    }
}

/// Computes the fingerprint of `bytes` under `mode`.
#[must_use]
pub fn fingerprint(bytes: &[u8], mode: HashMode) -> Fingerprint {
    match mode {
        HashMode::Default => Fingerprint::Default {
            sha3: hex::encode(Sha3_512::digest(bytes)),
            blake2: hex::encode(Blake2b512::digest(bytes)),
        },
        HashMode::Fast => Fingerprint::Fast {
            xxhash: format!("{:016x}", xxhash_rust::xxh64::xxh64(bytes, 0)),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn default_mode_produces_two_512_bit_digests() {
        let fp = fingerprint(b"hello world", HashMode::Default);
        let Fingerprint::Default { sha3, blake2 } = &fp else {
            panic!("expected default fingerprint, got {fp:?}");
        };
        assert_eq!(sha3.len(), 128);
        assert_eq!(blake2.len(), 128);
        assert_ne!(sha3, blake2);
    }

    #[test]
    fn sha3_digest_matches_known_vector() {
        let fp = fingerprint(b"", HashMode::Default);
        let (sha3, _) = fp.key_parts();
        assert!(sha3.starts_with("a69f73cca23a9ac5c8b567dc185a756e97c982164fe25859e0d1dcc1475c80a6"));
    }

    #[test]
    fn single_byte_difference_changes_default_fingerprint() {
        let mut a = vec![0u8; 64 * 1024];
        let b = a.clone();
        a[31_337] = 1;
        assert_ne!(
            fingerprint(&a, HashMode::Default),
            fingerprint(&b, HashMode::Default)
        );
    }

    #[test]
    fn identical_bytes_produce_identical_fingerprints() {
        let data = vec![7u8; 4096];
        assert_eq!(
            fingerprint(&data, HashMode::Default),
            fingerprint(&data.clone(), HashMode::Default)
        );
        assert_eq!(
            fingerprint(&data, HashMode::Fast),
            fingerprint(&data.clone(), HashMode::Fast)
        );
    }

    #[test]
    fn fast_mode_uses_placeholder_second_slot() {
        let fp = fingerprint(b"abc", HashMode::Fast);
        let (first, second) = fp.key_parts();
        assert_eq!(first.len(), 16);
        assert_eq!(second, FAST_PLACEHOLDER);
        assert_eq!(fp.mode(), HashMode::Fast);
    }

    #[test]
    fn key_parts_round_trip_through_store_representation() {
        for mode in [HashMode::Default, HashMode::Fast] {
            let fp = fingerprint(b"some chunk", mode);
            let (first, second) = fp.key_parts();
            assert_eq!(Fingerprint::from_key_parts(first, second).unwrap(), fp);
        }
    }

    #[test]
    fn from_key_parts_rejects_empty_slots() {
        assert!(Fingerprint::from_key_parts("", "-").is_err());
        assert!(Fingerprint::from_key_parts("abc", "").is_err());
    }

    #[test]
    fn hash_mode_parses_from_lowercase_names() {
        assert_eq!(HashMode::from_str("default").unwrap(), HashMode::Default);
        assert_eq!(HashMode::from_str("fast").unwrap(), HashMode::Fast);
        assert!(HashMode::from_str("turbo").is_err());
        assert_eq!(HashMode::Fast.to_string(), "fast");
        assert_eq!(HashMode::default(), HashMode::Default);
    }
}
