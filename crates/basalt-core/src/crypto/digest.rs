use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Number of bytes in a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// A 256-bit SHA-256 digest.
///
/// Equality, ordering (byte-lexicographic) and hashing all operate on the raw
/// byte representation. Digests serialize as hex strings for JSON state and
/// diagnostics; consensus wire formats write the raw 32 bytes directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// The all-zero digest. Used as the root of an empty Merkle tree and as
    /// the parent id of a root proposal.
    pub const ZERO: Digest = Digest([0u8; DIGEST_LEN]);

    /// SHA-256 of arbitrary bytes.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let mut output = [0u8; DIGEST_LEN];
        output.copy_from_slice(&hasher.finalize());
        Digest(output)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != DIGEST_LEN {
            return Err("Invalid digest length");
        }
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(bytes);
        Ok(Digest(arr))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hex is noise in logs; the first 8 hex chars identify a
        // proposal well enough for debugging.
        write!(f, "Digest({}..)", &hex::encode(self.0)[..8])
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Hash two digests into one: `SHA-256(a || b)`.
///
/// This is the node combiner for every Merkle structure in the crate.
/// Order matters.
pub fn hash_combine(a: Digest, b: Digest) -> Digest {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&a.0);
    data[32..].copy_from_slice(&b.0);
    Digest::hash(&data)
}

/// Mark a digest as a left child for the legacy Merkle scheme by clearing
/// the top bit of byte 0. A reversible tag, not a hash.
pub fn tag_left(d: Digest) -> Digest {
    let mut bytes = d.0;
    bytes[0] &= 0x7f;
    Digest(bytes)
}

/// Mark a digest as a right child for the legacy Merkle scheme by setting
/// the top bit of byte 0.
pub fn tag_right(d: Digest) -> Digest {
    let mut bytes = d.0;
    bytes[0] |= 0x80;
    Digest(bytes)
}

/// Whether a digest carries the legacy right-child tag.
pub fn is_right_tagged(d: &Digest) -> bool {
    d.0[0] & 0x80 != 0
}
