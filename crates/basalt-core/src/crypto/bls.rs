use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature,
};
use blst::BLST_ERROR;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Number of bytes in a serialized BLS12-381 public key (affine G1,
/// uncompressed, little-endian field elements).
pub const BLS_PUBLIC_KEY_LEN: usize = 96;

/// Number of bytes in a serialized BLS12-381 signature (affine G2,
/// uncompressed, little-endian field elements).
pub const BLS_SIGNATURE_LEN: usize = 192;

/// Number of bytes in a serialized BLS12-381 private key scalar.
pub const BLS_PRIVATE_KEY_LEN: usize = 32;

/// Domain separation tag for the proof-of-possession signature scheme.
/// Signatures live in G2, so this is the G2 suite.
const POP_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

const PUBLIC_KEY_PREFIX: &str = "PUB_BLS_";
const SIGNATURE_PREFIX: &str = "SIG_BLS_";
const PRIVATE_KEY_PREFIX: &str = "PVT_BLS_";

/// Errors from parsing or aggregating BLS key material.
/// Verification failures are not errors; `verify` returns `bool`.
#[derive(Debug, Error)]
pub enum BlsError {
    #[error("Invalid BLS public key encoding: {reason}")]
    InvalidPublicKey { reason: String },

    #[error("Invalid BLS signature encoding: {reason}")]
    InvalidSignature { reason: String },

    #[error("Invalid BLS private key encoding: {reason}")]
    InvalidPrivateKey { reason: String },

    #[error("BLS string form must start with {expected}")]
    MissingPrefix { expected: &'static str },

    #[error("Cannot aggregate an empty set")]
    EmptyAggregation,
}

/// Reverse each 48-byte field limb of a G1 affine blob, converting between
/// big-endian (blst's serialized form) and the canonical little-endian form.
/// The operation is its own inverse.
fn g1_swap_endianness(bytes: &[u8; BLS_PUBLIC_KEY_LEN]) -> [u8; BLS_PUBLIC_KEY_LEN] {
    let mut out = [0u8; BLS_PUBLIC_KEY_LEN];
    for (i, limb) in bytes.chunks_exact(48).enumerate() {
        for (j, b) in limb.iter().rev().enumerate() {
            out[i * 48 + j] = *b;
        }
    }
    out
}

/// G2 analog of [`g1_swap_endianness`]. Fp2 coordinates additionally swap
/// limb order: blst serializes `c1 || c0` big-endian, the canonical form is
/// `c0 || c1` little-endian. Also its own inverse.
fn g2_swap_endianness(bytes: &[u8; BLS_SIGNATURE_LEN]) -> [u8; BLS_SIGNATURE_LEN] {
    let mut out = [0u8; BLS_SIGNATURE_LEN];
    for coord in 0..2 {
        let base = coord * 96;
        for limb in 0..2 {
            let src = &bytes[base + limb * 48..base + (limb + 1) * 48];
            let dst = base + (1 - limb) * 48;
            for (j, b) in src.iter().rev().enumerate() {
                out[dst + j] = *b;
            }
        }
    }
    out
}

/// Constant-time byte-slice equality. Folds the XOR of every byte pair so
/// the comparison touches all bytes regardless of where a mismatch sits.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// A BLS12-381 public key: the canonical 96-byte affine little-endian blob
/// plus the parsed curve point.
///
/// The serialized form is canonical: equality, ordering and hashing all use
/// it, and it is what goes on the wire. The cached point makes aggregation
/// and verification cheap; parsing (with curve and subgroup checks) happens
/// exactly once, at construction.
#[derive(Clone)]
pub struct BlsPublicKey {
    bytes: [u8; BLS_PUBLIC_KEY_LEN],
    point: PublicKey,
}

impl BlsPublicKey {
    /// Parse a key from its canonical 96-byte affine little-endian form.
    /// Rejects blobs that are not on the curve or not in the G1 subgroup.
    pub fn from_affine_le_bytes(bytes: [u8; BLS_PUBLIC_KEY_LEN]) -> Result<Self, BlsError> {
        let be = g1_swap_endianness(&bytes);
        let point = PublicKey::from_bytes(&be).map_err(|e| BlsError::InvalidPublicKey {
            reason: format!("{:?}", e),
        })?;
        point.validate().map_err(|e| BlsError::InvalidPublicKey {
            reason: format!("subgroup check failed: {:?}", e),
        })?;
        Ok(Self { bytes, point })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        let arr: [u8; BLS_PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| BlsError::InvalidPublicKey {
                reason: format!("expected {} bytes, got {}", BLS_PUBLIC_KEY_LEN, bytes.len()),
            })?;
        Self::from_affine_le_bytes(arr)
    }

    /// Wrap an already-valid point (an aggregation result).
    fn from_point(point: PublicKey) -> Self {
        let bytes = g1_swap_endianness(&point.serialize());
        Self { bytes, point }
    }

    /// The canonical affine little-endian serialization.
    pub fn affine_le_bytes(&self) -> &[u8; BLS_PUBLIC_KEY_LEN] {
        &self.bytes
    }

    pub(crate) fn point(&self) -> &PublicKey {
        &self.point
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for BlsPublicKey {}

impl PartialOrd for BlsPublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlsPublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl Hash for BlsPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PUBLIC_KEY_PREFIX, URL_SAFE.encode(self.bytes))
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({}{}..)", PUBLIC_KEY_PREFIX, &URL_SAFE.encode(self.bytes)[..12])
    }
}

impl FromStr for BlsPublicKey {
    type Err = BlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = s
            .strip_prefix(PUBLIC_KEY_PREFIX)
            .ok_or(BlsError::MissingPrefix { expected: PUBLIC_KEY_PREFIX })?;
        let bytes = URL_SAFE.decode(data).map_err(|e| BlsError::InvalidPublicKey {
            reason: format!("base64url: {}", e),
        })?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A BLS12-381 signature: the canonical 192-byte affine little-endian blob
/// plus the parsed curve point. Same canonical-form rules as
/// [`BlsPublicKey`].
#[derive(Clone)]
pub struct BlsSignature {
    bytes: [u8; BLS_SIGNATURE_LEN],
    point: Signature,
}

impl BlsSignature {
    /// Parse a signature from its canonical 192-byte affine little-endian
    /// form. Rejects blobs that are not on the curve or not in the G2
    /// subgroup.
    pub fn from_affine_le_bytes(bytes: [u8; BLS_SIGNATURE_LEN]) -> Result<Self, BlsError> {
        let be = g2_swap_endianness(&bytes);
        let point = Signature::from_bytes(&be).map_err(|e| BlsError::InvalidSignature {
            reason: format!("{:?}", e),
        })?;
        point.validate(false).map_err(|e| BlsError::InvalidSignature {
            reason: format!("subgroup check failed: {:?}", e),
        })?;
        Ok(Self { bytes, point })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        let arr: [u8; BLS_SIGNATURE_LEN] =
            bytes.try_into().map_err(|_| BlsError::InvalidSignature {
                reason: format!("expected {} bytes, got {}", BLS_SIGNATURE_LEN, bytes.len()),
            })?;
        Self::from_affine_le_bytes(arr)
    }

    fn from_point(point: Signature) -> Self {
        let bytes = g2_swap_endianness(&point.serialize());
        Self { bytes, point }
    }

    /// The canonical affine little-endian serialization.
    pub fn affine_le_bytes(&self) -> &[u8; BLS_SIGNATURE_LEN] {
        &self.bytes
    }

    pub(crate) fn point(&self) -> &Signature {
        &self.point
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for BlsSignature {}

impl fmt::Display for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SIGNATURE_PREFIX, URL_SAFE.encode(self.bytes))
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({}{}..)", SIGNATURE_PREFIX, &URL_SAFE.encode(self.bytes)[..12])
    }
}

impl FromStr for BlsSignature {
    type Err = BlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = s
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(BlsError::MissingPrefix { expected: SIGNATURE_PREFIX })?;
        let bytes = URL_SAFE.decode(data).map_err(|e| BlsError::InvalidSignature {
            reason: format!("base64url: {}", e),
        })?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A BLS12-381 private key. Signs digests for the vote path.
#[derive(Clone)]
pub struct BlsPrivateKey(SecretKey);

impl BlsPrivateKey {
    /// Derive a key from input key material (at least 32 bytes).
    pub fn generate(ikm: &[u8]) -> Result<Self, BlsError> {
        let sk = SecretKey::key_gen(ikm, &[]).map_err(|e| BlsError::InvalidPrivateKey {
            reason: format!("{:?}", e),
        })?;
        Ok(Self(sk))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        let sk = SecretKey::from_bytes(bytes).map_err(|e| BlsError::InvalidPrivateKey {
            reason: format!("{:?}", e),
        })?;
        Ok(Self(sk))
    }

    pub fn to_bytes(&self) -> [u8; BLS_PRIVATE_KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey::from_point(self.0.sk_to_pk())
    }

    /// Sign a message (in practice: the 32 bytes of a proposal id).
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature::from_point(self.0.sign(message, POP_DST, &[]))
    }
}

impl fmt::Display for BlsPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PRIVATE_KEY_PREFIX, URL_SAFE.encode(self.to_bytes()))
    }
}

impl fmt::Debug for BlsPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the scalar; identify the key by its public half.
        write!(f, "BlsPrivateKey(for {:?})", self.public_key())
    }
}

impl FromStr for BlsPrivateKey {
    type Err = BlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = s
            .strip_prefix(PRIVATE_KEY_PREFIX)
            .ok_or(BlsError::MissingPrefix { expected: PRIVATE_KEY_PREFIX })?;
        let bytes = URL_SAFE.decode(data).map_err(|e| BlsError::InvalidPrivateKey {
            reason: format!("base64url: {}", e),
        })?;
        Self::from_bytes(&bytes)
    }
}

/// Aggregate public keys by group addition. Commutative and associative;
/// errors only on an empty input.
pub fn aggregate_public_keys(keys: &[&BlsPublicKey]) -> Result<BlsPublicKey, BlsError> {
    if keys.is_empty() {
        return Err(BlsError::EmptyAggregation);
    }
    let points: Vec<&PublicKey> = keys.iter().map(|k| k.point()).collect();
    // Points were subgroup-checked at parse time; skip re-validation.
    let agg = AggregatePublicKey::aggregate(&points, false).map_err(|e| {
        BlsError::InvalidPublicKey { reason: format!("aggregation: {:?}", e) }
    })?;
    Ok(BlsPublicKey::from_point(agg.to_public_key()))
}

/// Aggregate signatures by group addition.
pub fn aggregate_signatures(signatures: &[&BlsSignature]) -> Result<BlsSignature, BlsError> {
    if signatures.is_empty() {
        return Err(BlsError::EmptyAggregation);
    }
    let points: Vec<&Signature> = signatures.iter().map(|s| s.point()).collect();
    let agg = AggregateSignature::aggregate(&points, false).map_err(|e| {
        BlsError::InvalidSignature { reason: format!("aggregation: {:?}", e) }
    })?;
    Ok(BlsSignature::from_point(agg.to_signature()))
}

/// Verify a (possibly aggregate) signature over a message against a
/// (possibly aggregate) public key. Never errors: a malformed combination is
/// simply not a valid signature.
pub fn verify(public_key: &BlsPublicKey, message: &[u8], signature: &BlsSignature) -> bool {
    signature
        .point()
        .verify(false, message, POP_DST, &[], public_key.point(), false)
        == BLST_ERROR::BLST_SUCCESS
}
