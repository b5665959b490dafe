//! Cryptographic primitives: SHA-256 digests and BLS12-381 key material.

pub mod bls;
pub mod digest;

pub use bls::{
    aggregate_public_keys, aggregate_signatures, verify, BlsError, BlsPrivateKey, BlsPublicKey,
    BlsSignature, BLS_PRIVATE_KEY_LEN, BLS_PUBLIC_KEY_LEN, BLS_SIGNATURE_LEN,
};
pub use digest::{hash_combine, is_right_tagged, tag_left, tag_right, Digest, DIGEST_LEN};
