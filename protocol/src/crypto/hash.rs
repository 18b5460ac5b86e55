//! # Hashing Utilities
//!
//! Digest functions used by the triad matrix. Two families, no more:
//!
//! - **SHA-256**: signs payloads (the wallet signs the SHA-256 of the
//!   canonical payload string) and forms the first stage of address
//!   derivation.
//! - **RIPEMD-160**: second stage of address derivation. Applied to the
//!   raw SHA-256 digest bytes, not to their hex form.
//!
//! The composition `RIPEMD-160(SHA-256(x))` is exposed as [`hash160`].

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of the input data.
///
/// Returns a 32-byte digest as a `Vec<u8>`. Prefer [`sha256_array`] in hot
/// paths where a fixed-size type propagates naturally.
///
/// # Example
///
/// ```
/// use triad_protocol::crypto::sha256;
///
/// let hash = sha256(b"triad matrix");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> Vec<u8> {
    sha256_array(data).to_vec()
}

/// Compute the SHA-256 hash and return a fixed-size array.
pub fn sha256_array(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the RIPEMD-160 hash of the input data.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `RIPEMD-160(SHA-256(data))`, the 160-bit fingerprint addresses are cut from.
///
/// # Example
///
/// ```
/// use triad_protocol::crypto::{hash160, ripemd160, sha256_array};
///
/// let data = b"public key bytes";
/// assert_eq!(hash160(data), ripemd160(&sha256_array(data)));
/// ```
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256_array(data))
}
