//! # Cryptographic Primitives
//!
//! Digest helpers shared by the identity and storage layers. Everything here
//! is a thin wrapper around the RustCrypto implementations. Signing lives in
//! [`crate::identity`], next to the key material it needs.

pub mod hash;

pub use hash::{hash160, ripemd160, sha256, sha256_array};
