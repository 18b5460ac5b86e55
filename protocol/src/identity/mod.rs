//! # Identity Module
//!
//! Every triad carries the address of the wallet that created it, and every
//! validator registers by address. This module owns the key material those
//! addresses come from.
//!
//! ## Design Decisions
//!
//! - secp256k1 via the `k256` crate: compact 33-byte compressed keys and
//!   recoverable signatures.
//! - Addresses are a tagged, truncated hash160 of the compressed public key.
//!   See [`wallet`] for the exact construction.
//! - A wallet holds one key in memory. Persisting it is the caller's job
//!   (the node binary writes a 0600 key file).

pub mod wallet;

pub use wallet::{
    address_from_public_key_hex, canonicalize, derive_address, KeyPair, SignatureParts, Wallet,
    WalletError, WalletResult,
};
