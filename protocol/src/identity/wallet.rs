//! # Wallet
//!
//! secp256k1 key management, address derivation, and payload signing.
//!
//! A wallet holds at most one key pair. It starts empty; either
//! [`Wallet::generate_key_pair`] or [`Wallet::import_from_private_key`] loads
//! a key. Signing an empty wallet fails with [`WalletError::NotInitialized`].
//!
//! ## Addresses
//!
//! ```text
//! compressed pubkey (33B) -> SHA-256 -> RIPEMD-160 -> hex -> "TRD" + hex -> first 35 chars
//! ```
//!
//! The mapping is deterministic: the same public key always yields the same
//! address. Addresses identify triad creators and registered validators.
//!
//! ## Signatures
//!
//! Payloads are canonicalized to a string (strings as-is, everything else as
//! compact JSON with sorted object keys), hashed with SHA-256, and signed with
//! RFC 6979 deterministic ECDSA. The result is exported as hex `r`, hex `s`,
//! and the recovery id.
//!
//! Key bytes are never logged and `Debug` never prints them.

use std::fmt;

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::FieldBytes;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ADDRESS_LENGTH, ADDRESS_PREFIX, PRIVATE_KEY_HEX_LENGTH};
use crate::crypto::hash::{hash160, sha256_array};

/// Errors that can occur during wallet operations.
///
/// Import errors are intentionally vague about *why* a key was rejected.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("private key must be exactly {PRIVATE_KEY_HEX_LENGTH} hex characters")]
    InvalidFormat,

    #[error("private key import failed")]
    ImportFailed,

    #[error("wallet has no key loaded")]
    NotInitialized,

    #[error("payload cannot be canonicalized: {0}")]
    InvalidPayload(String),

    #[error("signing failed")]
    SigningFailed,
}

pub type WalletResult<T> = Result<T, WalletError>;

/// Hex-encoded key material plus the derived address.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// 32-byte secret scalar, 64 hex characters.
    pub private_key: String,
    /// Compressed SEC1 point, 66 hex characters.
    pub public_key: String,
    /// Address derived from the public key.
    pub address: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Signature components as produced by [`Wallet::sign_data`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureParts {
    /// Hex-encoded `r` scalar.
    pub r: String,
    /// Hex-encoded `s` scalar (low-S normalized).
    pub s: String,
    /// Public key recovery id (0..=3).
    pub recovery_param: u8,
}

/// Loaded key state. Present only after a successful generate or import.
#[derive(Clone)]
struct LoadedKey {
    signing_key: SigningKey,
    public_key: String,
    address: String,
}

/// A single-key secp256k1 wallet.
///
/// # Examples
///
/// ```
/// use triad_protocol::identity::Wallet;
///
/// let mut wallet = Wallet::new();
/// let pair = wallet.generate_key_pair();
///
/// let sig = wallet.sign_data("hello").unwrap();
/// assert!(Wallet::verify_signature("hello", &sig, &pair.public_key));
/// assert!(!Wallet::verify_signature("hullo", &sig, &pair.public_key));
/// ```
#[derive(Clone, Default)]
pub struct Wallet {
    key: Option<LoadedKey>,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Creates an empty wallet with no key loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a wallet from a hex-encoded private key.
    pub fn from_private_key(private_key_hex: &str) -> WalletResult<Self> {
        let mut wallet = Self::new();
        wallet.import_from_private_key(private_key_hex)?;
        Ok(wallet)
    }

    /// Generates a fresh key pair from the OS RNG, replacing any loaded key.
    pub fn generate_key_pair(&mut self) -> KeyPair {
        let signing_key = SigningKey::random(&mut OsRng);
        self.load(signing_key)
    }

    /// Loads a key from exactly 64 hex characters.
    ///
    /// Fails with [`WalletError::InvalidFormat`] on a malformed string. If the
    /// curve rejects the scalar (zero, or not below the group order), the
    /// wallet is cleared and [`WalletError::ImportFailed`] is returned.
    pub fn import_from_private_key(&mut self, private_key_hex: &str) -> WalletResult<KeyPair> {
        if private_key_hex.len() != PRIVATE_KEY_HEX_LENGTH
            || !private_key_hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(WalletError::InvalidFormat);
        }

        let bytes = hex::decode(private_key_hex).map_err(|_| WalletError::InvalidFormat)?;
        match SigningKey::from_slice(&bytes) {
            Ok(signing_key) => Ok(self.load(signing_key)),
            Err(_) => {
                self.key = None;
                Err(WalletError::ImportFailed)
            }
        }
    }

    /// Address of the loaded key, if any.
    pub fn address(&self) -> Option<&str> {
        self.key.as_ref().map(|k| k.address.as_str())
    }

    /// Compressed public key hex of the loaded key, if any.
    pub fn public_key(&self) -> Option<&str> {
        self.key.as_ref().map(|k| k.public_key.as_str())
    }

    /// Exports the private key as hex. Handle with care.
    pub fn private_key(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|k| hex::encode(k.signing_key.to_bytes()))
    }

    /// Returns `true` if a key is loaded.
    pub fn is_loaded(&self) -> bool {
        self.key.is_some()
    }

    /// Signs the canonical form of `data`.
    pub fn sign_data<T: Serialize + ?Sized>(&self, data: &T) -> WalletResult<SignatureParts> {
        let key = self.key.as_ref().ok_or(WalletError::NotInitialized)?;
        let canonical = canonicalize(data)?;
        let digest = sha256_array(canonical.as_bytes());

        let (signature, recovery_id): (Signature, RecoveryId) = key
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|_| WalletError::SigningFailed)?;

        let (r, s) = signature.split_bytes();
        Ok(SignatureParts {
            r: hex::encode(r),
            s: hex::encode(s),
            recovery_param: recovery_id.to_byte(),
        })
    }

    /// Checks `signature` over `data` against a compressed or uncompressed
    /// public key in hex. Never panics; any malformed input yields `false`.
    pub fn verify_signature<T: Serialize + ?Sized>(
        data: &T,
        signature: &SignatureParts,
        public_key_hex: &str,
    ) -> bool {
        let Ok(canonical) = canonicalize(data) else {
            return false;
        };
        let Some(verifying_key) = parse_public_key(public_key_hex) else {
            return false;
        };
        let Some(sig) = parse_signature(signature) else {
            return false;
        };

        let digest = sha256_array(canonical.as_bytes());
        verifying_key.verify_prehash(&digest, &sig).is_ok()
    }

    /// Recovers the signer's compressed public key from a signature.
    pub fn recover_public_key<T: Serialize + ?Sized>(
        data: &T,
        signature: &SignatureParts,
    ) -> Option<String> {
        let canonical = canonicalize(data).ok()?;
        let sig = parse_signature(signature)?;
        let recovery_id = RecoveryId::from_byte(signature.recovery_param)?;
        let digest = sha256_array(canonical.as_bytes());

        let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id).ok()?;
        Some(hex::encode(key.to_encoded_point(true).as_bytes()))
    }

    fn load(&mut self, signing_key: SigningKey) -> KeyPair {
        let compressed = signing_key.verifying_key().to_encoded_point(true);
        let public_key = hex::encode(compressed.as_bytes());
        let address = derive_address(compressed.as_bytes());
        let private_key = hex::encode(signing_key.to_bytes());

        self.key = Some(LoadedKey {
            signing_key,
            public_key: public_key.clone(),
            address: address.clone(),
        });

        KeyPair {
            private_key,
            public_key,
            address,
        }
    }
}

/// Derives an address from compressed public key bytes.
pub fn derive_address(public_key: &[u8]) -> String {
    let mut address = format!("{ADDRESS_PREFIX}{}", hex::encode(hash160(public_key)));
    address.truncate(ADDRESS_LENGTH);
    address
}

/// Derives an address from a hex-encoded public key.
pub fn address_from_public_key_hex(public_key_hex: &str) -> Option<String> {
    let key = parse_public_key(public_key_hex)?;
    Some(derive_address(key.to_encoded_point(true).as_bytes()))
}

/// Stable string form of a payload: strings pass through untouched,
/// everything else is compact JSON. `serde_json` maps keep keys sorted, so
/// two structurally equal objects always canonicalize identically.
pub fn canonicalize<T: Serialize + ?Sized>(data: &T) -> WalletResult<String> {
    let value =
        serde_json::to_value(data).map_err(|e| WalletError::InvalidPayload(e.to_string()))?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn parse_public_key(public_key_hex: &str) -> Option<VerifyingKey> {
    let bytes = hex::decode(public_key_hex).ok()?;
    VerifyingKey::from_sec1_bytes(&bytes).ok()
}

fn parse_signature(signature: &SignatureParts) -> Option<Signature> {
    let r = decode_scalar(&signature.r)?;
    let s = decode_scalar(&signature.s)?;
    Signature::from_scalars(FieldBytes::from(r), FieldBytes::from(s)).ok()
}

/// Decodes a big-endian scalar of at most 64 hex digits, left-padding short
/// encodings with zeros.
fn decode_scalar(hex_str: &str) -> Option<[u8; 32]> {
    if hex_str.is_empty() || hex_str.len() > 64 {
        return None;
    }
    let padded = format!("{hex_str:0>64}");
    let bytes = hex::decode(padded).ok()?;
    bytes.try_into().ok()
}
