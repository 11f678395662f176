//! Tor v3 onion address derivation.
//!
//! Tor v3 (.onion) addresses are derived from Ed25519 public keys:
//!
//! 1. Compute checksum: SHA3-256(".onion checksum" || pubkey || version)[..2]
//! 2. Encode: base32(pubkey || checksum || version)
//! 3. Append ".onion"
//!
//! This produces a 56-character address + ".onion" suffix.

use crate::error::{Error, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use sha3::Sha3_256;
use std::fmt;
use zeroize::Zeroizing;

/// Tor v3 onion service version byte.
const ONION_VERSION: u8 = 0x03;

/// Checksum prefix from the v3 address format.
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

const BASE32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// A Tor v3 onion address.
///
/// Format: `<56 base32 chars>.onion`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse and validate an onion address string.
    ///
    /// Checks suffix, length and base32 alphabet.
    pub fn from_string(s: impl Into<String>) -> Result<Self> {
        let s = s.into().to_lowercase();

        let Some(addr_part) = s.strip_suffix(".onion") else {
            return Err(Error::Identity("must end with .onion".into()));
        };

        if addr_part.len() != 56 {
            return Err(Error::Identity("v3 address must be 56 characters".into()));
        }

        if base32::decode(BASE32, &addr_part.to_uppercase()).is_none() {
            return Err(Error::Identity("invalid base32 encoding".into()));
        }

        Ok(Self(s))
    }

    /// Parse the `ServiceID` Tor returns from `ADD_ONION`.
    pub fn from_service_id(service_id: &str) -> Result<Self> {
        Self::from_string(format!("{}.onion", service_id))
    }

    /// Get the full address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get just the hostname (without .onion suffix).
    pub fn hostname(&self) -> &str {
        &self.0[..56]
    }

    /// Derive an onion address from an Ed25519 public key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let pubkey_bytes = public_key.as_bytes();
        let checksum = checksum(pubkey_bytes);

        // pubkey (32) || checksum (2) || version (1)
        let mut addr_bytes = [0u8; 35];
        addr_bytes[..32].copy_from_slice(pubkey_bytes);
        addr_bytes[32..34].copy_from_slice(&checksum);
        addr_bytes[34] = ONION_VERSION;

        let encoded = base32::encode(BASE32, &addr_bytes);

        Self(format!("{}.onion", encoded.to_lowercase()))
    }
}

fn checksum(pubkey: &[u8; 32]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let hash = hasher.finalize();
    [hash[0], hash[1]]
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self.0)
    }
}

/// Keypair and address of an ephemeral onion service.
///
/// The signing key zeroizes itself on drop.
pub struct OnionIdentity {
    signing_key: SigningKey,
    onion_address: OnionAddress,
}

impl OnionIdentity {
    /// Create identity from an Ed25519 signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let onion_address = OnionAddress::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            onion_address,
        }
    }

    /// Get this identity's onion address.
    pub fn onion_address(&self) -> &OnionAddress {
        &self.onion_address
    }

    /// Expanded 64-byte secret key in the form `ADD_ONION ED25519-V3:` takes.
    ///
    /// - First 32 bytes: clamped scalar
    /// - Last 32 bytes: prefix for signing
    pub fn expanded_secret_key(&self) -> Zeroizing<[u8; 64]> {
        let seed = Zeroizing::new(self.signing_key.to_bytes());
        let hash = Sha512::digest(seed.as_slice());

        let mut expanded = Zeroizing::new([0u8; 64]);
        expanded.copy_from_slice(&hash);

        expanded[0] &= 248;
        expanded[31] &= 127;
        expanded[31] |= 64;

        expanded
    }
}

impl fmt::Debug for OnionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionIdentity")
            .field("onion_address", &self.onion_address)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}
