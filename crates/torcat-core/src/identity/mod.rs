//! Onion service identities.
//!
//! Every listen-mode run publishes a brand new Tor v3 onion service. The
//! Ed25519 keypair is generated locally so the address can be printed before
//! Tor is asked to publish it, and Tor is told to discard the key afterwards.
//! Nothing is persisted.

mod onion;

pub use onion::{OnionAddress, OnionIdentity};

use crate::error::Result;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

/// Generate a new random onion identity.
pub fn generate_identity() -> Result<OnionIdentity> {
    let signing_key = SigningKey::generate(&mut OsRng);
    Ok(OnionIdentity::from_signing_key(signing_key))
}
