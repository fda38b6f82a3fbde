//! Key derivation and verification for matched search results.
//!
//! This module provides:
//! - Arbitrary-precision scalar addition modulo the secp256k1 order
//! - Public key and Ethereum address derivation using Keccak-256
//! - Verification of engine-reported addresses

mod address;
mod derive;
mod keypair;

pub use address::{Address, ADDRESS_HEX_LEN};
pub use derive::{add_scalars, derive_final_keys, DerivedKeys, SeedKey, SCALAR_HEX_LEN};
pub use keypair::Keypair;

/// Errors raised while turning raw scalars into key material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DerivationError {
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

/// Strips a leading `0x` or `0X`.
pub(crate) fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}
