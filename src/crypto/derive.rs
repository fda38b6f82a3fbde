//! Final key derivation from a seed secret and a search-engine offset.
//!
//! The search engine only ever sees the seed *public* key. It reports an
//! offset scalar and the address it believes the offset produces. The final
//! private key is `(seed + offset) mod n`; everything else is recomputed
//! here from that scalar, and the engine's address is only compared against.

use std::fmt;

use num_bigint::BigUint;
use secp256k1::constants::CURVE_ORDER;
use tracing::warn;

use super::{strip_hex_prefix, Address, DerivationError, Keypair};

/// Width of a secp256k1 scalar in hex digits.
pub const SCALAR_HEX_LEN: usize = 64;

fn curve_order() -> BigUint {
    BigUint::from_bytes_be(&CURVE_ORDER)
}

/// Parses a full-width hex scalar (optional `0x`, any case).
fn parse_scalar(label: &str, input: &str) -> Result<BigUint, DerivationError> {
    let digits = strip_hex_prefix(input.trim());

    if digits.len() != SCALAR_HEX_LEN {
        return Err(DerivationError::InvalidKeyMaterial(format!(
            "{} must be {} hex digits, got {}",
            label,
            SCALAR_HEX_LEN,
            digits.len()
        )));
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DerivationError::InvalidKeyMaterial(format!(
            "{} contains non-hex characters",
            label
        )));
    }

    BigUint::parse_bytes(digits.as_bytes(), 16).ok_or_else(|| {
        DerivationError::InvalidKeyMaterial(format!("{} could not be parsed", label))
    })
}

fn to_scalar_bytes(value: &BigUint) -> [u8; 32] {
    let be = value.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - be.len()..].copy_from_slice(&be);
    out
}

/// Computes `(seed + offset) mod n` and renders it as 64 zero-padded hex digits.
pub fn add_scalars(seed_hex: &str, offset_hex: &str) -> Result<String, DerivationError> {
    let seed = parse_scalar("seed", seed_hex)?;
    let offset = parse_scalar("offset", offset_hex)?;
    let sum = (seed + offset) % curve_order();
    Ok(format!("{:0>width$}", sum.to_str_radix(16), width = SCALAR_HEX_LEN))
}

/// The authoritative key triple produced for a completed search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    /// Final private key, 64 lowercase hex digits, no prefix.
    pub private_key: String,
    /// Uncompressed public key, 130 lowercase hex digits with `04` prefix.
    pub public_key: String,
    /// Address recomputed from the final private key.
    pub address: Address,
    /// Address the search engine claimed.
    pub reported_address: Address,
    /// Whether `address == reported_address`.
    pub address_verified: bool,
}

/// Derives the final keys for an engine-reported offset and verifies the
/// engine's address against the recomputed one.
///
/// A mismatch is logged and flagged through `address_verified`; the derived
/// address is still returned as the result.
pub fn derive_final_keys(
    seed_hex: &str,
    offset_hex: &str,
    reported_address: &str,
) -> Result<DerivedKeys, DerivationError> {
    let reported_address = Address::from_hex(reported_address)?;
    let private_key = add_scalars(seed_hex, offset_hex)?;

    let scalar = parse_scalar("final key", &private_key)?;
    let keypair = Keypair::from_secret_key(to_scalar_bytes(&scalar))?;
    let address = *keypair.address();
    let address_verified = address == reported_address;

    if !address_verified {
        warn!(
            derived = %address.to_hex_prefixed(),
            reported = %reported_address.to_hex_prefixed(),
            "address mismatch: search engine reported a different address than the derived key"
        );
    }

    Ok(DerivedKeys {
        private_key,
        public_key: keypair.public_key_hex(),
        address,
        reported_address,
        address_verified,
    })
}

/// The process-wide seed secret a worker adds engine offsets to.
#[derive(Clone)]
pub struct SeedKey {
    secret_hex: String,
    keypair: Keypair,
}

impl SeedKey {
    /// Parses and validates a seed private key.
    pub fn from_hex(input: &str) -> Result<Self, DerivationError> {
        let scalar = parse_scalar("seed", input)?;
        let keypair = Keypair::from_secret_key(to_scalar_bytes(&scalar))?;
        Ok(Self {
            secret_hex: keypair.private_key_hex(),
            keypair,
        })
    }

    /// Uncompressed seed public key with `04` prefix.
    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    /// The 128-digit point encoding handed to the search engine.
    pub fn engine_public_key(&self) -> String {
        self.keypair.public_point_hex()
    }

    /// Runs the derivation pipeline for an engine result.
    pub fn derive(&self, offset_hex: &str, reported_address: &str) -> Result<DerivedKeys, DerivationError> {
        derive_final_keys(&self.secret_hex, offset_hex, reported_address)
    }
}

impl fmt::Debug for SeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedKey")
            .field("address", self.keypair.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_HEX: &str = "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141";

    fn scalar(n: u64) -> String {
        format!("{:064x}", n)
    }

    #[test]
    fn test_add_without_wraparound() {
        let sum = add_scalars(&scalar(1), &scalar(2)).unwrap();
        assert_eq!(sum, scalar(3));
        assert_eq!(sum.len(), SCALAR_HEX_LEN);
    }

    #[test]
    fn test_add_wraps_at_curve_order() {
        // (n - 1) + 2 = n + 1 = 1 mod n
        let n_minus_one = "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364140";
        assert_eq!(add_scalars(n_minus_one, &scalar(2)).unwrap(), scalar(1));
    }

    #[test]
    fn test_add_does_not_truncate_large_inputs() {
        let max = "f".repeat(64);
        let sum = add_scalars(&max, &max).unwrap();
        let expected = (BigUint::parse_bytes(max.as_bytes(), 16).unwrap() * 2u32) % curve_order();
        assert_eq!(BigUint::parse_bytes(sum.as_bytes(), 16).unwrap(), expected);
        assert!(BigUint::parse_bytes(sum.as_bytes(), 16).unwrap() < curve_order());
        assert_eq!(sum.len(), SCALAR_HEX_LEN);
    }

    #[test]
    fn test_add_accepts_prefix_and_upper_case() {
        let sum = add_scalars(&format!("0x{}", scalar(10)), &scalar(5).to_uppercase()).unwrap();
        assert_eq!(sum, scalar(15));
    }

    #[test]
    fn test_curve_order_constant() {
        assert_eq!(curve_order().to_str_radix(16), ORDER_HEX);
    }

    #[test]
    fn test_malformed_scalars_are_invalid_key_material() {
        let not_hex = "g".repeat(64);
        let too_long = "1".repeat(65);
        let bad_inputs: [&str; 5] = ["", "0x", "1234", &not_hex, &too_long];
        for bad in bad_inputs {
            assert!(matches!(
                add_scalars(bad, &scalar(1)),
                Err(DerivationError::InvalidKeyMaterial(_))
            ));
            assert!(matches!(
                add_scalars(&scalar(1), bad),
                Err(DerivationError::InvalidKeyMaterial(_))
            ));
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let reported = "7e5f4552091a69125d5dfcb7b8c2659029395bdf";
        let a = derive_final_keys(&scalar(0x1234), &scalar(0x42), reported).unwrap();
        let b = derive_final_keys(&scalar(0x1234), &scalar(0x42), reported).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_verified_derivation() {
        // seed 0 is not a usable key on its own, but seed + offset = 1 is.
        let keys = derive_final_keys(
            &scalar(0),
            &scalar(1),
            "0x7E5F4552091A69125D5DFCB7B8C2659029395BDF",
        )
        .unwrap();
        assert_eq!(keys.private_key, scalar(1));
        assert_eq!(keys.address.to_hex(), "7e5f4552091a69125d5dfcb7b8c2659029395bdf");
        assert!(keys.public_key.starts_with("04"));
        assert_eq!(keys.public_key.len(), 130);
        assert!(keys.address_verified);
    }

    #[test]
    fn test_mismatch_keeps_derived_address() {
        let reported = "dead000000000000000000000000000000000000";
        let keys = derive_final_keys(&scalar(0), &scalar(1), reported).unwrap();
        assert!(!keys.address_verified);
        assert_eq!(keys.address.to_hex(), "7e5f4552091a69125d5dfcb7b8c2659029395bdf");
        assert_eq!(keys.reported_address.to_hex(), reported);
    }

    #[test]
    fn test_zero_final_key_is_rejected() {
        let n_minus_one = "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364140";
        let err = derive_final_keys(
            n_minus_one,
            &scalar(1),
            "0000000000000000000000000000000000000000",
        )
        .unwrap_err();
        assert!(matches!(err, DerivationError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn test_malformed_reported_address() {
        assert!(derive_final_keys(&scalar(1), &scalar(1), "0xabc").is_err());
    }

    #[test]
    fn test_seed_key_matches_free_function() {
        let seed = SeedKey::from_hex(&scalar(7)).unwrap();
        let reported = "0000000000000000000000000000000000000000";
        assert_eq!(
            seed.derive(&scalar(9), reported).unwrap(),
            derive_final_keys(&scalar(7), &scalar(9), reported).unwrap()
        );
        assert_eq!(seed.engine_public_key().len(), 128);
        assert_eq!(&seed.public_key_hex()[2..], seed.engine_public_key());
        assert!(!format!("{:?}", seed).contains(&scalar(7)));
    }

    #[test]
    fn test_seed_key_rejects_zero() {
        assert!(SeedKey::from_hex(&scalar(0)).is_err());
    }
}
