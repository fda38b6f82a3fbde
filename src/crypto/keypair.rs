//! Ethereum keypair derivation from a known secret scalar.

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tiny_keccak::{Hasher, Keccak};

use super::{Address, DerivationError};

/// Represents an Ethereum keypair (private key, uncompressed public key, address).
#[derive(Clone)]
pub struct Keypair {
    /// The private key bytes (32 bytes)
    secret_key: [u8; 32],
    /// The uncompressed public key (65 bytes, 0x04 prefix)
    public_key: [u8; 65],
    /// The derived Ethereum address
    address: Address,
}

impl Keypair {
    /// Builds a keypair from an existing secret key.
    ///
    /// Fails if the bytes are zero or not below the curve order.
    pub fn from_secret_key(secret_bytes: [u8; 32]) -> Result<Self, DerivationError> {
        let secp = Secp256k1::signing_only();
        let secret_key = SecretKey::from_slice(&secret_bytes).map_err(|e| {
            DerivationError::InvalidKeyMaterial(format!("secret key rejected by curve: {}", e))
        })?;
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);

        Ok(Self {
            secret_key: secret_bytes,
            public_key: public_key.serialize_uncompressed(),
            address: Self::derive_address(&public_key),
        })
    }

    /// Derives an Ethereum address from a secp256k1 public key.
    ///
    /// Process:
    /// 1. Serialize the public key in uncompressed form (65 bytes)
    /// 2. Remove the first byte (0x04 prefix)
    /// 3. Hash the remaining 64 bytes with Keccak-256
    /// 4. Take the last 20 bytes of the hash
    #[inline]
    fn derive_address(public_key: &PublicKey) -> Address {
        let public_key_bytes = public_key.serialize_uncompressed();

        let mut hasher = Keccak::v256();
        hasher.update(&public_key_bytes[1..]);

        let mut hash = [0u8; 32];
        hasher.finalize(&mut hash);

        let mut address_bytes = [0u8; 20];
        address_bytes.copy_from_slice(&hash[12..]);

        Address::from_bytes(address_bytes)
    }

    /// Returns the private key as a hex string (without 0x prefix).
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key)
    }

    /// Returns the uncompressed public key as hex, including the `04` prefix.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// Returns the 64-byte point encoding as hex (prefix stripped).
    ///
    /// This is the form the search engine takes for its `-z` argument.
    pub fn public_point_hex(&self) -> String {
        hex::encode(&self.public_key[1..])
    }

    /// Returns a reference to the derived address.
    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("secret_key", &"<redacted>")
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one() -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        bytes
    }

    #[test]
    fn test_deterministic_address() {
        let keypair = Keypair::from_secret_key(one()).unwrap();

        // Address for private key = 1 is well-known
        assert_eq!(
            keypair.address().to_hex(),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_public_key_is_generator_for_one() {
        let keypair = Keypair::from_secret_key(one()).unwrap();
        assert_eq!(
            keypair.public_key_hex(),
            "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\
             483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8"
        );
        assert_eq!(keypair.public_point_hex().len(), 128);
        assert!(!keypair.public_point_hex().starts_with("04"));
    }

    #[test]
    fn test_zero_secret_is_rejected() {
        assert!(Keypair::from_secret_key([0u8; 32]).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let keypair = Keypair::from_secret_key(one()).unwrap();
        let rendered = format!("{:?}", keypair);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&keypair.private_key_hex()));
    }
}
