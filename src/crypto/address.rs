//! Ethereum address representation and utilities.

use std::fmt;
use std::str::FromStr;

use super::DerivationError;

/// Length of an address in hex characters (without 0x prefix).
pub const ADDRESS_HEX_LEN: usize = 40;

/// An Ethereum address (20 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    /// Creates an address from raw bytes.
    #[inline]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses a 40-digit hex address, with or without `0x`, in any case.
    pub fn from_hex(s: &str) -> Result<Self, DerivationError> {
        let digits = super::strip_hex_prefix(s.trim());
        if digits.len() != ADDRESS_HEX_LEN {
            return Err(DerivationError::InvalidKeyMaterial(format!(
                "address must be {} hex digits, got {}",
                ADDRESS_HEX_LEN,
                digits.len()
            )));
        }

        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes).map_err(|e| {
            DerivationError::InvalidKeyMaterial(format!("address is not valid hex: {}", e))
        })?;
        Ok(Self(bytes))
    }

    /// Returns the address as a lowercase hex string (without 0x prefix).
    #[inline]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the address with 0x prefix.
    pub fn to_hex_prefixed(&self) -> String {
        format!("0x{}", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = DerivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex_prefixed())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex_prefixed())
    }
}
