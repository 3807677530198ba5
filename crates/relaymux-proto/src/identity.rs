//! Ed25519 identities for clients and relay servers

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of an encoded public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an encoded signature
pub const SIGNATURE_LEN: usize = 64;

/// Key and signature errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Invalid signature")]
    InvalidSignature,
}

// --- PublicKey ---

/// Public half of a client or relay identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: PUBLIC_KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_LEN]
    }

    /// Verify `signature` over `message` against this key
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), KeyError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| KeyError::InvalidSignature)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| KeyError::InvalidSignature)
    }

    /// First 8 hex chars, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// --- Signature ---

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for Signature {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        let arr: [u8; SIGNATURE_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::InvalidLength {
                    expected: SIGNATURE_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// --- Keypair ---

/// A client's long-term identity
#[derive(Clone)]
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        Self { signing }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&secret),
        }
    }

    /// Parse a 64-character hex seed
    pub fn from_secret_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self::from_secret_bytes(secret))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"delegated servers");

        assert!(kp.public_key().verify(b"delegated servers", &sig).is_ok());
        assert_eq!(
            kp.public_key().verify(b"tampered", &sig),
            Err(KeyError::InvalidSignature)
        );

        let other = Keypair::generate();
        assert!(other.public_key().verify(b"delegated servers", &sig).is_err());
    }

    #[test]
    fn test_public_key_hex() {
        let pk = Keypair::generate().public_key();
        let parsed: PublicKey = pk.to_string().parse().unwrap();
        assert_eq!(parsed, pk);

        assert!(matches!(
            "abcd".parse::<PublicKey>(),
            Err(KeyError::InvalidLength {
                expected: 32,
                actual: 2
            })
        ));
        assert!(matches!(
            "zz".parse::<PublicKey>(),
            Err(KeyError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_public_key_serde() {
        let pk = Keypair::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk));

        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }

    #[test]
    fn test_keypair_from_secret_hex() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_hex(&kp.secret_hex()).unwrap();
        assert_eq!(restored.public_key(), kp.public_key());

        assert!(Keypair::from_secret_hex("00ff").is_err());
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let kp = Keypair::generate();
        let debug = format!("{:?}", kp);
        assert!(!debug.contains(&kp.secret_hex()));
    }

    #[test]
    fn test_null_key() {
        assert!(PublicKey::default().is_null());
        assert!(!Keypair::generate().public_key().is_null());
    }
}
