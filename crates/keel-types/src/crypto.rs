//! Ed25519 identities: keypairs, public keys, signatures and validator addresses.

use crate::error::{Result, TypesError};
use ed25519_consensus::{SigningKey, VerificationKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;

/// A validator address: the first 20 bytes of the SHA-256 of its public key.
///
/// Addresses are totally ordered; proposer selection breaks ties by ascending address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    /// The length of an address in bytes.
    pub const LEN: usize = 20;

    /// Creates an address from raw bytes.
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns a short identifier (first 6 bytes as hex) for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

hex_serde!(Address, 20);

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// The length of a public key in bytes.
    pub const LEN: usize = 32;

    /// Creates a public key from raw bytes, checking that it is a valid curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            TypesError::InvalidPublicKey(format!("expected {} bytes, got {}", Self::LEN, bytes.len()))
        })?;
        VerificationKey::try_from(arr).map_err(|e| TypesError::InvalidPublicKey(e.to_string()))?;
        Ok(Self(arr))
    }

    /// Parses a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| TypesError::InvalidPublicKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derives the validator address for this key.
    pub fn address(&self) -> Address {
        let digest = Sha256::digest(self.0);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[..20]);
        Address(out)
    }

    /// Verifies a signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerificationKey::try_from(self.0)
            .map_err(|e| TypesError::InvalidPublicKey(e.to_string()))?;
        key.verify(&ed25519_consensus::Signature::from(signature.0), message)
            .map_err(|_| TypesError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

hex_serde!(PublicKey, 32);

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 64]);

impl Signature {
    /// The length of a signature in bytes.
    pub const LEN: usize = 64;

    /// Creates a signature from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8]))
    }
}

hex_serde!(Signature, 64);

/// An Ed25519 keypair used by a validator to sign proposals and votes.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::new(OsRng),
        }
    }

    /// Creates a keypair from 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| TypesError::InvalidSecretKey)?;
        Ok(Self {
            signing_key: SigningKey::from(secret),
        })
    }

    /// Derives a deterministic keypair from a seed. Intended for devnets and tests only.
    pub fn from_seed(seed: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"keel-devnet-key");
        hasher.update(seed.to_be_bytes());
        let secret: [u8; 32] = hasher.finalize().into();
        Self {
            signing_key: SigningKey::from(secret),
        }
    }

    /// Returns the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verification_key().to_bytes())
    }

    /// Returns the address of the public key.
    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    /// Signs a message. Ed25519 signatures are deterministic.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Returns the secret key bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from(self.signing_key.to_bytes()),
        }
    }
}
