use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_DB_KEY, KDF_CONTEXT_DH_KEY, SIGN_CONTEXT_BUNDLE};
use crate::error::{CryptoError, IdentityError};
use crate::types::UserId;

/// A user's cryptographic identity.
///
/// The Ed25519 public key is the user id. The X25519 key used for key
/// agreement is derived from the same secret seed, so a single 32-byte
/// secret restores the whole identity.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    dh_secret: StaticSecret,
}

/// Serializable format for storing/exporting identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

/// Public half of an identity, handed to peers so they can establish a
/// session key. The signature over the X25519 key proves the bundle was
/// issued by the owner of `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyBundle {
    pub user_id: UserId,
    #[serde(with = "hex_32")]
    pub dh_public: [u8; 32],
    #[serde(with = "hex_64")]
    pub signature: [u8; 64],
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_secret_bytes(signing_key.as_bytes())
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let dh_secret = StaticSecret::from(blake3::derive_key(KDF_CONTEXT_DH_KEY, secret));
        Self {
            signing_key,
            dh_secret,
        }
    }

    /// Restore identity from a serialized export
    pub fn from_export(export: &IdentityExport) -> Result<Self, IdentityError> {
        let identity = Self::from_secret_bytes(&export.secret_key);
        if identity.public_key_bytes() != export.public_key {
            return Err(IdentityError::InvalidKeyBytes);
        }
        Ok(identity)
    }

    /// Get the user ID (public key)
    pub fn user_id(&self) -> UserId {
        UserId(self.public_key_bytes())
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// X25519 secret used for session and per-message key agreement.
    pub fn dh_secret(&self) -> &StaticSecret {
        &self.dh_secret
    }

    pub fn dh_public_bytes(&self) -> [u8; 32] {
        PublicKey::from(&self.dh_secret).to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signed public key bundle for this identity.
    pub fn key_bundle(&self) -> PublicKeyBundle {
        let dh_public = self.dh_public_bytes();
        let signature = self.sign(&bundle_signing_bytes(&self.user_id(), &dh_public));
        PublicKeyBundle {
            user_id: self.user_id(),
            dh_public,
            signature: signature.to_bytes(),
        }
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.public_key_bytes(),
        }
    }

    /// Derive a database encryption key from the identity using BLAKE3
    pub fn derive_db_key(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_DB_KEY);
        hasher.update(self.signing_key.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id().short())
            .finish_non_exhaustive()
    }
}

impl PublicKeyBundle {
    /// Check the bundle signature against the Ed25519 key named by `user_id`.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let signature = Signature::from_bytes(&self.signature);
        verify_signature(
            &self.user_id.0,
            &bundle_signing_bytes(&self.user_id, &self.dh_public),
            &signature,
        )
        .map_err(|_| CryptoError::InvalidSignature)
    }
}

fn bundle_signing_bytes(user_id: &UserId, dh_public: &[u8; 32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SIGN_CONTEXT_BUNDLE.len() + 64);
    bytes.extend_from_slice(SIGN_CONTEXT_BUNDLE);
    bytes.extend_from_slice(&user_id.0);
    bytes.extend_from_slice(dh_public);
    bytes
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidKeyBytes)
}

mod hex_32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod hex_64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id = Identity::generate();
        assert_eq!(id.user_id().0, id.public_key_bytes());
        assert_ne!(id.dh_public_bytes(), id.public_key_bytes());
    }

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let export = id.to_export();
        let restored = Identity::from_export(&export).unwrap();
        assert_eq!(id.user_id(), restored.user_id());
        assert_eq!(id.dh_public_bytes(), restored.dh_public_bytes());
    }

    #[test]
    fn test_export_with_mismatched_public_key_rejected() {
        let mut export = Identity::generate().to_export();
        export.public_key = [9u8; 32];
        assert!(Identity::from_export(&export).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"Hello, Courier!";
        let signature = id.sign(message);

        assert!(verify_signature(&id.public_key_bytes(), message, &signature).is_ok());

        // Wrong message should fail
        assert!(verify_signature(&id.public_key_bytes(), b"wrong", &signature).is_err());
    }

    #[test]
    fn test_bundle_verifies() {
        let id = Identity::generate();
        let bundle = id.key_bundle();
        assert!(bundle.verify().is_ok());

        let json = serde_json::to_string(&bundle).unwrap();
        let back: PublicKeyBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bundle);
        assert!(back.verify().is_ok());
    }

    #[test]
    fn test_bundle_with_foreign_dh_key_rejected() {
        let id = Identity::generate();
        let other = Identity::generate();

        let mut bundle = id.key_bundle();
        bundle.dh_public = other.dh_public_bytes();
        assert_eq!(bundle.verify(), Err(CryptoError::InvalidSignature));

        let mut claimed = other.key_bundle();
        claimed.user_id = id.user_id();
        assert_eq!(claimed.verify(), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn test_db_key_derivation_deterministic() {
        let id = Identity::generate();
        assert_eq!(id.derive_db_key(), id.derive_db_key());
    }
}
