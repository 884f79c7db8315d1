use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_KEY_CONFIRM, KDF_CONTEXT_MESSAGE_KEY, KDF_CONTEXT_SESSION_KEY,
    KDF_CONTEXT_SHARED_SECRET, NONCE_SIZE, SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;
use crate::types::UserId;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Output of [`encrypt`]: the nonce travels beside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encrypted {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// A one-shot X25519 key pair. A fresh pair is generated for every
/// outgoing message.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// A message encrypted under a one-time key mixed from the session key and
/// an ephemeral Diffie-Hellman exchange with the recipient's static key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub ephemeral_public: [u8; 32],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_ephemeral_key_pair() -> EphemeralKeyPair {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    EphemeralKeyPair { secret, public }
}

/// `length` random bytes from the OS CSPRNG, hex encoded.
pub fn generate_secure_id(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// X25519 followed by a BLAKE3 KDF so the raw curve point never becomes a key
pub fn derive_shared_secret(
    my_private: &StaticSecret,
    their_public: &[u8; 32],
) -> Result<SymmetricKey, CryptoError> {
    let shared = my_private.diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(blake3::derive_key(KDF_CONTEXT_SHARED_SECRET, shared.as_bytes()))
}

/// Bind a shared secret to the unordered participant pair.
pub fn derive_session_key(shared_secret: &SymmetricKey, a: &UserId, b: &UserId) -> SymmetricKey {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SESSION_KEY);
    hasher.update(shared_secret);
    hasher.update(&lo.0);
    hasher.update(&hi.0);
    *hasher.finalize().as_bytes()
}

/// Tag both ends compute independently from their own session key.
/// Equal tags confirm the two sides derived the same key.
pub fn key_confirmation(session_key: &SymmetricKey, a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let confirm_key = blake3::derive_key(KDF_CONTEXT_KEY_CONFIRM, session_key);
    let mut hasher = blake3::Hasher::new_keyed(&confirm_key);
    hasher.update(&lo.0);
    hasher.update(&hi.0);
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Encrypted, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Encrypted { ciphertext, nonce })
}

pub fn decrypt(
    key: &SymmetricKey,
    ciphertext: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn message_key(
    session_key: &SymmetricKey,
    ephemeral_shared: &SymmetricKey,
    ephemeral_public: &[u8; 32],
) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
    hasher.update(session_key);
    hasher.update(ephemeral_shared);
    hasher.update(ephemeral_public);
    *hasher.finalize().as_bytes()
}

pub fn seal(
    session_key: &SymmetricKey,
    recipient_dh_public: &[u8; 32],
    plaintext: &[u8],
) -> Result<SealedMessage, CryptoError> {
    let ephemeral = generate_ephemeral_key_pair();
    let ephemeral_public = ephemeral.public_bytes();
    let shared = derive_shared_secret(ephemeral.secret(), recipient_dh_public)
        .map_err(|_| CryptoError::InvalidKey)?;

    let key = message_key(session_key, &shared, &ephemeral_public);
    let Encrypted { ciphertext, nonce } = encrypt(&key, plaintext)?;

    Ok(SealedMessage {
        ephemeral_public,
        nonce,
        ciphertext,
    })
}

pub fn open(
    session_key: &SymmetricKey,
    my_dh_secret: &StaticSecret,
    sealed: &SealedMessage,
) -> Result<Vec<u8>, CryptoError> {
    let shared = derive_shared_secret(my_dh_secret, &sealed.ephemeral_public)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let key = message_key(session_key, &shared, &sealed.ephemeral_public);
    decrypt(&key, &sealed.ciphertext, &sealed.nonce)
}
