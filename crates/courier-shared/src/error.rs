use thiserror::Error;

/// Failures of the encryption layer.
///
/// At send time every variant is an EncryptionError (the attempt is fatal
/// and the message is marked failed). At receive time `DecryptionFailed`,
/// `InvalidSignature` and `KeyConfirmationMismatch` mean the message is
/// dropped and never displayed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid public key")]
    InvalidKey,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key exchange produced a non-contributory shared secret")]
    NonContributory,

    #[error("Session key confirmation mismatch")]
    KeyConfirmationMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Key bundle does not belong to {0}")]
    BundleMismatch(String),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}
