/// Wire protocol version advertised in relay registration.
pub const PROTOCOL_VERSION: &str = "courier/1";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Bytes of entropy behind every message and envelope id (128 bits).
pub const MESSAGE_ID_BYTES: usize = 16;

/// Maximum plaintext message size in bytes (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Largest relay frame either side accepts. Leaves room for the base64
/// ciphertext of a maximum-size message plus its envelope.
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE * 2;

/// Prefix of deterministic direct-chat identifiers.
pub const DIRECT_CHAT_PREFIX: &str = "direct";

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8787/ws";

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 8787;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_DH_KEY: &str = "courier-x25519-static-key-v1";
pub const KDF_CONTEXT_SHARED_SECRET: &str = "courier-shared-secret-v1";
pub const KDF_CONTEXT_SESSION_KEY: &str = "courier-session-key-v1";
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "courier-message-key-v1";
pub const KDF_CONTEXT_KEY_CONFIRM: &str = "courier-key-confirmation-v1";
pub const KDF_CONTEXT_DB_KEY: &str = "courier-db-key-v1";

/// Domain separation prefixes for detached signatures.
pub const SIGN_CONTEXT_BUNDLE: &[u8] = b"courier-bundle-v1";
pub const SIGN_CONTEXT_MESSAGE: &[u8] = b"courier-message-v1";
