//! Session establishment and per-message sealing.
//!
//! A session key comes from X25519 between the two identities' static DH
//! keys, taken only from a bundle whose signature checks out against the
//! owner's Ed25519 key. Each message is additionally sealed to a fresh
//! ephemeral key, signed by the sender, and carries a key-confirmation tag
//! so a receiver that derived a different session key rejects it.

use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;

use courier_shared::crypto;
use courier_shared::identity::verify_signature;
use courier_shared::{
    ChatPayload, CryptoError, Envelope, Identity, MessageId, MessageType, PublicKeyBundle, UserId,
};
use courier_store::SessionKeys;

/// Derive the session with `peer` from its signed bundle.
pub fn establish_session(
    identity: &Identity,
    peer: &PublicKeyBundle,
    now: DateTime<Utc>,
) -> Result<SessionKeys, CryptoError> {
    peer.verify()?;

    let me = identity.user_id();
    let shared = crypto::derive_shared_secret(identity.dh_secret(), &peer.dh_public)?;
    let session_key = crypto::derive_session_key(&shared, &me, &peer.user_id);
    let confirmation = crypto::key_confirmation(&session_key, &me, &peer.user_id);

    Ok(SessionKeys {
        session_key,
        bundle: peer.clone(),
        confirmation,
        established_at: now,
    })
}

/// Outgoing message fields that end up inside the signature.
pub struct Outgoing<'a> {
    pub id: &'a MessageId,
    pub to: &'a UserId,
    pub timestamp: &'a DateTime<Utc>,
    pub content: &'a str,
    pub message_type: MessageType,
    pub reply_to: Option<MessageId>,
}

/// Encrypt and sign `msg` for the peer described by `keys`.
pub fn seal_message(
    identity: &Identity,
    keys: &SessionKeys,
    msg: Outgoing<'_>,
) -> Result<ChatPayload, CryptoError> {
    let sealed = crypto::seal(&keys.session_key, &keys.bundle.dh_public, msg.content.as_bytes())?;
    let from = identity.user_id();
    let mut payload = ChatPayload {
        ciphertext: sealed.ciphertext,
        nonce: sealed.nonce.to_vec(),
        ephemeral_key: sealed.ephemeral_public.to_vec(),
        sender_bundle: identity.key_bundle(),
        key_confirmation: keys.confirmation.clone(),
        signature: Vec::new(),
        message_type: msg.message_type,
        reply_to: msg.reply_to,
    };
    let signature = identity.sign(&payload.signing_bytes(msg.id, &from, msg.to, msg.timestamp));
    payload.signature = signature.to_bytes().to_vec();
    Ok(payload)
}

/// Verify and decrypt an inbound message.
///
/// `cached` is reused when the sender presents the same bundle; otherwise a
/// session is derived from the bundle in the payload. Returns the session
/// that opened the message together with the plaintext.
pub fn open_message(
    identity: &Identity,
    envelope: &Envelope,
    payload: &ChatPayload,
    cached: Option<&SessionKeys>,
    now: DateTime<Utc>,
) -> Result<(SessionKeys, String), CryptoError> {
    if payload.sender_bundle.user_id != envelope.from {
        return Err(CryptoError::InvalidSignature);
    }

    let sealed = payload.sealed()?;
    let signature =
        Signature::from_slice(&payload.signature).map_err(|_| CryptoError::InvalidSignature)?;
    let signed =
        payload.signing_bytes(&envelope.id, &envelope.from, &envelope.to, &envelope.timestamp);
    verify_signature(&envelope.from.0, &signed, &signature)
        .map_err(|_| CryptoError::InvalidSignature)?;

    let keys = match cached {
        Some(keys) if keys.bundle == payload.sender_bundle => keys.clone(),
        _ => establish_session(identity, &payload.sender_bundle, now)?,
    };
    if keys.confirmation != payload.key_confirmation {
        return Err(CryptoError::KeyConfirmationMismatch);
    }

    let plaintext = crypto::open(&keys.session_key, identity.dh_secret(), &sealed)?;
    let text = String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)?;
    Ok((keys, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::protocol::wire_now;
    use courier_shared::EnvelopeKind;

    fn sealed_envelope(from: &Identity, to: &Identity, text: &str) -> (Envelope, ChatPayload) {
        let keys = establish_session(from, &to.key_bundle(), Utc::now()).unwrap();
        let id = MessageId::generate();
        let ts = wire_now();
        let payload = seal_message(
            from,
            &keys,
            Outgoing {
                id: &id,
                to: &to.user_id(),
                timestamp: &ts,
                content: text,
                message_type: MessageType::Text,
                reply_to: None,
            },
        )
        .unwrap();
        let env = Envelope::with_id(
            id,
            EnvelopeKind::Message,
            from.user_id(),
            to.user_id(),
            ts,
            &payload,
        )
        .unwrap();
        (env, payload)
    }

    #[test]
    fn test_both_sides_derive_the_same_session() {
        let (alice, bob) = (Identity::generate(), Identity::generate());
        let ab = establish_session(&alice, &bob.key_bundle(), Utc::now()).unwrap();
        let ba = establish_session(&bob, &alice.key_bundle(), Utc::now()).unwrap();

        assert_eq!(ab.session_key, ba.session_key);
        assert_eq!(ab.confirmation, ba.confirmation);
    }

    #[test]
    fn test_forged_bundle_is_refused() {
        let (alice, bob, mallory) = (
            Identity::generate(),
            Identity::generate(),
            Identity::generate(),
        );
        let mut bundle = bob.key_bundle();
        bundle.dh_public = mallory.dh_public_bytes();

        assert_eq!(
            establish_session(&alice, &bundle, Utc::now()).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }

    #[test]
    fn test_open_roundtrip() {
        let (alice, bob) = (Identity::generate(), Identity::generate());
        let (env, payload) = sealed_envelope(&alice, &bob, "hello bob");

        let (keys, text) = open_message(&bob, &env, &payload, None, Utc::now()).unwrap();
        assert_eq!(text, "hello bob");
        assert_eq!(keys.bundle.user_id, alice.user_id());
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let (alice, bob, carol) = (
            Identity::generate(),
            Identity::generate(),
            Identity::generate(),
        );
        let (mut env, payload) = sealed_envelope(&alice, &bob, "for bob only");
        env.to = carol.user_id();

        // Re-addressing breaks the signature before decryption is attempted.
        assert_eq!(
            open_message(&carol, &env, &payload, None, Utc::now()).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }

    #[test]
    fn test_tampering_is_detected() {
        let (alice, bob) = (Identity::generate(), Identity::generate());

        let (env, mut payload) = sealed_envelope(&alice, &bob, "original");
        payload.ciphertext[0] ^= 0xff;
        assert_eq!(
            open_message(&bob, &env, &payload, None, Utc::now()).unwrap_err(),
            CryptoError::InvalidSignature
        );

        let (mut env, payload) = sealed_envelope(&alice, &bob, "original");
        env.timestamp += chrono::Duration::milliseconds(1);
        assert!(open_message(&bob, &env, &payload, None, Utc::now()).is_err());
    }

    #[test]
    fn test_reply_and_type_are_signed() {
        let (alice, bob) = (Identity::generate(), Identity::generate());

        let (env, mut payload) = sealed_envelope(&alice, &bob, "original");
        payload.reply_to = Some(MessageId::generate());
        assert_eq!(
            open_message(&bob, &env, &payload, None, Utc::now()).unwrap_err(),
            CryptoError::InvalidSignature
        );

        let (env, mut payload) = sealed_envelope(&alice, &bob, "original");
        payload.message_type = MessageType::System;
        assert_eq!(
            open_message(&bob, &env, &payload, None, Utc::now()).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }

    #[test]
    fn test_stale_confirmation_is_rejected() {
        let (alice, bob) = (Identity::generate(), Identity::generate());
        let (env, payload) = sealed_envelope(&alice, &bob, "hi");

        let mut stale = establish_session(&bob, &alice.key_bundle(), Utc::now()).unwrap();
        stale.confirmation = "0".repeat(32);
        stale.session_key = [9; 32];
        // The cached session matches the bundle but disagrees with the tag.
        assert_eq!(
            open_message(&bob, &env, &payload, Some(&stale), Utc::now()).unwrap_err(),
            CryptoError::KeyConfirmationMismatch
        );
    }

    #[test]
    fn test_sender_bundle_must_match_envelope() {
        let (alice, bob, mallory) = (
            Identity::generate(),
            Identity::generate(),
            Identity::generate(),
        );
        let (env, mut payload) = sealed_envelope(&alice, &bob, "hi");
        payload.sender_bundle = mallory.key_bundle();

        assert_eq!(
            open_message(&bob, &env, &payload, None, Utc::now()).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }
}
