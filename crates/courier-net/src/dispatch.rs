//! Inbound envelope dispatch.

use courier_shared::{
    ChatPayload, Envelope, EnvelopeKind, PresencePayload, ProtocolError, ReceiptPayload,
    TypingPayload,
};
use tracing::debug;

/// Receiver side of the envelope types the client understands.
pub trait InboundHandler {
    fn on_message(&mut self, envelope: &Envelope, payload: ChatPayload);
    fn on_typing(&mut self, envelope: &Envelope, payload: TypingPayload);
    fn on_presence(&mut self, envelope: &Envelope, payload: PresencePayload);
    fn on_delivery_receipt(&mut self, envelope: &Envelope, payload: ReceiptPayload);
    fn on_read_receipt(&mut self, envelope: &Envelope, payload: ReceiptPayload);
}

/// Decode `envelope.data` for its type and hand it to `handler`.
///
/// Returns `Ok(false)` for envelope types this client does not know; they
/// are ignored rather than treated as errors. A payload that does not
/// match its declared type is an error and the envelope is not delivered.
pub fn dispatch<H: InboundHandler + ?Sized>(
    envelope: &Envelope,
    handler: &mut H,
) -> Result<bool, ProtocolError> {
    match envelope.kind {
        EnvelopeKind::Message => handler.on_message(envelope, envelope.payload()?),
        EnvelopeKind::Typing => handler.on_typing(envelope, envelope.payload()?),
        EnvelopeKind::Presence => handler.on_presence(envelope, envelope.payload()?),
        EnvelopeKind::DeliveryReceipt => {
            handler.on_delivery_receipt(envelope, envelope.payload()?)
        }
        EnvelopeKind::ReadReceipt => handler.on_read_receipt(envelope, envelope.payload()?),
        EnvelopeKind::Unknown => {
            debug!(id = %envelope.id, "Ignoring envelope of unknown type");
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{ChatId, MessageId, PresenceStatus, UserId};

    #[derive(Default)]
    struct Recorder {
        seen: Vec<&'static str>,
    }

    impl InboundHandler for Recorder {
        fn on_message(&mut self, _: &Envelope, _: ChatPayload) {
            self.seen.push("message");
        }
        fn on_typing(&mut self, _: &Envelope, payload: TypingPayload) {
            assert!(payload.is_typing);
            self.seen.push("typing");
        }
        fn on_presence(&mut self, _: &Envelope, _: PresencePayload) {
            self.seen.push("presence");
        }
        fn on_delivery_receipt(&mut self, _: &Envelope, payload: ReceiptPayload) {
            assert_eq!(payload.message_ids.len(), 1);
            self.seen.push("delivery_receipt");
        }
        fn on_read_receipt(&mut self, _: &Envelope, _: ReceiptPayload) {
            self.seen.push("read_receipt");
        }
    }

    const A: UserId = UserId([1; 32]);
    const B: UserId = UserId([2; 32]);

    #[test]
    fn test_dispatch_routes_by_type() {
        let mut recorder = Recorder::default();

        let typing = Envelope::new(
            EnvelopeKind::Typing,
            A,
            B,
            &TypingPayload {
                chat_id: ChatId::direct(&A, &B),
                is_typing: true,
            },
        )
        .unwrap();
        let presence = Envelope::new(
            EnvelopeKind::Presence,
            A,
            B,
            &PresencePayload {
                status: PresenceStatus::Away,
            },
        )
        .unwrap();
        let receipt = ReceiptPayload {
            message_ids: vec![MessageId::from("m1")],
        };
        let delivered = Envelope::new(EnvelopeKind::DeliveryReceipt, A, B, &receipt).unwrap();
        let read = Envelope::new(EnvelopeKind::ReadReceipt, A, B, &receipt).unwrap();

        for env in [&typing, &presence, &delivered, &read] {
            assert!(dispatch(env, &mut recorder).unwrap());
        }
        assert_eq!(
            recorder.seen,
            vec!["typing", "presence", "delivery_receipt", "read_receipt"]
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let mut recorder = Recorder::default();
        let mut env = Envelope::new(
            EnvelopeKind::Presence,
            A,
            B,
            &PresencePayload {
                status: PresenceStatus::Online,
            },
        )
        .unwrap();
        env.kind = EnvelopeKind::Unknown;

        assert!(!dispatch(&env, &mut recorder).unwrap());
        assert!(recorder.seen.is_empty());
    }

    #[test]
    fn test_mismatched_payload_is_error() {
        let mut recorder = Recorder::default();
        let mut env = Envelope::new(
            EnvelopeKind::Presence,
            A,
            B,
            &PresencePayload {
                status: PresenceStatus::Online,
            },
        )
        .unwrap();
        env.kind = EnvelopeKind::Message;

        assert!(dispatch(&env, &mut recorder).is_err());
        assert!(recorder.seen.is_empty());
    }
}
