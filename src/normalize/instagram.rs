//! Instagram messaging webhook payloads (`object: "instagram"`).
//!
//! The envelope matches Messenger's. Media may arrive either as
//! `attachments[]` or directly as `message.image` / `message.video`.

use super::messenger::{normalize_event, WebhookPayload};
use super::InboundEvent;
use crate::types::ProviderFamily;

pub const OBJECT: &str = "instagram";

pub fn parse(body: &[u8]) -> serde_json::Result<WebhookPayload> {
    serde_json::from_slice(body)
}

pub fn normalize(payload: &WebhookPayload) -> Vec<InboundEvent> {
    payload
        .entry
        .iter()
        .flat_map(|entry| entry.messaging.iter())
        .filter_map(|raw| normalize_event(ProviderFamily::Instagram, raw))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{MediaRef, NormalizedMessage};
    use crate::types::MessageType;
    use serde_json::{json, Value};

    fn single(messaging: Value) -> NormalizedMessage {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "object": OBJECT,
            "entry": [{ "id": "ig-business", "messaging": [messaging] }]
        }))
        .unwrap();
        match normalize(&payload).pop() {
            Some(InboundEvent::Message(message)) => message,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn both_media_shapes_resolve_to_the_same_type() {
        let attachment = single(json!({
            "sender": { "id": "igsid-1" },
            "message": {
                "mid": "ig-1",
                "attachments": [{ "type": "image", "payload": { "url": "https://cdn.example/i.jpg" } }]
            }
        }));
        let direct = single(json!({
            "sender": { "id": "igsid-1" },
            "message": { "mid": "ig-2", "image": { "url": "https://cdn.example/i.jpg" } }
        }));

        assert_eq!(attachment.message_type, MessageType::Image);
        assert_eq!(direct.message_type, MessageType::Image);
        assert_eq!(attachment.media, direct.media);
        assert_eq!(attachment.provider, ProviderFamily::Instagram);
    }

    #[test]
    fn direct_video_keeps_text_as_body() {
        let message = single(json!({
            "sender": { "id": "igsid-1" },
            "message": { "text": "mira esto", "video": { "url": "https://cdn.example/v.mp4" } }
        }));

        assert_eq!(message.message_type, MessageType::Video);
        assert_eq!(message.body.as_deref(), Some("mira esto"));
        assert_eq!(
            message.media,
            Some(MediaRef::Url { url: "https://cdn.example/v.mp4".into() })
        );
        assert_eq!(message.metadata["instagram_sender_id"], "igsid-1");
    }

    #[test]
    fn echo_is_flagged() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "object": OBJECT,
            "entry": [{ "messaging": [{
                "sender": { "id": "ig-business" },
                "message": { "mid": "ig-3", "text": "hi", "is_echo": true }
            }] }]
        }))
        .unwrap();

        assert!(matches!(
            normalize(&payload).as_slice(),
            [InboundEvent::Echo { .. }]
        ));
    }
}
