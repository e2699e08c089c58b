//! WhatsApp Cloud API webhook payloads.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{non_empty, with_correlation, InboundEvent, MediaRef, NormalizedMessage, Receipt};
use crate::types::{MessageType, ProviderFamily};

pub const OBJECT: &str = "whatsapp_business_account";

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<PhoneMetadata>,
    #[serde(default)]
    pub contacts: Vec<WaContact>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub statuses: Vec<WaStatus>,
}

#[derive(Debug, Deserialize)]
pub struct PhoneMetadata {
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WaContact {
    #[serde(default)]
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<WaProfile>,
}

#[derive(Debug, Deserialize)]
pub struct WaProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub recipient_id: String,
}

#[derive(Debug, Deserialize)]
struct WaMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WaContent {
    Text { text: WaText },
    Image { image: WaMedia },
    Audio { audio: WaMedia },
    Video { video: WaMedia },
    Document { document: WaMedia },
    Sticker { sticker: WaMedia },
    Button { button: WaButton },
    Interactive { interactive: WaInteractive },
    Location { location: WaLocation },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct WaText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct WaMedia {
    #[serde(default)]
    id: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaButton {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WaInteractive {
    #[serde(default)]
    button_reply: Option<WaReply>,
    #[serde(default)]
    list_reply: Option<WaReply>,
}

#[derive(Debug, Deserialize)]
struct WaReply {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

pub fn parse(body: &[u8]) -> serde_json::Result<WebhookPayload> {
    serde_json::from_slice(body)
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn profile_names(contacts: &[WaContact]) -> HashMap<String, String> {
    contacts
        .iter()
        .filter_map(|contact| {
            let digits = normalize_phone(&contact.wa_id)?;
            let name = non_empty(contact.profile.as_ref()?.name.as_deref())?;
            Some((digits, name))
        })
        .collect()
}

/// Events for this phone number. Changes addressed to another
/// `phone_number_id` are skipped when one is configured.
pub fn normalize(payload: &WebhookPayload, expected_phone_number_id: &str) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    for change in payload.entry.iter().flat_map(|e| e.changes.iter()) {
        let value = &change.value;
        let phone_number_id = value
            .metadata
            .as_ref()
            .map(|m| m.phone_number_id.as_str())
            .unwrap_or("");
        if !expected_phone_number_id.is_empty()
            && !phone_number_id.is_empty()
            && expected_phone_number_id != phone_number_id
        {
            debug!(phone_number_id, "skipping change for another phone number");
            continue;
        }

        let names = profile_names(&value.contacts);
        for raw in &value.messages {
            if let Some(message) = normalize_message(raw, phone_number_id, &names) {
                events.push(InboundEvent::Message(message));
            }
        }
        events.extend(value.statuses.iter().filter_map(normalize_status));
    }
    events
}

fn normalize_status(status: &WaStatus) -> Option<InboundEvent> {
    if status.id.is_empty() {
        return None;
    }
    let external_ids = vec![status.id.clone()];
    let receipt = match status.status.as_str() {
        "delivered" => Receipt::Delivered { external_ids },
        "read" => Receipt::ReadIds { external_ids },
        _ => return None,
    };
    Some(InboundEvent::Receipt {
        provider: ProviderFamily::Whatsapp,
        sender_id: status.recipient_id.clone(),
        receipt,
    })
}

/// Type, body, media and whether the body was written here.
type Parts = (MessageType, Option<String>, Option<MediaRef>, bool);

fn media_parts(kind: MessageType, label: &str, media: WaMedia) -> Parts {
    let caption = non_empty(media.caption.as_deref());
    let id = media.id.trim().to_string();
    if id.is_empty() {
        return match caption {
            Some(caption) => (kind, Some(caption), None, false),
            None => (kind, Some(format!("Sent a {label} message")), None, true),
        };
    }
    let media = MediaRef::ProviderMedia {
        id,
        mime: non_empty(media.mime_type.as_deref()),
        filename: non_empty(media.filename.as_deref()),
    };
    (kind, caption, Some(media), false)
}

fn normalize_message(
    raw: &Value,
    phone_number_id: &str,
    names: &HashMap<String, String>,
) -> Option<NormalizedMessage> {
    let header = serde_json::from_value::<WaMessage>(raw.clone()).ok()?;
    let sender_id = normalize_phone(&header.from)?;
    let content = serde_json::from_value::<WaContent>(raw.clone()).unwrap_or(WaContent::Unsupported);

    let (message_type, body, media, synthetic) = match content {
        WaContent::Text { text } => (MessageType::Text, non_empty(Some(&text.body)), None, false),
        WaContent::Button { button } => {
            (MessageType::Text, non_empty(Some(&button.text)), None, false)
        }
        WaContent::Interactive { interactive } => {
            let title = interactive
                .button_reply
                .or(interactive.list_reply)
                .map(|r| r.title);
            (MessageType::Text, non_empty(title.as_deref()), None, false)
        }
        WaContent::Location { location } => {
            let label = non_empty(location.name.as_deref())
                .or_else(|| non_empty(location.address.as_deref()));
            let mut text = match label {
                Some(label) => format!("Shared location: {label}"),
                None => "Shared a location".to_string(),
            };
            if location.latitude.abs() > 0.0 || location.longitude.abs() > 0.0 {
                text.push_str(&format!(
                    "\nhttps://maps.google.com/?q={},{}",
                    location.latitude, location.longitude
                ));
            }
            (MessageType::Text, Some(text), None, true)
        }
        WaContent::Image { image } => media_parts(MessageType::Image, "image", image),
        WaContent::Audio { audio } => media_parts(MessageType::Audio, "audio", audio),
        WaContent::Video { video } => media_parts(MessageType::Video, "video", video),
        WaContent::Document { document } => {
            media_parts(MessageType::Document, "document", document)
        }
        WaContent::Sticker { sticker } => media_parts(MessageType::Image, "sticker", sticker),
        WaContent::Unsupported => {
            let kind = header.kind.trim();
            if kind.is_empty() {
                return None;
            }
            (MessageType::Text, Some(format!("Sent a {kind} message")), None, true)
        }
    };

    // Text-like messages with nothing to say are dropped, media is kept.
    if body.is_none() && media.is_none() {
        return None;
    }

    Some(NormalizedMessage {
        provider: ProviderFamily::Whatsapp,
        sender_name: names.get(&sender_id).cloned(),
        metadata: with_correlation(
            raw,
            ProviderFamily::Whatsapp,
            &[("sender_id", &sender_id), ("phone_number_id", phone_number_id)],
        ),
        sender_id,
        external_id: non_empty(Some(&header.id)),
        message_type,
        body,
        synthetic,
        media,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> WebhookPayload {
        serde_json::from_value(json!({
            "object": OBJECT,
            "entry": [{ "changes": [{ "field": "messages", "value": value }] }]
        }))
        .unwrap()
    }

    fn only_message(events: Vec<InboundEvent>) -> NormalizedMessage {
        assert_eq!(events.len(), 1);
        match events.into_iter().next() {
            Some(InboundEvent::Message(message)) => message,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn text_message_with_profile_name() {
        let events = normalize(
            &payload(json!({
                "metadata": { "phone_number_id": "pn-1" },
                "contacts": [{ "wa_id": "51999888777", "profile": { "name": "Ana" } }],
                "messages": [{
                    "id": "wamid.1",
                    "from": "51999888777",
                    "type": "text",
                    "text": { "body": "Hola" }
                }]
            })),
            "pn-1",
        );

        let message = only_message(events);
        assert_eq!(message.sender_id, "51999888777");
        assert_eq!(message.sender_name.as_deref(), Some("Ana"));
        assert_eq!(message.body.as_deref(), Some("Hola"));
        assert_eq!(message.message_type, MessageType::Text);
        assert_eq!(message.external_id.as_deref(), Some("wamid.1"));
        assert_eq!(message.metadata["whatsapp_sender_id"], "51999888777");
        assert!(message.is_plain_text());
    }

    #[test]
    fn image_uses_caption_and_media_id() {
        let events = normalize(
            &payload(json!({
                "messages": [{
                    "id": "wamid.2",
                    "from": "+51 999 888 777",
                    "type": "image",
                    "image": { "id": "media-77", "caption": "mira", "mime_type": "image/jpeg" }
                }]
            })),
            "",
        );

        let message = only_message(events);
        assert_eq!(message.sender_id, "51999888777");
        assert_eq!(message.message_type, MessageType::Image);
        assert_eq!(message.body.as_deref(), Some("mira"));
        assert_eq!(
            message.media,
            Some(MediaRef::ProviderMedia {
                id: "media-77".into(),
                mime: Some("image/jpeg".into()),
                filename: None,
            })
        );
        assert!(!message.is_plain_text());
    }

    #[test]
    fn document_without_caption_has_no_body() {
        let events = normalize(
            &payload(json!({
                "messages": [{
                    "from": "51999",
                    "type": "document",
                    "document": { "id": "doc-1", "filename": "cotizacion.pdf" }
                }]
            })),
            "",
        );

        let message = only_message(events);
        assert_eq!(message.message_type, MessageType::Document);
        assert!(message.body.is_none());
        assert_eq!(
            message.media.as_ref().and_then(MediaRef::filename),
            Some("cotizacion.pdf")
        );
    }

    #[test]
    fn interactive_reply_becomes_text() {
        let events = normalize(
            &payload(json!({
                "messages": [{
                    "from": "51999",
                    "type": "interactive",
                    "interactive": { "type": "button_reply", "button_reply": { "id": "b1", "title": "Sí" } }
                }]
            })),
            "",
        );

        assert_eq!(only_message(events).body.as_deref(), Some("Sí"));
    }

    #[test]
    fn unknown_type_is_described() {
        let events = normalize(
            &payload(json!({
                "messages": [{ "from": "51999", "type": "contacts", "contacts": [] }]
            })),
            "",
        );

        let message = only_message(events);
        assert_eq!(message.body.as_deref(), Some("Sent a contacts message"));
        assert_eq!(message.message_type, MessageType::Text);
        assert!(!message.is_plain_text());
    }

    #[test]
    fn media_without_id_is_described_not_answered() {
        let events = normalize(
            &payload(json!({
                "messages": [{ "from": "51999", "type": "image", "image": { "mime_type": "image/jpeg" } }]
            })),
            "",
        );

        let message = only_message(events);
        assert_eq!(message.message_type, MessageType::Image);
        assert_eq!(message.body.as_deref(), Some("Sent a image message"));
        assert!(message.media.is_none());
        assert!(!message.is_plain_text());
    }

    #[test]
    fn shared_location_is_not_plain_text() {
        let events = normalize(
            &payload(json!({
                "messages": [{
                    "from": "51999",
                    "type": "location",
                    "location": { "latitude": -12.05, "longitude": -77.04, "name": "Tienda Centro" }
                }]
            })),
            "",
        );

        let message = only_message(events);
        assert!(message
            .body
            .as_deref()
            .is_some_and(|b| b.starts_with("Shared location: Tienda Centro")));
        assert!(message.synthetic);
    }

    #[test]
    fn other_phone_number_is_skipped() {
        let events = normalize(
            &payload(json!({
                "metadata": { "phone_number_id": "pn-other" },
                "messages": [{ "from": "51999", "type": "text", "text": { "body": "x" } }]
            })),
            "pn-1",
        );

        assert!(events.is_empty());
    }

    #[test]
    fn statuses_become_receipts() {
        let events = normalize(
            &payload(json!({
                "statuses": [
                    { "id": "wamid.9", "status": "delivered", "recipient_id": "51999" },
                    { "id": "wamid.8", "status": "read", "recipient_id": "51999" },
                    { "id": "wamid.7", "status": "sent", "recipient_id": "51999" }
                ]
            })),
            "",
        );

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            InboundEvent::Receipt { receipt: Receipt::Delivered { external_ids }, .. }
                if external_ids == &vec!["wamid.9".to_string()]
        ));
        assert!(matches!(
            &events[1],
            InboundEvent::Receipt { receipt: Receipt::ReadIds { .. }, .. }
        ));
    }
}
