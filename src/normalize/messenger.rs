//! Messenger Platform webhook payloads (`object: "page"`).
//!
//! Instagram messaging uses the same envelope, so the event types and the
//! per-event normalization live here and are reused by [`super::instagram`].

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    attachment_message_type, millis_to_utc, non_empty, with_correlation, InboundEvent, MediaRef,
    NormalizedMessage, Receipt,
};
use crate::types::{MessageType, ProviderFamily};

pub const OBJECT: &str = "page";

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
    pub id: String,
    /// Kept raw so the original event lands in message metadata.
    #[serde(default)]
    pub messaging: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    #[serde(default)]
    pub sender: Option<Party>,
    #[serde(default)]
    pub recipient: Option<Party>,
    #[serde(default)]
    pub message: Option<EventMessage>,
    #[serde(default)]
    pub postback: Option<Postback>,
    #[serde(default)]
    pub delivery: Option<Delivery>,
    #[serde(default)]
    pub read: Option<ReadReceipt>,
}

#[derive(Debug, Deserialize)]
pub struct Party {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Instagram variant that embeds media directly under `message`.
    #[serde(default)]
    pub image: Option<DirectMedia>,
    #[serde(default)]
    pub video: Option<DirectMedia>,
}

#[derive(Debug, Deserialize)]
pub struct Attachment {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DirectMedia {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Postback {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct Delivery {
    #[serde(default)]
    pub mids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadReceipt {
    #[serde(default)]
    pub watermark: Option<i64>,
}

pub fn parse(body: &[u8]) -> serde_json::Result<WebhookPayload> {
    serde_json::from_slice(body)
}

/// Events for this page. Entries addressed to another page are skipped when
/// a `pageId` is configured.
pub fn normalize(payload: &WebhookPayload, expected_page_id: &str) -> Vec<InboundEvent> {
    payload
        .entry
        .iter()
        .filter(|entry| {
            let foreign = !expected_page_id.is_empty()
                && !entry.id.is_empty()
                && entry.id != expected_page_id;
            if foreign {
                debug!(page_id = %entry.id, "skipping entry for another page");
            }
            !foreign
        })
        .flat_map(|entry| entry.messaging.iter())
        .filter_map(|raw| normalize_event(ProviderFamily::Messenger, raw))
        .collect()
}

/// One `messaging[]` item to at most one event.
pub(crate) fn normalize_event(provider: ProviderFamily, raw: &Value) -> Option<InboundEvent> {
    let event = match serde_json::from_value::<MessagingEvent>(raw.clone()) {
        Ok(event) => event,
        Err(err) => {
            debug!(%provider, error = %err, "unreadable messaging event");
            return None;
        }
    };
    let sender_id = non_empty(event.sender.as_ref().map(|p| p.id.as_str()))?;

    if let Some(delivery) = event.delivery {
        let external_ids = delivery
            .mids
            .into_iter()
            .filter(|mid| !mid.trim().is_empty())
            .collect::<Vec<_>>();
        if external_ids.is_empty() {
            return None;
        }
        return Some(InboundEvent::Receipt {
            provider,
            sender_id,
            receipt: Receipt::Delivered { external_ids },
        });
    }

    if let Some(read) = event.read {
        let watermark = read.watermark.and_then(millis_to_utc)?;
        return Some(InboundEvent::Receipt {
            provider,
            sender_id,
            receipt: Receipt::ReadUpTo { watermark },
        });
    }

    let recipient_id = event
        .recipient
        .as_ref()
        .map(|p| p.id.clone())
        .unwrap_or_default();
    let metadata = with_correlation(
        raw,
        provider,
        &[("sender_id", &sender_id), ("recipient_id", &recipient_id)],
    );

    if let Some(postback) = event.postback {
        let body = non_empty(postback.title.as_deref()).or_else(|| {
            postback
                .payload
                .as_ref()
                .map(|payload| match payload {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .filter(|text| !text.is_empty())
        });
        return Some(InboundEvent::Message(NormalizedMessage {
            provider,
            sender_id,
            sender_name: None,
            external_id: non_empty(postback.mid.as_deref()),
            message_type: MessageType::Postback,
            body,
            synthetic: false,
            media: None,
            metadata,
        }));
    }

    let message = event.message?;
    let external_id = non_empty(message.mid.as_deref());
    if message.is_echo {
        return Some(InboundEvent::Echo { external_id });
    }

    let text = non_empty(message.text.as_deref());
    let (message_type, body, media, synthetic) = match media_of(&message) {
        Some((kind, url)) => {
            let synthetic = text.is_none();
            (
                attachment_message_type(&kind),
                text.or(Some(kind)),
                // Shares and fallbacks carry no url; only the label is kept.
                url.map(|url| MediaRef::Url { url }),
                synthetic,
            )
        }
        None => (MessageType::Text, text, None, false),
    };
    if body.is_none() && media.is_none() {
        return None;
    }

    Some(InboundEvent::Message(NormalizedMessage {
        provider,
        sender_id,
        sender_name: None,
        external_id,
        message_type,
        body,
        synthetic,
        media,
        metadata,
    }))
}

/// First attachment kind and url, from `attachments[]` or the direct
/// `image`/`video` shape.
fn media_of(message: &EventMessage) -> Option<(String, Option<String>)> {
    if let Some(attachment) = message.attachments.first() {
        let kind = non_empty(Some(&attachment.kind)).unwrap_or_else(|| "Media".to_string());
        let url = non_empty(attachment.payload.as_ref().and_then(|p| p.url.as_deref()));
        return Some((kind, url));
    }
    let direct = [("image", &message.image), ("video", &message.video)];
    direct.into_iter().find_map(|(kind, media)| {
        let media = media.as_ref()?;
        Some((kind.to_string(), non_empty(media.url.as_deref())))
    })
}
