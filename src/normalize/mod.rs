//! Provider payloads to one canonical inbound shape.
//!
//! Every provider module deserializes its webhook body into typed structs and
//! yields [`InboundEvent`]s. Nothing downstream looks at provider JSON again,
//! except `metadata`, which keeps the raw event for audit.

pub mod instagram;
pub mod messenger;
pub mod whatsapp;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{MessageType, ProviderFamily};

/// Where a media payload can be fetched from.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaRef {
    /// Needs a lookup by id before download (WhatsApp Cloud API).
    ProviderMedia {
        id: String,
        mime: Option<String>,
        filename: Option<String>,
    },
    /// Directly downloadable CDN url (Messenger, Instagram).
    Url { url: String },
}

impl MediaRef {
    /// Human-readable reference used in degraded bodies.
    pub fn reference(&self) -> &str {
        match self {
            Self::ProviderMedia { id, .. } => id,
            Self::Url { url } => url,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::ProviderMedia { filename, .. } => filename.as_deref(),
            Self::Url { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub provider: ProviderFamily,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub external_id: Option<String>,
    pub message_type: MessageType,
    pub body: Option<String>,
    /// The body was written by the normalizer ("Sent a contacts message",
    /// a shared location) rather than typed by the sender.
    pub synthetic: bool,
    pub media: Option<MediaRef>,
    pub metadata: Value,
}

impl NormalizedMessage {
    /// Plain text messages are the only ones offered to the auto-responder.
    pub fn is_plain_text(&self) -> bool {
        self.message_type == MessageType::Text
            && !self.synthetic
            && self.media.is_none()
            && self
                .body
                .as_deref()
                .map(|b| !b.trim().is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Receipt {
    Delivered { external_ids: Vec<String> },
    ReadIds { external_ids: Vec<String> },
    ReadUpTo { watermark: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(NormalizedMessage),
    Receipt {
        provider: ProviderFamily,
        sender_id: String,
        receipt: Receipt,
    },
    /// Outbound copy sent by the page itself; never ingested.
    Echo { external_id: Option<String> },
}

/// Canonical type for a Meta attachment tag.
pub fn attachment_message_type(kind: &str) -> MessageType {
    match kind.to_ascii_lowercase().as_str() {
        "image" | "sticker" => MessageType::Image,
        "audio" => MessageType::Audio,
        "video" => MessageType::Video,
        "file" => MessageType::File,
        _ => MessageType::Document,
    }
}

/// Raw event plus provider-prefixed correlation keys.
pub fn with_correlation(raw: &Value, provider: ProviderFamily, extra: &[(&str, &str)]) -> Value {
    let mut metadata = Map::new();
    metadata.insert("raw".to_string(), raw.clone());
    for (key, value) in extra {
        if !value.is_empty() {
            metadata.insert(format!("{provider}_{key}"), Value::String(value.to_string()));
        }
    }
    Value::Object(metadata)
}

pub fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
