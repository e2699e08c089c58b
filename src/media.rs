//! Durable storage for inbound media.
//!
//! Provider media links expire, so every attachment is copied into
//! `MEDIA_STORAGE_DIR` and served back from `/api/media/{file_name}`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::normalize::{MediaRef, NormalizedMessage};
use crate::types::{Message, MessageStatus, MessageType, SenderType};

pub const MEDIA_ROUTE_PREFIX: &str = "/api/media";
pub const UNAVAILABLE_PREFIX: &str = "[media unavailable]";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMedia {
    pub url: String,
    pub mime: String,
    pub size: i64,
    pub name: String,
}

/// Fetches provider media and stores it where it stays reachable.
#[async_trait]
pub trait MediaRelocator: Send + Sync {
    async fn relocate(
        &self,
        media: &MediaRef,
        message_type: MessageType,
        access_token: Option<&str>,
    ) -> Result<StoredMedia>;
}

/// Writes media bytes under a local directory.
#[derive(Debug, Clone)]
pub struct LocalMediaStore {
    dir: PathBuf,
    public_base_url: String,
}

impl LocalMediaStore {
    pub fn new(dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(
        &self,
        bytes: &[u8],
        mime: &str,
        original_name: Option<&str>,
        message_type: MessageType,
    ) -> Result<StoredMedia> {
        let ext = original_name
            .and_then(extension_from_filename)
            .unwrap_or_else(|| extension_from_mime(mime, message_type).to_string());
        let file_name = format!("{}.{}", Uuid::new_v4(), ext);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::Internal(format!("media dir: {e}")))?;
        tokio::fs::write(self.dir.join(&file_name), bytes)
            .await
            .map_err(|e| AppError::Internal(format!("media write: {e}")))?;

        Ok(StoredMedia {
            url: public_url(
                &self.public_base_url,
                &format!("{MEDIA_ROUTE_PREFIX}/{file_name}"),
            ),
            mime: mime.to_string(),
            size: bytes.len() as i64,
            name: original_name
                .map(str::to_string)
                .unwrap_or_else(|| file_name.clone()),
        })
    }

    /// Bytes and content type of a stored file, `None` when it does not exist.
    pub async fn read(&self, file_name: &str) -> Result<Option<(Vec<u8>, &'static str)>> {
        if !is_safe_file_name(file_name) {
            return Err(AppError::BadRequest {
                field: "file_name",
                message: "invalid media file name".into(),
            });
        }
        match tokio::fs::read(self.dir.join(file_name)).await {
            Ok(bytes) => {
                let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
                Ok(Some((bytes, content_type_from_extension(&ext))))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Internal(format!("media read: {err}"))),
        }
    }
}

/// Canonical message for an inbound event, relocating media first.
///
/// Relocation failure never drops the message: it keeps the attempted type
/// and carries the original reference in the body.
pub async fn materialize(
    relocator: &dyn MediaRelocator,
    normalized: &NormalizedMessage,
    conversation_id: &str,
    access_token: Option<&str>,
) -> Message {
    let mut message = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        body: normalized.body.clone(),
        message_type: normalized.message_type,
        sender_type: SenderType::User,
        sender_id: normalized.sender_id.clone(),
        provider: Some(normalized.provider.to_string()),
        external_id: normalized.external_id.clone(),
        status: MessageStatus::Sent,
        media_url: None,
        media_mime: None,
        media_size: None,
        media_name: None,
        metadata: normalized.metadata.clone(),
        created_at: chrono::Utc::now(),
    };

    let Some(media) = &normalized.media else {
        return message;
    };
    match relocator
        .relocate(media, normalized.message_type, access_token)
        .await
    {
        Ok(stored) => {
            message.media_url = Some(stored.url);
            message.media_mime = Some(stored.mime);
            message.media_size = Some(stored.size);
            message.media_name = Some(stored.name);
        }
        Err(err) => {
            warn!(
                provider = %normalized.provider,
                reference = media.reference(),
                error = %err,
                "media relocation failed; storing placeholder"
            );
            message.body = Some(format!("{UNAVAILABLE_PREFIX} {}", media.reference()));
            if let Value::Object(metadata) = &mut message.metadata {
                metadata.insert("media_error".into(), Value::String(err.to_string()));
            }
        }
    }
    message
}

pub fn public_url(base: &str, path: &str) -> String {
    let value = path.trim();
    if value.starts_with("http://") || value.starts_with("https://") {
        return value.to_string();
    }
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return value.to_string();
    }
    if value.starts_with('/') {
        format!("{base}{value}")
    } else {
        format!("{base}/{value}")
    }
}

pub fn extension_from_filename(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

pub fn extension_from_mime(mime: &str, message_type: MessageType) -> &'static str {
    let mt = mime.to_ascii_lowercase();
    if mt.contains("jpeg") || mt.contains("jpg") {
        "jpg"
    } else if mt.contains("png") {
        "png"
    } else if mt.contains("webp") {
        "webp"
    } else if mt.contains("gif") {
        "gif"
    } else if mt.contains("mpeg") || mt.contains("mp3") {
        "mp3"
    } else if mt.contains("ogg") {
        "ogg"
    } else if mt.contains("wav") {
        "wav"
    } else if mt.contains("mp4") {
        "mp4"
    } else if mt.contains("quicktime") {
        "mov"
    } else if mt.contains("pdf") {
        "pdf"
    } else if mt.contains("plain") {
        "txt"
    } else {
        match message_type {
            MessageType::Image => "jpg",
            MessageType::Audio => "ogg",
            MessageType::Video => "mp4",
            _ => "bin",
        }
    }
}

pub fn content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

pub fn is_safe_file_name(value: &str) -> bool {
    !value.is_empty()
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
