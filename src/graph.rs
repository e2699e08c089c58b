//! Meta Graph API client: profile lookups, media download and outbound sends.

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde_json::{json, Value};
use tracing::debug;

use crate::contacts::ProfileFetcher;
use crate::error::{AppError, Result};
use crate::media::{LocalMediaStore, MediaRelocator, StoredMedia};
use crate::normalize::MediaRef;
use crate::types::{Channel, MessageType, ProviderFamily};

/// Delivers a text reply through `provider` using the channel's credentials.
///
/// The provider comes from the inbound event, not the channel type: a
/// `facebook` channel carries WhatsApp and Instagram traffic too.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Returns the provider's id for the sent message when it reports one.
    async fn send_text(
        &self,
        channel: &Channel,
        provider: ProviderFamily,
        recipient_id: &str,
        text: &str,
    ) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: String,
    media: LocalMediaStore,
}

async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Upstream(format!(
        "{what} error {}: {body}",
        status.as_u16()
    )))
}

impl GraphClient {
    pub fn new(http: Client, base_url: impl Into<String>, media: LocalMediaStore) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            media,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Two-step WhatsApp download: resolve the media id, then fetch the bytes
    /// with the same bearer token.
    async fn fetch_whatsapp_media(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<(Vec<u8>, String)> {
        let lookup = self
            .http
            .get(self.url(media_id))
            .bearer_auth(access_token)
            .send()
            .await?;
        let metadata = ensure_success(lookup, "whatsapp media metadata")
            .await?
            .json::<Value>()
            .await?;
        let media_url = metadata
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AppError::Upstream("missing media url from whatsapp".into()))?
            .to_string();
        let fallback_mime = metadata
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();

        let download = self
            .http
            .get(media_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        self.read_body(download, "whatsapp media download", &fallback_mime)
            .await
    }

    async fn fetch_url(&self, url: &str, fallback_mime: &str) -> Result<(Vec<u8>, String)> {
        let response = self.http.get(url).send().await?;
        self.read_body(response, "media download", fallback_mime).await
    }

    async fn read_body(
        &self,
        response: Response,
        what: &str,
        fallback_mime: &str,
    ) -> Result<(Vec<u8>, String)> {
        let response = ensure_success(response, what).await?;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(fallback_mime)
            .to_string();
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), content_type))
    }

    async fn post_json(&self, url: String, access_token: &str, payload: &Value, what: &str) -> Result<Value> {
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await?;
        let body = ensure_success(response, what).await?.text().await?;
        Ok(serde_json::from_str::<Value>(&body).unwrap_or_else(|_| json!({ "raw": body })))
    }
}

#[async_trait]
impl ProfileFetcher for GraphClient {
    async fn display_name(
        &self,
        family: ProviderFamily,
        external_id: &str,
        access_token: &str,
    ) -> Result<Option<String>> {
        let fields = match family {
            ProviderFamily::Messenger => "first_name,last_name,name",
            ProviderFamily::Instagram => "name,username",
            // WhatsApp names arrive in the webhook itself.
            ProviderFamily::Whatsapp | ProviderFamily::Widget => return Ok(None),
        };
        let response = self
            .http
            .get(self.url(external_id))
            .query(&[("fields", fields)])
            .bearer_auth(access_token)
            .send()
            .await?;
        let profile = ensure_success(response, "profile lookup")
            .await?
            .json::<Value>()
            .await?;

        let text = |key: &str| {
            profile
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let name = text("name").or_else(|| {
            let full = [text("first_name"), text("last_name")]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            (!full.is_empty()).then_some(full)
        });
        Ok(name.or_else(|| text("username")))
    }
}

#[async_trait]
impl MediaRelocator for GraphClient {
    async fn relocate(
        &self,
        media: &MediaRef,
        message_type: MessageType,
        access_token: Option<&str>,
    ) -> Result<StoredMedia> {
        let (bytes, mime, filename) = match media {
            MediaRef::ProviderMedia { id, mime, filename } => {
                let token = access_token
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| AppError::Upstream("missing accessToken for media lookup".into()))?;
                let (bytes, fetched_mime) = self.fetch_whatsapp_media(id, token).await?;
                // The webhook's declared type is more specific than the CDN header.
                let mime = mime.clone().unwrap_or(fetched_mime);
                (bytes, mime, filename.as_deref())
            }
            MediaRef::Url { url } => {
                let (bytes, mime) = self.fetch_url(url, "application/octet-stream").await?;
                (bytes, mime, None)
            }
        };
        let stored = self.media.save(&bytes, &mime, filename, message_type).await?;
        debug!(reference = media.reference(), url = %stored.url, size = stored.size, "stored media");
        Ok(stored)
    }
}

#[async_trait]
impl MessageSender for GraphClient {
    async fn send_text(
        &self,
        channel: &Channel,
        provider: ProviderFamily,
        recipient_id: &str,
        text: &str,
    ) -> Result<Option<String>> {
        let access_token = channel.config_text("accessToken");
        if access_token.is_empty() {
            return Err(AppError::Upstream(format!(
                "channel {} has no accessToken",
                channel.id
            )));
        }

        match provider {
            ProviderFamily::Whatsapp => {
                let phone_number_id = channel.config_text("phoneNumberId");
                if phone_number_id.is_empty() {
                    return Err(AppError::Upstream(format!(
                        "channel {} has no phoneNumberId",
                        channel.id
                    )));
                }
                let payload = json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": "individual",
                    "to": recipient_id,
                    "type": "text",
                    "text": { "preview_url": false, "body": text },
                });
                let body = self
                    .post_json(
                        self.url(&format!("{phone_number_id}/messages")),
                        &access_token,
                        &payload,
                        "whatsapp send",
                    )
                    .await?;
                Ok(body
                    .pointer("/messages/0/id")
                    .and_then(Value::as_str)
                    .map(str::to_string))
            }
            ProviderFamily::Messenger | ProviderFamily::Instagram => {
                let payload = json!({
                    "recipient": { "id": recipient_id },
                    "messaging_type": "RESPONSE",
                    "message": { "text": text },
                });
                let body = self
                    .post_json(self.url("me/messages"), &access_token, &payload, "send api")
                    .await?;
                Ok(body
                    .get("message_id")
                    .and_then(Value::as_str)
                    .map(str::to_string))
            }
            ProviderFamily::Widget => Err(AppError::Internal(
                "widget replies are delivered over the realtime hub".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelStatus, ChannelType};
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, dir: &std::path::Path) -> GraphClient {
        GraphClient::new(
            Client::new(),
            server.uri(),
            LocalMediaStore::new(dir, "https://inbox.example"),
        )
    }

    fn channel(channel_type: ChannelType, config: Value) -> Channel {
        Channel {
            id: "ch-1".into(),
            channel_type,
            name: "Ventas".into(),
            status: ChannelStatus::Active,
            config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn messenger_profile_joins_first_and_last_name() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path("/psid-1"))
            .and(query_param("fields", "first_name,last_name,name"))
            .and(header("authorization", "Bearer page-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "first_name": "Luis", "last_name": "Rojas" })),
            )
            .mount(&server)
            .await;

        let name = client(&server, dir.path())
            .display_name(ProviderFamily::Messenger, "psid-1", "page-token")
            .await
            .unwrap();

        assert_eq!(name.as_deref(), Some("Luis Rojas"));
    }

    #[tokio::test]
    async fn profile_error_is_upstream() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad token"))
            .mount(&server)
            .await;

        let err = client(&server, dir.path())
            .display_name(ProviderFamily::Instagram, "ig-1", "t")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Upstream(message) if message.contains("400")));
    }

    #[tokio::test]
    async fn whatsapp_media_is_looked_up_then_stored() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path("/media-77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/cdn/media-77", server.uri()),
                "mime_type": "image/jpeg"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/media-77"))
            .and(header("authorization", "Bearer wa-token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0xd8, 0xff]))
            .mount(&server)
            .await;

        let media = MediaRef::ProviderMedia {
            id: "media-77".into(),
            mime: Some("image/jpeg".into()),
            filename: None,
        };
        let stored = client(&server, dir.path())
            .relocate(&media, MessageType::Image, Some("wa-token"))
            .await
            .unwrap();

        assert_eq!(stored.mime, "image/jpeg");
        assert_eq!(stored.size, 3);
        assert!(stored.url.starts_with("https://inbox.example/api/media/"));
        assert!(stored.url.ends_with(".jpg"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn provider_media_without_token_fails() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let media = MediaRef::ProviderMedia {
            id: "media-1".into(),
            mime: None,
            filename: None,
        };

        let result = client(&server, dir.path())
            .relocate(&media, MessageType::Audio, None)
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn whatsapp_send_returns_message_id() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("POST"))
            .and(path("/pn-1/messages"))
            .and(body_partial_json(json!({ "to": "51999", "text": { "body": "Hola" } })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "messages": [{ "id": "wamid.out" }] })),
            )
            .mount(&server)
            .await;
        let channel = channel(
            ChannelType::Whatsapp,
            json!({ "accessToken": "t", "phoneNumberId": "pn-1" }),
        );

        let id = client(&server, dir.path())
            .send_text(&channel, ProviderFamily::Whatsapp, "51999", "Hola")
            .await
            .unwrap();

        assert_eq!(id.as_deref(), Some("wamid.out"));
    }

    #[tokio::test]
    async fn messenger_send_uses_send_api() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .and(body_partial_json(json!({ "recipient": { "id": "psid-1" } })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "recipient_id": "psid-1", "message_id": "m-out" })),
            )
            .mount(&server)
            .await;
        let channel = channel(ChannelType::Facebook, json!({ "accessToken": "t" }));

        let id = client(&server, dir.path())
            .send_text(&channel, ProviderFamily::Messenger, "psid-1", "Hola")
            .await
            .unwrap();

        assert_eq!(id.as_deref(), Some("m-out"));
    }

    #[tokio::test]
    async fn facebook_channel_sends_whatsapp_replies_to_the_phone_number() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("POST"))
            .and(path("/pn-9/messages"))
            .and(body_partial_json(json!({ "messaging_product": "whatsapp", "to": "51988" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "messages": [{ "id": "wamid.fb" }] })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let channel = channel(
            ChannelType::Facebook,
            json!({ "accessToken": "t", "phoneNumberId": "pn-9" }),
        );

        let id = client(&server, dir.path())
            .send_text(&channel, ProviderFamily::Whatsapp, "51988", "Hola")
            .await
            .unwrap();

        assert_eq!(id.as_deref(), Some("wamid.fb"));
    }
}
