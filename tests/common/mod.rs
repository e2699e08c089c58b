#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;

use inbox_ingest::ai::AiResponder;
use inbox_ingest::app::{router, AppState, Collaborators};
use inbox_ingest::config::AppConfig;
use inbox_ingest::contacts::ProfileFetcher;
use inbox_ingest::error::{AppError, Result};
use inbox_ingest::graph::MessageSender;
use inbox_ingest::media::{MediaRelocator, StoredMedia};
use inbox_ingest::normalize::MediaRef;
use inbox_ingest::signature::{compute_signature, SIGNATURE_HEADER};
use inbox_ingest::store::MemoryStore;
use inbox_ingest::types::{
    Channel, ChannelStatus, ChannelType, Message, MessageType, ProviderFamily, SenderType,
};

pub const APP_SECRET: &str = "app-secret";
pub const VERIFY_TOKEN: &str = "verify-me";

pub struct NoProfiles;

#[async_trait]
impl ProfileFetcher for NoProfiles {
    async fn display_name(
        &self,
        _family: ProviderFamily,
        _external_id: &str,
        _access_token: &str,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

pub struct UnreachableMedia;

#[async_trait]
impl MediaRelocator for UnreachableMedia {
    async fn relocate(
        &self,
        _media: &MediaRef,
        _message_type: MessageType,
        _access_token: Option<&str>,
    ) -> Result<StoredMedia> {
        Err(AppError::Upstream("cdn timed out".into()))
    }
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(ProviderFamily, String, String)>>,
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_text(
        &self,
        _channel: &Channel,
        provider: ProviderFamily,
        recipient_id: &str,
        text: &str,
    ) -> Result<Option<String>> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((provider, recipient_id.to_string(), text.to_string()));
        }
        Ok(Some(format!("out-{}", uuid::Uuid::new_v4())))
    }
}

pub struct CannedAi(pub &'static str);

#[async_trait]
impl AiResponder for CannedAi {
    async fn reply(&self, _system_prompt: &str, _history: &[Message]) -> Result<String> {
        Ok(self.0.to_string())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub state: Arc<AppState>,
    pub sender: Arc<RecordingSender>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::default());
        let state = Arc::new(AppState::new(
            AppConfig::default(),
            store.clone(),
            Collaborators {
                profiles: Arc::new(NoProfiles),
                relocator: Arc::new(UnreachableMedia),
                sender: sender.clone(),
                ai: Arc::new(CannedAi("¡Hola! Soy el asistente.")),
            },
        ));
        Self {
            store,
            state,
            sender,
        }
    }

    pub fn app(&self) -> Router {
        router(self.state.clone())
    }

    pub async fn add_channel(&self, id: &str, channel_type: ChannelType, config: Value) -> Channel {
        let channel = Channel {
            id: id.to_string(),
            channel_type,
            name: format!("{channel_type} channel"),
            status: ChannelStatus::Active,
            config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.insert_channel(channel.clone()).await;
        channel
    }

    /// Waits for the detached auto reply to land.
    pub async fn wait_for_bot_message(&self) -> Option<Message> {
        for _ in 0..50 {
            let bot = self
                .store
                .messages()
                .await
                .into_iter()
                .find(|m| m.sender_type == SenderType::Bot);
            if bot.is_some() {
                return bot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

pub fn signed_post(uri: &str, secret: &str, body: &Value) -> Request<Body> {
    let bytes = serde_json::to_vec(body).unwrap();
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, compute_signature(secret, &bytes))
        .body(Body::from(bytes))
        .unwrap()
}

pub fn json_post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

pub async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, request).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}
