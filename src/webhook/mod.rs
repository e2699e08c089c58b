//! Provider webhook intake.
//!
//! Every provider route runs the same pipeline; the submodules only differ
//! in how the channel is found and how the body is normalized.

pub mod instagram;
pub mod messenger;
pub mod whatsapp;

use std::fmt;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::ai::{dispatch_auto_reply, has_handover_intent, AutoReplyJob, HandoffPolicy};
use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::media;
use crate::normalize::{self, InboundEvent, NormalizedMessage, Receipt};
use crate::signature::{verify_signature, SIGNATURE_HEADER};
use crate::types::{Channel, ChannelType, MessageStatus, ProviderFamily};

#[derive(Debug, Deserialize)]
pub struct SubscriptionQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Echoes `hub.challenge` back when the subscribe request carries the
/// channel's verify token.
pub fn subscription_challenge(query: &SubscriptionQuery, expected_token: &str) -> Result<String> {
    let mode = query.mode.as_deref().unwrap_or("");
    let token = query.verify_token.as_deref().unwrap_or("");
    let expected = expected_token.trim();
    if mode == "subscribe" && !expected.is_empty() && token == expected {
        return Ok(query.challenge.clone().unwrap_or_default());
    }
    Err(AppError::Unauthorized("verification failed".into()))
}

/// Where a POST is in its pipeline; used to label failures in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Verified,
    Parsed,
    ContactResolved,
    ConversationResolved,
    MessageNormalized,
    Persisted,
    AiDispatched,
    Acknowledged,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Verified => "verified",
            Self::Parsed => "parsed",
            Self::ContactResolved => "contact_resolved",
            Self::ConversationResolved => "conversation_resolved",
            Self::MessageNormalized => "message_normalized",
            Self::Persisted => "persisted",
            Self::AiDispatched => "ai_dispatched",
            Self::Acknowledged => "acknowledged",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub processed: usize,
    pub duplicates: usize,
    pub echoes: usize,
    pub receipts: usize,
    pub ai_dispatched: usize,
}

/// Logs a failed step with the last stage the request reached.
fn failed_at(stage: IngestStage) -> impl Fn(&AppError) {
    move |err| error!(stage = %stage, error = %err, "webhook ingestion failed")
}

/// Channel type a conversation is filed under. The generic `facebook`
/// channel can carry any Meta product, so the event's family decides.
fn conversation_channel(channel: &Channel, provider: ProviderFamily) -> ChannelType {
    if channel.channel_type.family() == provider {
        return channel.channel_type;
    }
    match provider {
        ProviderFamily::Whatsapp => ChannelType::Whatsapp,
        ProviderFamily::Messenger => ChannelType::Messenger,
        ProviderFamily::Instagram => ChannelType::Instagram,
        ProviderFamily::Widget => ChannelType::Widget,
    }
}

fn access_token(channel: &Channel) -> Option<String> {
    Some(channel.config_text("accessToken")).filter(|t| !t.is_empty())
}

/// Persists one inbound message; duplicates are counted, not stored.
async fn ingest_message(
    state: &AppState,
    channel: &Channel,
    normalized: NormalizedMessage,
    outcome: &mut IngestOutcome,
) -> Result<()> {
    let token = access_token(channel);
    let contact = state
        .contacts
        .find_or_create(
            normalized.provider,
            &normalized.sender_id,
            normalized.sender_name.as_deref(),
            token.as_deref(),
        )
        .await
        .inspect_err(failed_at(IngestStage::Parsed))?;

    let conversation = state
        .conversations
        .find_or_create(
            &contact.id,
            conversation_channel(channel, normalized.provider),
            Some(channel.id.as_str()),
        )
        .await
        .inspect_err(failed_at(IngestStage::ContactResolved))?;

    // Decided on the conversation as it stood before this message.
    let wants_reply = normalized.is_plain_text()
        && !normalized
            .body
            .as_deref()
            .map(has_handover_intent)
            .unwrap_or(false)
        && HandoffPolicy::evaluate(state.store.as_ref(), channel, &conversation.id)
            .await
            .inspect_err(failed_at(IngestStage::ConversationResolved))?;

    let message = media::materialize(
        state.relocator.as_ref(),
        &normalized,
        &conversation.id,
        token.as_deref(),
    )
    .await;

    let inserted = state
        .store
        .insert_message(&message)
        .await
        .inspect_err(failed_at(IngestStage::MessageNormalized))?;
    if !inserted {
        debug!(
            provider = %normalized.provider,
            external_id = ?normalized.external_id,
            "duplicate delivery acknowledged"
        );
        outcome.duplicates += 1;
        return Ok(());
    }
    state
        .conversations
        .update_last_message(&conversation.id)
        .await
        .inspect_err(failed_at(IngestStage::Persisted))?;
    state.realtime.publish(&message);
    outcome.processed += 1;

    if wants_reply {
        dispatch_auto_reply(
            state.auto_reply.clone(),
            AutoReplyJob {
                channel: channel.clone(),
                provider: normalized.provider,
                conversation_id: conversation.id.clone(),
                recipient_id: normalized.sender_id.clone(),
            },
        );
        outcome.ai_dispatched += 1;
    }
    let stage = if wants_reply {
        IngestStage::AiDispatched
    } else {
        IngestStage::Persisted
    };
    debug!(
        stage = %stage,
        conversation_id = %conversation.id,
        message_id = %message.id,
        "inbound message stored"
    );
    Ok(())
}

async fn apply_receipt(
    state: &AppState,
    provider: ProviderFamily,
    sender_id: &str,
    receipt: Receipt,
) -> Result<u64> {
    match receipt {
        Receipt::Delivered { external_ids } => {
            state
                .store
                .advance_status(provider.as_str(), &external_ids, MessageStatus::Delivered)
                .await
        }
        Receipt::ReadIds { external_ids } => {
            state
                .store
                .advance_status(provider.as_str(), &external_ids, MessageStatus::Read)
                .await
        }
        Receipt::ReadUpTo { watermark } => {
            state
                .store
                .mark_read(provider.as_str(), sender_id, watermark)
                .await
        }
    }
}

pub async fn ingest_events(
    state: &AppState,
    channel: &Channel,
    events: Vec<InboundEvent>,
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();
    for event in events {
        match event {
            InboundEvent::Message(normalized) => {
                ingest_message(state, channel, normalized, &mut outcome).await?;
            }
            InboundEvent::Receipt {
                provider,
                sender_id,
                receipt,
            } => {
                let updated = apply_receipt(state, provider, &sender_id, receipt)
                    .await
                    .inspect_err(failed_at(IngestStage::Parsed))?;
                debug!(%provider, sender_id, updated, "receipt applied");
                outcome.receipts += 1;
            }
            InboundEvent::Echo { external_id } => {
                debug!(?external_id, "ignoring echo");
                outcome.echoes += 1;
            }
        }
    }
    Ok(outcome)
}

/// Object tag shared by every Meta webhook body.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    object: String,
}

/// Normalizes a body for this channel. The `object` tag picks the provider;
/// a tag the channel cannot carry yields no events.
pub fn normalize_for_channel(channel: &Channel, body: &[u8]) -> Result<Vec<InboundEvent>> {
    let unreadable = |err: serde_json::Error| AppError::Internal(format!("unreadable payload: {err}"));
    let envelope = serde_json::from_slice::<Envelope>(body).map_err(unreadable)?;
    let family = match envelope.object.as_str() {
        normalize::whatsapp::OBJECT => ProviderFamily::Whatsapp,
        normalize::messenger::OBJECT => ProviderFamily::Messenger,
        normalize::instagram::OBJECT => ProviderFamily::Instagram,
        other => {
            warn!(object = other, channel_id = %channel.id, "unknown webhook object");
            return Ok(Vec::new());
        }
    };
    let accepts = channel.channel_type == ChannelType::Facebook
        || channel.channel_type.family() == family;
    if !accepts {
        warn!(%family, channel_type = %channel.channel_type, "payload does not match channel");
        return Ok(Vec::new());
    }
    match family {
        ProviderFamily::Whatsapp => whatsapp::events(channel, body).map_err(unreadable),
        ProviderFamily::Messenger => messenger::events(channel, body).map_err(unreadable),
        ProviderFamily::Instagram => instagram::events(body).map_err(unreadable),
        ProviderFamily::Widget => Ok(Vec::new()),
    }
}

async fn active_channel(state: &AppState, channel_type: ChannelType) -> Result<Channel> {
    state
        .store
        .active_channel_by_type(channel_type)
        .await?
        .ok_or_else(|| AppError::Unauthorized(format!("no active {channel_type} channel")))
}

pub(crate) async fn verify_for(
    state: &AppState,
    channel_type: ChannelType,
    query: &SubscriptionQuery,
) -> Result<String> {
    let channel = active_channel(state, channel_type).await?;
    subscription_challenge(query, &channel.config_text("verifyToken"))
}

/// Full POST pipeline for one channel.
pub async fn receive(
    state: &AppState,
    channel: &Channel,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<Value>> {
    debug!(stage = %IngestStage::Received, channel_id = %channel.id, bytes = body.len());
    let secret = channel.config_text("appSecret");
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if !verify_signature(Some(secret.as_str()), header, body) {
        warn!(channel_id = %channel.id, "webhook signature rejected");
        return Err(AppError::Unauthorized("invalid signature".into()));
    }

    let events = normalize_for_channel(channel, body)
        .inspect_err(failed_at(IngestStage::Verified))?;
    let outcome = ingest_events(state, channel, events)
        .await
        .map_err(|err| match err {
            AppError::Internal(_) | AppError::Database(_) => err,
            other => AppError::Internal(other.to_string()),
        })?;

    info!(
        stage = %IngestStage::Acknowledged,
        channel_id = %channel.id,
        processed = outcome.processed,
        duplicates = outcome.duplicates,
        receipts = outcome.receipts,
        echoes = outcome.echoes,
        ai_dispatched = outcome.ai_dispatched,
        "webhook processed"
    );
    Ok(Json(json!({ "status": "ok", "processed": outcome.processed })))
}

pub(crate) async fn receive_for(
    state: &AppState,
    channel_type: ChannelType,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<Value>> {
    let channel = active_channel(state, channel_type).await?;
    receive(state, &channel, headers, body).await
}

pub async fn meta_verify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<String> {
    verify_for(&state, ChannelType::Facebook, &query).await
}

pub async fn meta_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    receive_for(&state, ChannelType::Facebook, &headers, &body).await
}

async fn channel_by_id(state: &AppState, channel_id: &str) -> Result<Channel> {
    state
        .store
        .channel_by_id(channel_id)
        .await?
        .ok_or_else(|| AppError::NotFound("channel not found".into()))
}

pub async fn channel_verify(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<String> {
    let channel = channel_by_id(&state, &channel_id).await?;
    subscription_challenge(&query, &channel.config_text("verifyToken"))
}

pub async fn channel_event(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let channel = channel_by_id(&state, &channel_id).await?;
    if !channel.is_active() {
        return Err(AppError::Unauthorized("channel is not active".into()));
    }
    receive(&state, &channel, &headers, &body).await
}
