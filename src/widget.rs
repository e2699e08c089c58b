//! Public endpoints for the embeddable web widget.
//!
//! The widget authenticates with the channel's `widgetToken` instead of a
//! provider signature.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
    Json,
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

use crate::ai::{dispatch_auto_reply, has_handover_intent, should_auto_reply, AutoReplyJob};
use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::normalize::non_empty;
use crate::types::{
    Channel, ChannelType, Conversation, ConversationStatus, Message, ProviderFamily, SenderType,
};

pub const PING_INTERVAL: Duration = Duration::from_secs(25);

async fn channel_for_token(state: &AppState, token: Option<&str>) -> Result<Channel> {
    let token = non_empty(token).ok_or_else(|| AppError::missing("token"))?;
    state
        .store
        .channel_by_widget_token(&token)
        .await?
        .filter(|channel| channel.is_active())
        .ok_or_else(|| AppError::NotFound("widget not found".into()))
}

#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WidgetConfig {
    pub name: String,
    pub welcome_text: String,
    pub color: String,
    pub position: String,
}

pub async fn config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConfigQuery>,
) -> Result<Json<WidgetConfig>> {
    let channel = channel_for_token(&state, query.token.as_deref()).await?;
    let or = |key: &str, fallback: &str| {
        Some(channel.config_text(key))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    };
    Ok(Json(WidgetConfig {
        name: channel.name.clone(),
        welcome_text: or("welcomeText", "¡Hola! ¿En qué podemos ayudarte?"),
        color: or("color", "#2563eb"),
        position: or("position", "right"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub token: Option<String>,
    pub visitor_id: Option<String>,
}

pub async fn conversation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Value>> {
    let channel = channel_for_token(&state, query.token.as_deref()).await?;
    let visitor_id =
        non_empty(query.visitor_id.as_deref()).ok_or_else(|| AppError::missing("visitor_id"))?;

    let Some(contact) = state
        .store
        .find_contact(ProviderFamily::Widget, &visitor_id)
        .await?
    else {
        return Ok(Json(json!({ "conversation_id": null })));
    };
    let conversation = state
        .store
        .find_open_conversation(&contact.id, ChannelType::Widget, Some(channel.id.as_str()))
        .await?;
    Ok(Json(json!({
        "conversation_id": conversation.map(|c| c.id)
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct VisitorInfo {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WidgetMessageRequest {
    pub token: Option<String>,
    pub message: Option<String>,
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub visitor_info: Option<VisitorInfo>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WidgetMessageResponse {
    pub success: bool,
    pub conversation_id: String,
    pub handoff_to_human: bool,
}

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WidgetMessageRequest>,
) -> Result<Json<WidgetMessageResponse>> {
    let text = non_empty(request.message.as_deref()).ok_or_else(|| AppError::missing("message"))?;
    let visitor_id =
        non_empty(request.visitor_id.as_deref()).ok_or_else(|| AppError::missing("visitor_id"))?;
    let channel = channel_for_token(&state, request.token.as_deref()).await?;

    let visitor = request.visitor_info.unwrap_or_default();
    let contact = state
        .contacts
        .find_or_create(ProviderFamily::Widget, &visitor_id, visitor.name.as_deref(), None)
        .await?;

    // A conversation id from the browser is only trusted when it is still
    // open, belongs to this visitor and to this widget.
    let requested = match non_empty(request.conversation_id.as_deref()) {
        Some(id) => state
            .store
            .conversation_by_id(&id)
            .await?
            .filter(|c| {
                c.contact_id == contact.id
                    && c.status == ConversationStatus::Open
                    && belongs_to(c, &channel)
            }),
        None => None,
    };
    let conversation = match requested {
        Some(conversation) => conversation,
        None => {
            state
                .conversations
                .find_or_create(&contact.id, ChannelType::Widget, Some(channel.id.as_str()))
                .await?
        }
    };

    // Both read the conversation before this message lands.
    let prior = state.store.last_message(&conversation.id).await?;
    let asked_for_human = has_handover_intent(&text);
    let agent_engaged = prior
        .as_ref()
        .is_some_and(|m| m.sender_type == SenderType::Agent);
    let handoff_to_human = asked_for_human || agent_engaged;
    let wants_reply = !asked_for_human && should_auto_reply(channel.ai_enabled(), prior.as_ref());

    let mut message = Message::text(&conversation.id, SenderType::User, &visitor_id, &text);
    message.metadata = json!({
        "widget_visitor_id": visitor_id,
        "visitor_name": visitor.name,
        "visitor_email": visitor.email,
    });
    state.store.insert_message(&message).await?;
    state
        .conversations
        .update_last_message(&conversation.id)
        .await?;
    state.realtime.publish(&message);

    if wants_reply {
        dispatch_auto_reply(
            state.auto_reply.clone(),
            AutoReplyJob {
                channel: channel.clone(),
                provider: ProviderFamily::Widget,
                conversation_id: conversation.id.clone(),
                recipient_id: visitor_id.clone(),
            },
        );
    }
    info!(
        channel_id = %channel.id,
        conversation_id = %conversation.id,
        handoff_to_human,
        ai_dispatched = wants_reply,
        "widget message stored"
    );

    Ok(Json(WidgetMessageResponse {
        success: true,
        conversation_id: conversation.id,
        handoff_to_human,
    }))
}

fn belongs_to(conversation: &Conversation, channel: &Channel) -> bool {
    conversation.channel_id.as_deref() == Some(channel.id.as_str())
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
    pub conversation_id: Option<String>,
}

fn event(payload: Value) -> Event {
    Event::default().data(payload.to_string())
}

/// Live agent and bot messages for one conversation. The subscription and
/// the ping timer live inside the stream and go away when the client does.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let channel = channel_for_token(&state, query.token.as_deref()).await?;
    let conversation_id = non_empty(query.conversation_id.as_deref())
        .ok_or_else(|| AppError::missing("conversation_id"))?;
    let conversation = state
        .store
        .conversation_by_id(&conversation_id)
        .await?
        .filter(|c| c.channel == ChannelType::Widget && belongs_to(c, &channel))
        .ok_or_else(|| AppError::NotFound("conversation not found".into()))?;

    let mut subscription = state.realtime.subscribe(&conversation.id);
    debug!(channel_id = %channel.id, conversation_id = %conversation.id, "widget stream opened");

    let events = async_stream::stream! {
        yield Ok(event(json!({ "type": "connected" })));
        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        loop {
            tokio::select! {
                received = subscription.recv() => {
                    let Some(message) = received else { break };
                    if matches!(message.sender_type, SenderType::Agent | SenderType::Bot) {
                        yield Ok(event(json!({ "type": "message", "message": message })));
                    }
                }
                _ = ping.tick() => {
                    yield Ok(event(json!({ "type": "ping" })));
                }
            }
        }
    };
    Ok(Sse::new(events))
}
