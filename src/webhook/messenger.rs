use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::Value;

use super::{receive_for, verify_for, SubscriptionQuery};
use crate::app::AppState;
use crate::error::Result;
use crate::normalize::{messenger, InboundEvent};
use crate::types::{Channel, ChannelType};

/// Events for the channel's page; `pageId` is optional in channel config.
pub fn events(channel: &Channel, body: &[u8]) -> serde_json::Result<Vec<InboundEvent>> {
    let payload = messenger::parse(body)?;
    Ok(messenger::normalize(&payload, &channel.config_text("pageId")))
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<String> {
    verify_for(&state, ChannelType::Messenger, &query).await
}

pub async fn event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    receive_for(&state, ChannelType::Messenger, &headers, &body).await
}
