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
use crate::normalize::{whatsapp, InboundEvent};
use crate::types::{Channel, ChannelType};

/// Events addressed to this channel's phone number.
pub fn events(channel: &Channel, body: &[u8]) -> serde_json::Result<Vec<InboundEvent>> {
    let payload = whatsapp::parse(body)?;
    Ok(whatsapp::normalize(
        &payload,
        &channel.config_text("phoneNumberId"),
    ))
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<String> {
    verify_for(&state, ChannelType::Whatsapp, &query).await
}

pub async fn event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    receive_for(&state, ChannelType::Whatsapp, &headers, &body).await
}
