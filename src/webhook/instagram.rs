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
use crate::normalize::{instagram, InboundEvent};
use crate::types::ChannelType;

pub fn events(body: &[u8]) -> serde_json::Result<Vec<InboundEvent>> {
    let payload = instagram::parse(body)?;
    Ok(instagram::normalize(&payload))
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<String> {
    verify_for(&state, ChannelType::Instagram, &query).await
}

pub async fn event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    receive_for(&state, ChannelType::Instagram, &headers, &body).await
}
