//! Per-conversation live updates for widget streams.
//!
//! The hub is constructed once and owned by the application state. Each SSE
//! connection holds a [`Subscription`]; dropping the last one for a
//! conversation removes its sender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::Message;

const TOPIC_CAPACITY: usize = 64;

type Topics = Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>;

#[derive(Clone, Default)]
pub struct RealtimeHub {
    topics: Topics,
}

fn lock(topics: &Topics) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Message>>> {
    topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        let mut topics = lock(&self.topics);
        let receiver = topics
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();
        Subscription {
            conversation_id: conversation_id.to_string(),
            receiver,
            topics: self.topics.clone(),
        }
    }

    /// Number of subscribers the message reached.
    pub fn publish(&self, message: &Message) -> usize {
        let topics = lock(&self.topics);
        topics
            .get(&message.conversation_id)
            .and_then(|sender| sender.send(message.clone()).ok())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }
}

pub struct Subscription {
    conversation_id: String,
    receiver: broadcast::Receiver<Message>,
    topics: Topics,
}

impl Subscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next message, skipping over anything lost to lag.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(conversation_id = %self.conversation_id, skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = lock(&self.topics);
        // This receiver is still alive here, so one means "last one".
        let last = topics
            .get(&self.conversation_id)
            .map(|sender| sender.receiver_count() <= 1)
            .unwrap_or(false);
        if last {
            topics.remove(&self.conversation_id);
            debug!(conversation_id = %self.conversation_id, "released realtime topic");
        }
    }
}
