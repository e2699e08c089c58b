use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::Result;
use crate::store::Store;
use crate::types::{ChannelType, Conversation};

pub struct ConversationResolver {
    store: Arc<dyn Store>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Open conversation for (contact, channel), created on first contact.
    ///
    /// Creation goes through the store's insert-or-get so two racing requests
    /// converge on one row.
    pub async fn find_or_create(
        &self,
        contact_id: &str,
        channel: ChannelType,
        channel_id: Option<&str>,
    ) -> Result<Conversation> {
        if let Some(existing) = self
            .store
            .find_open_conversation(contact_id, channel, channel_id)
            .await?
        {
            return Ok(existing);
        }

        let candidate = Conversation::open(contact_id, channel, channel_id);
        let conversation = self.store.create_or_get_open_conversation(&candidate).await?;
        if conversation.id == candidate.id {
            debug!(contact_id, %channel, conversation_id = %conversation.id, "opened conversation");
        }
        Ok(conversation)
    }

    pub async fn update_last_message(&self, conversation_id: &str) -> Result<()> {
        self.store.touch_conversation(conversation_id, Utc::now()).await
    }
}
