//! Relational store seam.
//!
//! All ingestion components talk to storage through [`Store`]. Production uses
//! [`PgStore`]; [`MemoryStore`] backs tests and `STORE=memory` local runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Channel, ChannelType, Contact, Conversation, Message, MessageStatus, ProviderFamily,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// First active channel of a type, most recently updated first.
    async fn active_channel_by_type(&self, channel_type: ChannelType) -> Result<Option<Channel>>;

    async fn channel_by_id(&self, channel_id: &str) -> Result<Option<Channel>>;

    /// Active widget channel whose `widgetToken` config matches.
    async fn channel_by_widget_token(&self, token: &str) -> Result<Option<Channel>>;

    async fn find_contact(
        &self,
        family: ProviderFamily,
        external_id: &str,
    ) -> Result<Option<Contact>>;

    /// Inserts `contact`, or returns the row that already owns its external id.
    async fn insert_contact(&self, contact: &Contact, family: ProviderFamily) -> Result<Contact>;

    async fn touch_contact(
        &self,
        contact_id: &str,
        name: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_open_conversation(
        &self,
        contact_id: &str,
        channel: ChannelType,
        channel_id: Option<&str>,
    ) -> Result<Option<Conversation>>;

    /// Atomic insert-or-get on the single open conversation per (contact, channel).
    async fn create_or_get_open_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation>;

    async fn conversation_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn last_message(&self, conversation_id: &str) -> Result<Option<Message>>;

    /// Most recent `limit` messages, oldest first.
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Returns false when a message with the same (provider, external_id) exists.
    async fn insert_message(&self, message: &Message) -> Result<bool>;

    /// Moves matching messages to `status` unless they are already at or past it.
    async fn advance_status(
        &self,
        provider: &str,
        external_ids: &[String],
        status: MessageStatus,
    ) -> Result<u64>;

    /// Marks `provider` messages from `sender_id` created at or before the
    /// watermark as read.
    async fn mark_read(
        &self,
        provider: &str,
        sender_id: &str,
        watermark: DateTime<Utc>,
    ) -> Result<u64>;
}
