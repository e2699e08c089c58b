use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::Store;
use crate::error::Result;
use crate::types::{
    Channel, ChannelType, Contact, Conversation, ConversationStatus, Message, MessageStatus,
    ProviderFamily,
};

#[derive(Default)]
struct Tables {
    channels: Vec<Channel>,
    contacts: Vec<Contact>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
}

/// In-process store. Each call holds one lock, so find-or-create is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_channel(&self, channel: Channel) {
        self.tables.lock().await.channels.push(channel);
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.tables.lock().await.contacts.clone()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.tables.lock().await.conversations.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.tables.lock().await.messages.clone()
    }
}

fn conversation_matches(
    conversation: &Conversation,
    contact_id: &str,
    channel: ChannelType,
    channel_id: Option<&str>,
) -> bool {
    conversation.contact_id == contact_id
        && conversation.channel == channel
        && conversation.status == ConversationStatus::Open
        && channel_id
            .map(|id| conversation.channel_id.as_deref() == Some(id))
            .unwrap_or(true)
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_channel_by_type(&self, channel_type: ChannelType) -> Result<Option<Channel>> {
        let tables = self.tables.lock().await;
        let mut active = tables
            .channels
            .iter()
            .filter(|c| c.channel_type == channel_type && c.is_active())
            .collect::<Vec<_>>();
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(active.first().map(|c| (*c).clone()))
    }

    async fn channel_by_id(&self, channel_id: &str) -> Result<Option<Channel>> {
        let tables = self.tables.lock().await;
        Ok(tables.channels.iter().find(|c| c.id == channel_id).cloned())
    }

    async fn channel_by_widget_token(&self, token: &str) -> Result<Option<Channel>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .channels
            .iter()
            .find(|c| {
                c.channel_type == ChannelType::Widget
                    && c.is_active()
                    && c.config_text("widgetToken") == token
            })
            .cloned())
    }

    async fn find_contact(
        &self,
        family: ProviderFamily,
        external_id: &str,
    ) -> Result<Option<Contact>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .contacts
            .iter()
            .find(|c| c.external_id(family) == Some(external_id))
            .cloned())
    }

    async fn insert_contact(&self, contact: &Contact, family: ProviderFamily) -> Result<Contact> {
        let mut tables = self.tables.lock().await;
        let external_id = contact.external_id(family);
        if let Some(existing) = tables
            .contacts
            .iter()
            .find(|c| external_id.is_some() && c.external_id(family) == external_id)
        {
            return Ok(existing.clone());
        }
        tables.contacts.push(contact.clone());
        Ok(contact.clone())
    }

    async fn touch_contact(
        &self,
        contact_id: &str,
        name: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(contact) = tables.contacts.iter_mut().find(|c| c.id == contact_id) {
            contact.last_interaction_at = at;
            if let Some(name) = name {
                contact.name = Some(name.to_string());
            }
        }
        Ok(())
    }

    async fn find_open_conversation(
        &self,
        contact_id: &str,
        channel: ChannelType,
        channel_id: Option<&str>,
    ) -> Result<Option<Conversation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .conversations
            .iter()
            .find(|c| conversation_matches(c, contact_id, channel, channel_id))
            .cloned())
    }

    async fn create_or_get_open_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.conversations.iter().find(|c| {
            conversation_matches(c, &conversation.contact_id, conversation.channel, None)
        }) {
            return Ok(existing.clone());
        }
        tables.conversations.push(conversation.clone());
        Ok(conversation.clone())
    }

    async fn conversation_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned())
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(conversation) = tables
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.last_message_at = at;
        }
        Ok(())
    }

    async fn last_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        let tables = self.tables.lock().await;
        // Insertion order breaks created_at ties, matching the id-stable sort in SQL.
        Ok(tables
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.conversation_id == conversation_id)
            .max_by(|(ia, a), (ib, b)| a.created_at.cmp(&b.created_at).then(ia.cmp(ib)))
            .map(|(_, m)| m.clone()))
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let tables = self.tables.lock().await;
        let mut messages = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let start = messages.len().saturating_sub(limit);
        Ok(messages.split_off(start))
    }

    async fn insert_message(&self, message: &Message) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        if let (Some(provider), Some(external_id)) = (&message.provider, &message.external_id) {
            let duplicate = tables.messages.iter().any(|m| {
                m.provider.as_ref() == Some(provider) && m.external_id.as_ref() == Some(external_id)
            });
            if duplicate {
                return Ok(false);
            }
        }
        tables.messages.push(message.clone());
        Ok(true)
    }

    async fn advance_status(
        &self,
        provider: &str,
        external_ids: &[String],
        status: MessageStatus,
    ) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut updated = 0;
        for message in tables.messages.iter_mut() {
            let matches = message.provider.as_deref() == Some(provider)
                && message
                    .external_id
                    .as_ref()
                    .map(|id| external_ids.contains(id))
                    .unwrap_or(false);
            if matches && message.status < status {
                message.status = status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_read(
        &self,
        provider: &str,
        sender_id: &str,
        watermark: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut updated = 0;
        for message in tables.messages.iter_mut() {
            if message.provider.as_deref() == Some(provider)
                && message.sender_id == sender_id
                && message.created_at <= watermark
                && message.status < MessageStatus::Read
            {
                message.status = MessageStatus::Read;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SenderType;
    use chrono::Duration;

    fn inbound(external_id: &str) -> Message {
        let mut message = Message::text("conv-1", SenderType::User, "psid-1", "hola");
        message.provider = Some("messenger".into());
        message.external_id = Some(external_id.into());
        message
    }

    #[tokio::test]
    async fn duplicate_external_id_is_not_inserted_twice() {
        let store = MemoryStore::new();

        assert!(store.insert_message(&inbound("m-1")).await.unwrap());
        assert!(!store.insert_message(&inbound("m-1")).await.unwrap());
        assert_eq!(store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn delivery_never_downgrades_read() {
        let store = MemoryStore::new();
        store.insert_message(&inbound("m-1")).await.unwrap();
        let ids = vec!["m-1".to_string()];

        store
            .advance_status("messenger", &ids, MessageStatus::Read)
            .await
            .unwrap();
        let updated = store
            .advance_status("messenger", &ids, MessageStatus::Delivered)
            .await
            .unwrap();

        assert_eq!(updated, 0);
        assert_eq!(store.messages().await[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn read_watermark_is_inclusive_and_per_sender() {
        let store = MemoryStore::new();
        let early = inbound("m-1");
        let watermark = early.created_at;
        let mut late = inbound("m-2");
        late.created_at = watermark + Duration::seconds(5);
        let mut other = inbound("m-3");
        other.sender_id = "psid-2".into();
        other.created_at = watermark;
        let mut visitor = inbound("m-4");
        visitor.provider = Some("widget".into());
        visitor.created_at = watermark;
        for message in [&early, &late, &other, &visitor] {
            store.insert_message(message).await.unwrap();
        }

        assert_eq!(
            store.mark_read("messenger", "psid-1", watermark).await.unwrap(),
            1
        );

        let statuses = store
            .messages()
            .await
            .into_iter()
            .map(|m| (m.external_id.unwrap_or_default(), m.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("m-1".to_string(), MessageStatus::Read),
                ("m-2".to_string(), MessageStatus::Sent),
                ("m-3".to_string(), MessageStatus::Sent),
                ("m-4".to_string(), MessageStatus::Sent),
            ]
        );
    }

    #[tokio::test]
    async fn recent_messages_are_oldest_first() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for (i, body) in ["uno", "dos", "tres"].into_iter().enumerate() {
            let mut message = Message::text("conv-1", SenderType::User, "psid-1", body);
            message.created_at = base + Duration::seconds(i as i64);
            store.insert_message(&message).await.unwrap();
        }

        let recent = store.recent_messages("conv-1", 2).await.unwrap();
        let bodies = recent
            .iter()
            .filter_map(|m| m.body.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec!["dos", "tres"]);
        let last = store.last_message("conv-1").await.unwrap().unwrap();
        assert_eq!(last.body.as_deref(), Some("tres"));
    }
}
