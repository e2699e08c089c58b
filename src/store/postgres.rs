use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

use super::Store;
use crate::error::{AppError, Result};
use crate::types::{
    Channel, ChannelType, Contact, Conversation, Message, MessageStatus, ProviderFamily,
};

const STATUS_RANK: &str = "CASE status WHEN 'read' THEN 2 WHEN 'delivered' THEN 1 ELSE 0 END";
const TARGET_RANK: &str = "CASE $3 WHEN 'read' THEN 2 WHEN 'delivered' THEN 1 ELSE 0 END";

const CHANNEL_COLUMNS: &str = "id, channel_type, name, status, config, created_at, updated_at";
const CONTACT_COLUMNS: &str =
    "id, name, email, phone, psid, igsid, visitor_id, last_interaction_at, created_at";
const CONVERSATION_COLUMNS: &str =
    "id, contact_id, channel_id, channel, status, last_message_at, created_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, body, message_type, sender_type, sender_id, \
     provider, external_id, status, media_url, media_mime, media_size, media_name, metadata, created_at";

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

fn parse_column<T: FromStr<Err = String>>(row: &PgRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(AppError::Internal)
}

fn parse_channel_row(row: PgRow) -> Result<Channel> {
    Ok(Channel {
        id: row.try_get("id")?,
        channel_type: parse_column(&row, "channel_type")?,
        name: row.try_get("name")?,
        status: parse_column(&row, "status")?,
        config: row.try_get::<Json<Value>, _>("config")?.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_contact_row(row: PgRow) -> Result<Contact> {
    Ok(Contact {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        psid: row.try_get("psid")?,
        igsid: row.try_get("igsid")?,
        visitor_id: row.try_get("visitor_id")?,
        last_interaction_at: row.try_get("last_interaction_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_conversation_row(row: PgRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        contact_id: row.try_get("contact_id")?,
        channel_id: row.try_get("channel_id")?,
        channel: parse_column(&row, "channel")?,
        status: parse_column(&row, "status")?,
        last_message_at: row.try_get("last_message_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_message_row(row: PgRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        body: row.try_get("body")?,
        message_type: parse_column(&row, "message_type")?,
        sender_type: parse_column(&row, "sender_type")?,
        sender_id: row.try_get("sender_id")?,
        provider: row.try_get("provider")?,
        external_id: row.try_get("external_id")?,
        status: parse_column(&row, "status")?,
        media_url: row.try_get("media_url")?,
        media_mime: row.try_get("media_mime")?,
        media_size: row.try_get("media_size")?,
        media_name: row.try_get("media_name")?,
        metadata: row.try_get::<Json<Value>, _>("metadata")?.0,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn active_channel_by_type(&self, channel_type: ChannelType) -> Result<Option<Channel>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels \
             WHERE channel_type = $1 AND status = 'active' \
             ORDER BY updated_at DESC, id ASC LIMIT 1"
        ))
        .bind(channel_type.as_str())
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_channel_row).transpose()
    }

    async fn channel_by_id(&self, channel_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"
        ))
        .bind(channel_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_channel_row).transpose()
    }

    async fn channel_by_widget_token(&self, token: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels \
             WHERE channel_type = 'widget' AND status = 'active' AND config->>'widgetToken' = $1 \
             ORDER BY updated_at DESC, id ASC LIMIT 1"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_channel_row).transpose()
    }

    async fn find_contact(
        &self,
        family: ProviderFamily,
        external_id: &str,
    ) -> Result<Option<Contact>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE {} = $1 LIMIT 1",
            family.contact_column()
        ))
        .bind(external_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_contact_row).transpose()
    }

    async fn insert_contact(&self, contact: &Contact, family: ProviderFamily) -> Result<Contact> {
        let column = family.contact_column();
        let inserted = sqlx::query(&format!(
            "INSERT INTO contacts ({CONTACT_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
             ON CONFLICT ({column}) DO NOTHING \
             RETURNING {CONTACT_COLUMNS}"
        ))
        .bind(&contact.id)
        .bind(&contact.name)
        .bind(&contact.email)
        .bind(&contact.phone)
        .bind(&contact.psid)
        .bind(&contact.igsid)
        .bind(&contact.visitor_id)
        .bind(contact.last_interaction_at)
        .bind(contact.created_at)
        .fetch_optional(&self.db)
        .await?;
        if let Some(row) = inserted {
            return parse_contact_row(row);
        }

        let external_id = contact.external_id(family).unwrap_or_default();
        self.find_contact(family, external_id).await?.ok_or_else(|| {
            AppError::Internal(format!("contact {family}:{external_id} vanished after conflict"))
        })
    }

    async fn touch_contact(
        &self,
        contact_id: &str,
        name: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE contacts SET last_interaction_at = $1, name = COALESCE($2, name) WHERE id = $3",
        )
        .bind(at)
        .bind(name)
        .bind(contact_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find_open_conversation(
        &self,
        contact_id: &str,
        channel: ChannelType,
        channel_id: Option<&str>,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE contact_id = $1 AND channel = $2 AND status = 'open' \
               AND ($3::text IS NULL OR channel_id = $3) \
             ORDER BY last_message_at DESC LIMIT 1"
        ))
        .bind(contact_id)
        .bind(channel.as_str())
        .bind(channel_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_conversation_row).transpose()
    }

    async fn create_or_get_open_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO conversations ({CONVERSATION_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) \
             ON CONFLICT (contact_id, channel) WHERE status = 'open' DO NOTHING \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(&conversation.id)
        .bind(&conversation.contact_id)
        .bind(&conversation.channel_id)
        .bind(conversation.channel.as_str())
        .bind(conversation.status.as_str())
        .bind(conversation.last_message_at)
        .bind(conversation.created_at)
        .fetch_optional(&self.db)
        .await?;
        if let Some(row) = inserted {
            return parse_conversation_row(row);
        }

        self.find_open_conversation(&conversation.contact_id, conversation.channel, None)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "open conversation for contact {} vanished after conflict",
                    conversation.contact_id
                ))
            })
    }

    async fn conversation_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_conversation_row).transpose()
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE conversations SET last_message_at = $1 WHERE id = $2")
            .bind(at)
            .bind(conversation_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn last_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at DESC, seq DESC LIMIT 1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_message_row).transpose()
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT * FROM messages WHERE conversation_id = $1 \
                 ORDER BY created_at DESC, seq DESC LIMIT $2 \
             ) recent ORDER BY created_at ASC, seq ASC"
        ))
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(parse_message_row).collect()
    }

    async fn insert_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15) \
             ON CONFLICT (provider, external_id) WHERE external_id IS NOT NULL DO NOTHING"
        ))
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.body)
        .bind(message.message_type.as_str())
        .bind(message.sender_type.as_str())
        .bind(&message.sender_id)
        .bind(&message.provider)
        .bind(&message.external_id)
        .bind(message.status.as_str())
        .bind(&message.media_url)
        .bind(&message.media_mime)
        .bind(message.media_size)
        .bind(&message.media_name)
        .bind(Json(&message.metadata))
        .bind(message.created_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_status(
        &self,
        provider: &str,
        external_ids: &[String],
        status: MessageStatus,
    ) -> Result<u64> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&format!(
            "UPDATE messages SET status = $3 \
             WHERE provider = $1 AND external_id = ANY($2) \
             AND {STATUS_RANK} < {TARGET_RANK}"
        ))
        .bind(provider)
        .bind(external_ids)
        .bind(status.as_str())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_read(
        &self,
        provider: &str,
        sender_id: &str,
        watermark: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'read' \
             WHERE provider = $1 AND sender_id = $2 AND created_at <= $3 AND status <> 'read'",
        )
        .bind(provider)
        .bind(sender_id)
        .bind(watermark)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
