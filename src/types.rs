use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Whatsapp,
    Messenger,
    Instagram,
    Facebook,
    Widget,
}

string_enum!(ChannelType {
    Whatsapp => "whatsapp",
    Messenger => "messenger",
    Instagram => "instagram",
    Facebook => "facebook",
    Widget => "widget",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Inactive,
}

string_enum!(ChannelStatus {
    Active => "active",
    Inactive => "inactive",
});

/// Namespace of a contact's external identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Whatsapp,
    Messenger,
    Instagram,
    Widget,
}

string_enum!(ProviderFamily {
    Whatsapp => "whatsapp",
    Messenger => "messenger",
    Instagram => "instagram",
    Widget => "widget",
});

impl ProviderFamily {
    /// Contact column holding this family's external identifier.
    pub fn contact_column(&self) -> &'static str {
        match self {
            Self::Whatsapp => "phone",
            Self::Messenger => "psid",
            Self::Instagram => "igsid",
            Self::Widget => "visitor_id",
        }
    }
}

impl ChannelType {
    pub fn family(&self) -> ProviderFamily {
        match self {
            Self::Whatsapp => ProviderFamily::Whatsapp,
            Self::Messenger | Self::Facebook => ProviderFamily::Messenger,
            Self::Instagram => ProviderFamily::Instagram,
            Self::Widget => ProviderFamily::Widget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Closed,
}

string_enum!(ConversationStatus {
    Open => "open",
    Closed => "closed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Video,
    File,
    Document,
    Postback,
}

string_enum!(MessageType {
    Text => "text",
    Image => "image",
    Audio => "audio",
    Video => "video",
    File => "file",
    Document => "document",
    Postback => "postback",
});

impl MessageType {
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Audio | Self::Video | Self::File | Self::Document
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Agent,
    Bot,
}

string_enum!(SenderType {
    User => "user",
    Agent => "agent",
    Bot => "bot",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

string_enum!(MessageStatus {
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub channel_type: ChannelType,
    pub name: String,
    pub status: ChannelStatus,
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn config_text(&self, key: &str) -> String {
        config_text(&self.config, key)
    }

    pub fn ai_enabled(&self) -> bool {
        self.config
            .get("aiEnabled")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Active
    }
}

pub fn config_text(config: &Value, key: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub psid: Option<String>,
    pub igsid: Option<String>,
    pub visitor_id: Option<String>,
    pub last_interaction_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(family: ProviderFamily, external_id: &str, name: Option<String>) -> Self {
        let now = Utc::now();
        let mut contact = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            email: None,
            phone: None,
            psid: None,
            igsid: None,
            visitor_id: None,
            last_interaction_at: now,
            created_at: now,
        };
        *contact.external_id_mut(family) = Some(external_id.to_string());
        contact
    }

    pub fn external_id(&self, family: ProviderFamily) -> Option<&str> {
        match family {
            ProviderFamily::Whatsapp => self.phone.as_deref(),
            ProviderFamily::Messenger => self.psid.as_deref(),
            ProviderFamily::Instagram => self.igsid.as_deref(),
            ProviderFamily::Widget => self.visitor_id.as_deref(),
        }
    }

    fn external_id_mut(&mut self, family: ProviderFamily) -> &mut Option<String> {
        match family {
            ProviderFamily::Whatsapp => &mut self.phone,
            ProviderFamily::Messenger => &mut self.psid,
            ProviderFamily::Instagram => &mut self.igsid,
            ProviderFamily::Widget => &mut self.visitor_id,
        }
    }

    pub fn has_name(&self) -> bool {
        self.name
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub channel_id: Option<String>,
    pub channel: ChannelType,
    pub status: ConversationStatus,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn open(contact_id: &str, channel: ChannelType, channel_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            contact_id: contact_id.to_string(),
            channel_id: channel_id.map(str::to_string),
            channel,
            status: ConversationStatus::Open,
            last_message_at: now,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub body: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_type: SenderType,
    pub sender_id: String,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    pub status: MessageStatus,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub media_size: Option<i64>,
    pub media_name: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn text(
        conversation_id: &str,
        sender_type: SenderType,
        sender_id: &str,
        body: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            body: Some(body.to_string()),
            message_type: MessageType::Text,
            sender_type,
            sender_id: sender_id.to_string(),
            provider: None,
            external_id: None,
            status: MessageStatus::Sent,
            media_url: None,
            media_mime: None,
            media_size: None,
            media_name: None,
            metadata: Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_text() {
        assert_eq!("facebook".parse::<ChannelType>(), Ok(ChannelType::Facebook));
        assert_eq!(MessageType::Postback.as_str(), "postback");
        assert!("sms".parse::<ChannelType>().is_err());
    }

    #[test]
    fn facebook_channels_share_the_messenger_family() {
        assert_eq!(ChannelType::Facebook.family(), ProviderFamily::Messenger);
        assert_eq!(ProviderFamily::Instagram.contact_column(), "igsid");
    }

    #[test]
    fn message_status_is_ordered_forward() {
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
    }

    #[test]
    fn new_contact_sets_the_family_identifier() {
        let contact = Contact::new(ProviderFamily::Whatsapp, "51999888777", None);
        assert_eq!(contact.phone.as_deref(), Some("51999888777"));
        assert_eq!(contact.external_id(ProviderFamily::Whatsapp), Some("51999888777"));
        assert!(contact.psid.is_none());
        assert!(!contact.has_name());
    }
}
