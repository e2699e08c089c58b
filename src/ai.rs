//! Automated replies: when to answer, and the detached task that answers.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::graph::MessageSender;
use crate::prompting::{render_auto_reply_prompt, AutoReplyPromptContext};
use crate::realtime::RealtimeHub;
use crate::store::Store;
use crate::types::{Channel, Message, ProviderFamily, SenderType};

pub const BOT_SENDER_ID: &str = "bot";
const HISTORY_LIMIT: usize = 14;

/// Decision on the conversation as it was before the new inbound message.
///
/// A human agent having spoken last silences the bot; anything else (no
/// history, the visitor, or the bot itself) lets it answer.
pub fn should_auto_reply(ai_enabled: bool, prior: Option<&Message>) -> bool {
    if !ai_enabled {
        return false;
    }
    match prior {
        None => true,
        Some(message) => message.sender_type != SenderType::Agent,
    }
}

pub struct HandoffPolicy;

impl HandoffPolicy {
    /// Must run before the inbound message is inserted.
    pub async fn evaluate(store: &dyn Store, channel: &Channel, conversation_id: &str) -> Result<bool> {
        if !channel.ai_enabled() {
            return Ok(false);
        }
        let prior = store.last_message(conversation_id).await?;
        Ok(should_auto_reply(true, prior.as_ref()))
    }
}

static HANDOVER_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(human|humano|humana|agent|agente|asesor|asesora|operator|operador|operadora|representative|representante|real person|persona real)\b",
    )
    .expect("handover pattern compiles")
});

/// The visitor is asking for a person instead of the bot.
pub fn has_handover_intent(text: &str) -> bool {
    HANDOVER_INTENT.is_match(text)
}

#[async_trait]
pub trait AiResponder: Send + Sync {
    /// Reply text for the conversation so far, oldest message first.
    async fn reply(&self, system_prompt: &str, history: &[Message]) -> Result<String>;
}

pub struct OpenAiResponder {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiResponder {
    pub fn new(http: Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
        }
    }
}

fn chat_messages(system_prompt: &str, history: &[Message]) -> Vec<Value> {
    let mut messages = vec![json!({ "role": "system", "content": system_prompt })];
    messages.extend(history.iter().filter_map(|message| {
        let content = message.body.as_deref()?.trim();
        if content.is_empty() {
            return None;
        }
        let role = match message.sender_type {
            SenderType::User => "user",
            SenderType::Agent | SenderType::Bot => "assistant",
        };
        Some(json!({ "role": role, "content": content }))
    }));
    messages
}

#[async_trait]
impl AiResponder for OpenAiResponder {
    async fn reply(&self, system_prompt: &str, history: &[Message]) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AppError::Upstream("OPENAI_API_KEY not configured".into()));
        }
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": chat_messages(system_prompt, history),
                "temperature": 0.3
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!("openai returned {status}: {body}")));
        }
        let payload = response.json::<Value>().await?;
        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(AppError::Upstream("openai response had empty content".into()));
        }
        Ok(text)
    }
}

/// Collaborators the reply task needs, cloned into it.
#[derive(Clone)]
pub struct AutoReplyDeps {
    pub store: Arc<dyn Store>,
    pub ai: Arc<dyn AiResponder>,
    pub sender: Arc<dyn MessageSender>,
    pub realtime: RealtimeHub,
}

#[derive(Debug, Clone)]
pub struct AutoReplyJob {
    pub channel: Channel,
    /// Family of the inbound event; decides the send route and the stored provider.
    pub provider: ProviderFamily,
    pub conversation_id: String,
    /// Provider id to send the reply to; unused for the widget.
    pub recipient_id: String,
}

/// Runs the reply on its own task. The caller never awaits it; failures are
/// logged and go nowhere else.
pub fn dispatch_auto_reply(deps: AutoReplyDeps, job: AutoReplyJob) -> JoinHandle<()> {
    tokio::spawn(async move {
        match run_auto_reply(&deps, &job).await {
            Ok(message) => info!(
                conversation_id = %job.conversation_id,
                message_id = %message.id,
                "auto reply stored"
            ),
            Err(err) => warn!(
                conversation_id = %job.conversation_id,
                channel_id = %job.channel.id,
                error = %err,
                "auto reply failed"
            ),
        }
    })
}

async fn run_auto_reply(deps: &AutoReplyDeps, job: &AutoReplyJob) -> Result<Message> {
    let channel = &job.channel;
    let history = deps
        .store
        .recent_messages(&job.conversation_id, HISTORY_LIMIT)
        .await?;
    let bot_name = channel.config_text("botName");
    let instructions = channel.config_text("aiPrompt");
    let prompt = render_auto_reply_prompt(&AutoReplyPromptContext {
        bot_name: &bot_name,
        channel_name: &channel.name,
        channel_type: channel.channel_type.as_str(),
        instructions: &instructions,
    });
    let text = deps.ai.reply(&prompt, &history).await?;

    let mut message = Message::text(&job.conversation_id, SenderType::Bot, BOT_SENDER_ID, &text);
    if job.provider != ProviderFamily::Widget {
        message.provider = Some(job.provider.to_string());
        match deps
            .sender
            .send_text(channel, job.provider, &job.recipient_id, &text)
            .await
        {
            Ok(external_id) => message.external_id = external_id,
            Err(err) => {
                warn!(channel_id = %channel.id, error = %err, "auto reply send failed");
                message.metadata = json!({ "send_error": err.to_string() });
            }
        }
    }

    deps.store.insert_message(&message).await?;
    deps.store
        .touch_conversation(&job.conversation_id, message.created_at)
        .await?;
    let reached = deps.realtime.publish(&message);
    debug!(conversation_id = %job.conversation_id, reached, "published auto reply");
    Ok(message)
}
