use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::api::{ApiResponse, Message, Update};
use crate::commands::{parse_command, AgentCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed,
    Cancelled,
    TimedOut,
}

/// Something the operator chat produced: a command for the agent, or a
/// regular message to feed the signal pipeline.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Command(AgentCommand),
    Signal { source_id: String, text: String },
}

/// Telegram-backed operator channel: confirmation prompts, lifecycle
/// notifications and inbound commands. A blank token disables sending
/// (useful in tests), matching how the other notifiers degrade.
pub struct TelegramNotifier {
    client: Client,
    token: String,
    chat_id: i64,
    /// getUpdates cursor; shared between confirmation waits and the
    /// command poller so updates are consumed exactly once.
    offset: Mutex<i64>,
    /// Chat messages read while a confirmation wait held the cursor.
    /// They are replayed by the next `poll_inbound` call, so nothing the
    /// operator sent during the wait is lost.
    stashed: std::sync::Mutex<Vec<Update>>,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: i64) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(40)).build()?,
            token,
            chat_id,
            offset: Mutex::new(0),
            stashed: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    pub fn enabled(&self) -> bool {
        !self.token.is_empty()
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        if !self.enabled() {
            tracing::debug!("Telegram not configured, skipping notification");
            return Ok(());
        }

        let payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });

        let response: ApiResponse<Message> = self
            .client
            .post(self.url("sendMessage"))
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        if !response.ok {
            return Err(anyhow!(
                "Telegram sendMessage failed: {}",
                response.description.unwrap_or_default()
            ));
        }
        Ok(())
    }

    /// Post the decision prompt with Execute/Cancel buttons and wait for
    /// the operator's answer. No answer inside `timeout` is a rejection;
    /// the caller must leave no residual state behind a TimedOut.
    pub async fn request_confirmation(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<ConfirmationOutcome> {
        if !self.enabled() {
            // Unattended mode: without an operator channel nothing can be
            // confirmed, so fail closed.
            return Ok(ConfirmationOutcome::TimedOut);
        }

        let nonce = chrono::Utc::now().timestamp_millis();
        let payload = json!({
            "chat_id": self.chat_id,
            "text": prompt,
            "parse_mode": "Markdown",
            "reply_markup": {
                "inline_keyboard": [[
                    {"text": "Execute", "callback_data": format!("confirm:{nonce}")},
                    {"text": "Cancel", "callback_data": format!("cancel:{nonce}")},
                ]]
            }
        });
        let response: ApiResponse<Message> = self
            .client
            .post(self.url("sendMessage"))
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        if !response.ok {
            return Err(anyhow!(
                "Telegram confirmation prompt failed: {}",
                response.description.unwrap_or_default()
            ));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ConfirmationOutcome::TimedOut);
            }
            let wait = remaining.as_secs().min(5).max(1);
            let updates = self.fetch_updates(wait).await?;
            for update in updates {
                if let Some(cb) = update.callback_query {
                    let data = cb.data.unwrap_or_default();
                    self.answer_callback(&cb.id).await.ok();
                    if data == format!("confirm:{nonce}") {
                        return Ok(ConfirmationOutcome::Confirmed);
                    }
                    if data == format!("cancel:{nonce}") {
                        return Ok(ConfirmationOutcome::Cancelled);
                    }
                } else if update.message.is_some() {
                    // Not ours to handle here: park it for poll_inbound.
                    self.stash_update(update);
                }
            }
        }
    }

    /// Drain pending chat activity. Slash commands become [`AgentCommand`]s;
    /// everything else from the watched chat is a raw signal message for the
    /// ingestion buffer. A short long-poll keeps the caller's loop responsive.
    pub async fn poll_inbound(&self) -> Result<Vec<InboundEvent>> {
        let mut updates = self.drain_stashed();
        if self.enabled() {
            updates.extend(self.fetch_updates(1).await?);
        }
        Ok(updates
            .into_iter()
            .filter_map(|u| u.message)
            .filter_map(|m| inbound_event(self.chat_id, m))
            .collect())
    }

    fn stash_update(&self, update: Update) {
        if let Ok(mut stashed) = self.stashed.lock() {
            stashed.push(update);
        }
    }

    fn drain_stashed(&self) -> Vec<Update> {
        self.stashed
            .lock()
            .map(|mut stashed| std::mem::take(&mut *stashed))
            .unwrap_or_default()
    }

    async fn fetch_updates(&self, wait_secs: u64) -> Result<Vec<Update>> {
        let mut offset = self.offset.lock().await;
        let payload = json!({
            "offset": *offset,
            "timeout": wait_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        let response: ApiResponse<Vec<Update>> = self
            .client
            .post(self.url("getUpdates"))
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        let updates = response.result.unwrap_or_default();
        if let Some(last) = updates.last() {
            *offset = last.update_id + 1;
        }
        Ok(updates)
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        self.client
            .post(self.url("answerCallbackQuery"))
            .json(&json!({"callback_query_id": callback_id}))
            .send()
            .await?;
        Ok(())
    }
}

/// Classify one chat message from the watched chat. Slash commands become
/// [`AgentCommand`]s; anything else is signal text attributed to its
/// sender. Messages from other chats are dropped.
fn inbound_event(chat_id: i64, message: Message) -> Option<InboundEvent> {
    if message.chat.id != chat_id {
        return None;
    }
    let text = message.text?;
    if let Some(command) = parse_command(&text) {
        return Some(InboundEvent::Command(command));
    }
    let source_id = message
        .from
        .map(|u| u.username.unwrap_or_else(|| u.id.to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    Some(InboundEvent::Signal { source_id, text })
}
