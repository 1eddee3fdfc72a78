//! Telegram Bot API event source.
//!
//! Live events come from `getUpdates` long polling. The Bot API offers no
//! chat history, so this source has nothing to backfill.

use crate::config::Config;
use crate::error::SourceError;
use crate::listener::{ChatInfo, EventSource, RawEvent, SenderIdentity};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_TIMEOUT_SECS: u64 = 30;
const ALLOWED_UPDATES: &str = r#"["message","channel_post"]"#;

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, SourceError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(SourceError::Rejected(
                self.description
                    .unwrap_or_else(|| "no description".to_string()),
            )),
        }
    }
}

#[derive(Deserialize)]
struct BotUser {
    username: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TgMessage>,
    channel_post: Option<TgMessage>,
}

#[derive(Deserialize)]
struct TgMessage {
    message_id: i64,
    date: i64,
    chat: TgChat,
    from: Option<TgUser>,
    sender_chat: Option<TgChat>,
    text: Option<String>,
    caption: Option<String>,
}

#[derive(Deserialize)]
struct TgChat {
    id: i64,
    title: Option<String>,
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Deserialize)]
struct TgUser {
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

impl TgChat {
    /// Private chats have no title; fall back to the peer's name.
    fn into_info(self) -> ChatInfo {
        let name = [self.first_name, self.last_name]
            .into_iter()
            .flatten()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        ChatInfo {
            id: self.id,
            title: self.title.or((!name.is_empty()).then_some(name)),
            username: self.username,
        }
    }
}

impl TgMessage {
    fn into_event(self) -> Result<RawEvent, SourceError> {
        let date = Utc
            .timestamp_opt(self.date, 0)
            .single()
            .ok_or_else(|| SourceError::Decode(format!("invalid date {}", self.date)))?;

        let sender = match (self.from, self.sender_chat) {
            (_, Some(sender_chat)) => SenderIdentity::Channel {
                title: sender_chat.title,
            },
            (Some(user), None) => SenderIdentity::User {
                username: user.username,
                first_name: user.first_name,
                last_name: user.last_name,
            },
            (None, None) => SenderIdentity::Unknown,
        };

        Ok(RawEvent {
            message_id: self.message_id,
            chat: self.chat.into_info(),
            sender,
            text: self.text.or(self.caption),
            date,
        })
    }
}

pub struct BotApiSource {
    http: reqwest::Client,
    base_url: String,
    retry_delay: Duration,
    monitor_peer: Option<String>,
}

impl BotApiSource {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!(
                "{}/bot{}",
                config.telegram_api_url.trim_end_matches('/'),
                config.telegram_bot_token
            ),
            retry_delay: config.connect_retry_delay,
            monitor_peer: config.monitor_peer.clone(),
        }
    }
}

#[async_trait]
impl EventSource for BotApiSource {
    async fn connect(&self) -> Result<(), SourceError> {
        let me: BotUser = self
            .http
            .get(format!("{}/getMe", self.base_url))
            .send()
            .await
            .map_err(|e| SourceError::Connect(e.without_url().to_string()))?
            .json::<ApiResponse<BotUser>>()
            .await?
            .into_result()
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        info!(
            "Telegram: Authorized as @{}",
            me.username.as_deref().unwrap_or("unknown")
        );
        info!(
            "Telegram: Monitoring chats the bot is a member of (peer filter: {})",
            self.monitor_peer.as_deref().unwrap_or("none")
        );
        Ok(())
    }

    async fn conversations(&self) -> Result<Vec<ChatInfo>, SourceError> {
        debug!("Telegram: Bot API has no dialog list, skipping backfill");
        Ok(Vec::new())
    }

    async fn backfill(
        &self,
        _conversation: &ChatInfo,
        _limit: usize,
    ) -> Result<Vec<RawEvent>, SourceError> {
        Ok(Vec::new())
    }

    fn subscribe(&self) -> BoxStream<'static, Result<RawEvent, SourceError>> {
        let poller = Poller {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            retry_delay: self.retry_delay,
            offset: None,
            buffered: VecDeque::new(),
        };

        stream::unfold(poller, |mut poller| async move {
            loop {
                if let Some(item) = poller.buffered.pop_front() {
                    return Some((item, poller));
                }
                if let Err(e) = poller.poll().await {
                    tokio::time::sleep(poller.retry_delay).await;
                    return Some((Err(e), poller));
                }
            }
        })
        .boxed()
    }

    async fn disconnect(&self) {
        info!("Telegram: Stopped polling");
    }
}

struct Poller {
    http: reqwest::Client,
    base_url: String,
    retry_delay: Duration,
    offset: Option<i64>,
    buffered: VecDeque<Result<RawEvent, SourceError>>,
}

impl Poller {
    /// One long poll; confirmed updates are acknowledged via the next offset.
    async fn poll(&mut self) -> Result<(), SourceError> {
        let mut query = vec![
            ("timeout", POLL_TIMEOUT_SECS.to_string()),
            ("allowed_updates", ALLOWED_UPDATES.to_string()),
        ];
        if let Some(offset) = self.offset {
            query.push(("offset", offset.to_string()));
        }

        let updates: Vec<Update> = self
            .http
            .get(format!("{}/getUpdates", self.base_url))
            .query(&query)
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await
            .map_err(reqwest::Error::without_url)?
            .json::<ApiResponse<Vec<Update>>>()
            .await?
            .into_result()?;

        for update in updates {
            self.offset = Some(update.update_id + 1);
            match update.message.or(update.channel_post) {
                Some(message) => self.buffered.push_back(message.into_event()),
                None => warn!("Telegram: Update {} carries no message", update.update_id),
            }
        }
        Ok(())
    }
}
