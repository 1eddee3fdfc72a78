//! Capture side of the pipeline.
//!
//! Turns an upstream event source into normalized ledger rows. Events are
//! handled one at a time in arrival order, and the historical backfill for
//! every conversation finishes before the first live event is processed.

use crate::config::Config;
use crate::db::{ledger_timestamp, AppendOutcome, Database, NewMessage};
use crate::error::{SourceError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Text prefix of bot commands; such messages are never captured.
pub const COMMAND_PREFIX: &str = "/";

/// Reply-keyboard labels of the command front-end.
pub const UI_BUTTON_LABELS: [&str; 2] = ["📊 Статус", "📝 Саммаризация"];

/// Who posted a message, as far as the source can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderIdentity {
    User {
        username: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
    },
    Channel {
        title: Option<String>,
    },
    Unknown,
}

/// The conversation an event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatInfo {
    pub id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
}

impl ChatInfo {
    fn label(&self) -> &str {
        non_empty(&self.title)
            .or_else(|| non_empty(&self.username))
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone)]
pub struct RawEvent {
    pub message_id: i64,
    pub chat: ChatInfo,
    pub sender: SenderIdentity,
    /// `None` for non-text events (stickers, joins, media without caption).
    pub text: Option<String>,
    pub date: DateTime<Utc>,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<(), SourceError>;

    /// Conversations to backfill at startup.
    async fn conversations(&self) -> Result<Vec<ChatInfo>, SourceError>;

    /// Up to `limit` most recent messages, newest first.
    async fn backfill(
        &self,
        conversation: &ChatInfo,
        limit: usize,
    ) -> Result<Vec<RawEvent>, SourceError>;

    /// Lazy, unbounded stream of live events across all conversations.
    fn subscribe(&self) -> BoxStream<'static, Result<RawEvent, SourceError>>;

    async fn disconnect(&self);
}

/// Fixed priority: username, then first/last name, then channel title, then
/// the enclosing chat title, then "Unknown".
pub fn resolve_sender(sender: &SenderIdentity, chat: &ChatInfo) -> String {
    let resolved = match sender {
        SenderIdentity::User {
            username,
            first_name,
            last_name,
        } => non_empty(username).map(str::to_string).or_else(|| {
            let parts: Vec<&str> = [non_empty(first_name), non_empty(last_name)]
                .into_iter()
                .flatten()
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        }),
        SenderIdentity::Channel { title } => non_empty(title).map(str::to_string),
        SenderIdentity::Unknown => None,
    };

    resolved
        .or_else(|| non_empty(&chat.title).map(str::to_string))
        .unwrap_or_else(|| "Unknown".to_string())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn strip_at(value: &str) -> &str {
    value.trim().trim_start_matches('@')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OwnMessage,
    Command,
    OtherPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Stored,
    Duplicate,
    Shadowed { stored_chat_id: i64 },
    Skipped(SkipReason),
}

/// Drop rules applied identically to live and backfilled events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    self_identity: Option<String>,
    peer: Option<String>,
}

impl EventFilter {
    pub fn new(self_identity: Option<&str>, peer: Option<&str>) -> Self {
        Self {
            self_identity: self_identity
                .map(strip_at)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            peer: peer
                .map(strip_at)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        }
    }

    pub fn check(&self, sender: &str, text: &str, chat: &ChatInfo) -> Option<SkipReason> {
        if let Some(me) = &self.self_identity {
            if strip_at(sender).eq_ignore_ascii_case(me) {
                return Some(SkipReason::OwnMessage);
            }
        }
        if text.starts_with(COMMAND_PREFIX) || UI_BUTTON_LABELS.contains(&text) {
            return Some(SkipReason::Command);
        }
        if let Some(peer) = &self.peer {
            let by_username = chat
                .username
                .as_deref()
                .is_some_and(|u| strip_at(u).eq_ignore_ascii_case(peer));
            if !by_username && chat.id.to_string() != *peer {
                return Some(SkipReason::OtherPeer);
            }
        }
        None
    }
}

pub struct Listener {
    db: Database,
    filter: EventFilter,
    backfill_limit: usize,
    retry_delay: Duration,
}

impl Listener {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            filter: EventFilter::new(
                config.self_identity.as_deref(),
                config.monitor_peer.as_deref(),
            ),
            backfill_limit: config.backfill_limit,
            retry_delay: config.connect_retry_delay,
        }
    }

    /// Connects, backfills every conversation, then consumes live events until
    /// the stream ends.
    pub async fn run(&self, source: &dyn EventSource) {
        self.connect_with_retry(source).await;
        self.backfill_all(source).await;
        self.listen(source).await;
    }

    /// Never gives up; connection failures only delay startup.
    pub async fn connect_with_retry(&self, source: &dyn EventSource) {
        let mut attempt = 1u32;
        loop {
            match source.connect().await {
                Ok(()) => {
                    info!("Listener: Connected to event source");
                    return;
                }
                Err(e) => {
                    error!(
                        "Listener: Connection attempt {} failed: {}. Retrying in {:?}",
                        attempt, e, self.retry_delay
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    pub async fn backfill_all(&self, source: &dyn EventSource) {
        let conversations = match source.conversations().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Listener: Could not list conversations for backfill: {}", e);
                return;
            }
        };

        for conversation in conversations {
            match self.backfill(source, &conversation).await {
                Ok(stored) => info!(
                    "Listener: Finished history for chat {} ({} new messages)",
                    conversation.id, stored
                ),
                Err(e) => warn!(
                    "Listener: History fetch failed for chat {}: {}",
                    conversation.id, e
                ),
            }
        }
    }

    /// Returns how many backfilled messages were newly stored.
    pub async fn backfill(
        &self,
        source: &dyn EventSource,
        conversation: &ChatInfo,
    ) -> Result<usize, SourceError> {
        info!(
            "Listener: Fetching last {} messages from chat {}",
            self.backfill_limit, conversation.id
        );
        let events = source.backfill(conversation, self.backfill_limit).await?;

        let mut stored = 0usize;
        for event in events {
            if self.process(event).await == Some(Capture::Stored) {
                stored += 1;
            }
        }
        Ok(stored)
    }

    pub async fn listen(&self, source: &dyn EventSource) {
        info!("Listener: Listening for new messages...");
        let mut events = source.subscribe();
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    self.process(event).await;
                }
                Err(e) => warn!("Listener: Event stream error: {}", e),
            }
        }
        info!("Listener: Event stream ended");
    }

    /// Per-event fault isolation: failures are logged, never propagated.
    async fn process(&self, event: RawEvent) -> Option<Capture> {
        let message_id = event.message_id;
        match self.handle_event(event).await {
            Ok(capture) => Some(capture),
            Err(e) => {
                error!("Listener: Failed to store message {}: {}", message_id, e);
                None
            }
        }
    }

    pub async fn handle_event(&self, event: RawEvent) -> Result<Capture, StoreError> {
        let sender = resolve_sender(&event.sender, &event.chat);
        let text = event.text.unwrap_or_default();

        if let Some(reason) = self.filter.check(&sender, &text, &event.chat) {
            debug!(
                "Listener: Skipping message {} in chat {}: {:?}",
                event.message_id, event.chat.id, reason
            );
            return Ok(Capture::Skipped(reason));
        }

        let record = NewMessage {
            id: event.message_id,
            chat_id: event.chat.id,
            sender,
            text,
            date: ledger_timestamp(&event.date),
        };
        let preview: String = record.text.chars().take(80).collect();
        let chat_label = event.chat.label().to_string();
        let (sender, chat_id, id) = (record.sender.clone(), record.chat_id, record.id);

        let outcome = self.db.run_blocking(move |db| db.append(&record)).await?;
        let capture = match outcome {
            AppendOutcome::Inserted => {
                info!("[{}] {}: {}", chat_label, sender, preview);
                Capture::Stored
            }
            AppendOutcome::Duplicate => Capture::Duplicate,
            AppendOutcome::Shadowed { stored_chat_id } => {
                warn!(
                    "Listener: Message id {} from chat {} collides with a stored message from chat {}; dropped",
                    id, chat_id, stored_chat_id
                );
                Capture::Shadowed { stored_chat_id }
            }
        };
        Ok(capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn user(username: Option<&str>, first: Option<&str>, last: Option<&str>) -> SenderIdentity {
        SenderIdentity::User {
            username: username.map(str::to_string),
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
        }
    }

    fn chat(id: i64, title: Option<&str>, username: Option<&str>) -> ChatInfo {
        ChatInfo {
            id,
            title: title.map(str::to_string),
            username: username.map(str::to_string),
        }
    }

    fn event(id: i64, chat_id: i64, text: &str, date: DateTime<Utc>) -> RawEvent {
        RawEvent {
            message_id: id,
            chat: chat(chat_id, Some("Study group"), Some("study_bot")),
            sender: user(Some("alice"), None, None),
            text: Some(text.to_string()),
            date,
        }
    }

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    #[derive(Default)]
    struct FakeSource {
        connect_failures: AtomicU32,
        connect_attempts: AtomicU32,
        conversations: Vec<ChatInfo>,
        history: HashMap<i64, Vec<RawEvent>>,
        live: Mutex<Vec<Result<RawEvent, SourceError>>>,
    }

    #[async_trait]
    impl EventSource for FakeSource {
        async fn connect(&self) -> Result<(), SourceError> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SourceError::Connect("network unreachable".to_string()));
            }
            Ok(())
        }

        async fn conversations(&self) -> Result<Vec<ChatInfo>, SourceError> {
            Ok(self.conversations.clone())
        }

        async fn backfill(
            &self,
            conversation: &ChatInfo,
            limit: usize,
        ) -> Result<Vec<RawEvent>, SourceError> {
            let history = self.history.get(&conversation.id).cloned().unwrap_or_default();
            Ok(history.into_iter().take(limit).collect())
        }

        fn subscribe(&self) -> BoxStream<'static, Result<RawEvent, SourceError>> {
            let items = std::mem::take(&mut *self.live.lock().unwrap());
            stream::iter(items).boxed()
        }

        async fn disconnect(&self) {}
    }

    #[test]
    fn test_sender_resolution_priority() {
        let group = chat(1, Some("Study group"), None);

        assert_eq!(resolve_sender(&user(Some("alice"), Some("Alice"), None), &group), "alice");
        assert_eq!(resolve_sender(&user(None, Some("Alice"), Some("Smith")), &group), "Alice Smith");
        assert_eq!(resolve_sender(&user(Some(""), None, Some("Smith")), &group), "Smith");
        assert_eq!(
            resolve_sender(&SenderIdentity::Channel { title: Some("News".to_string()) }, &group),
            "News"
        );
        assert_eq!(resolve_sender(&user(None, None, None), &group), "Study group");
        assert_eq!(resolve_sender(&SenderIdentity::Unknown, &group), "Study group");
        assert_eq!(resolve_sender(&SenderIdentity::Unknown, &chat(1, None, None)), "Unknown");
    }

    #[test]
    fn test_filter_rules() {
        let group = chat(-100, Some("Study group"), Some("study_bot"));
        let filter = EventFilter::new(Some("@digest_bot"), None);

        assert_eq!(filter.check("digest_bot", "hello", &group), Some(SkipReason::OwnMessage));
        assert_eq!(filter.check("alice", "/summary", &group), Some(SkipReason::Command));
        assert_eq!(filter.check("alice", "📊 Статус", &group), Some(SkipReason::Command));
        assert_eq!(filter.check("alice", "a regular message", &group), None);

        let by_name = EventFilter::new(None, Some("@Study_Bot"));
        assert_eq!(by_name.check("alice", "hello", &group), None);
        assert_eq!(
            by_name.check("alice", "hello", &chat(5, None, Some("other"))),
            Some(SkipReason::OtherPeer)
        );

        let by_id = EventFilter::new(None, Some("-100"));
        assert_eq!(by_id.check("alice", "hello", &group), None);
    }

    #[tokio::test]
    async fn test_handle_event_normalizes_and_dedupes() {
        let db = test_db();
        let listener = Listener::new(db.clone(), &test_config());
        let at = Utc.with_ymd_and_hms(2025, 5, 10, 22, 15, 0).unwrap();

        let capture = listener.handle_event(event(1, 7, "hello everyone", at)).await.unwrap();
        assert_eq!(capture, Capture::Stored);
        let again = listener.handle_event(event(1, 7, "hello everyone", at)).await.unwrap();
        assert_eq!(again, Capture::Duplicate);

        let stored = db.get_message(1).unwrap().unwrap();
        assert_eq!(stored.date, "2025-05-11T01:15:00+03:00");
        assert_eq!(stored.sender, "alice");
        assert!(!stored.summarized);

        let mut sticker = event(2, 7, "", at);
        sticker.text = None;
        listener.handle_event(sticker).await.unwrap();
        assert_eq!(db.get_message(2).unwrap().unwrap().text, "");
    }

    #[tokio::test]
    async fn test_own_messages_are_never_persisted() {
        let db = test_db();
        let mut config = test_config();
        config.self_identity = Some("digest_bot".to_string());
        let listener = Listener::new(db.clone(), &config);

        let mut own = event(1, 7, "here is your digest", Utc::now());
        own.sender = user(Some("digest_bot"), None, None);
        let capture = listener.handle_event(own).await.unwrap();

        assert_eq!(capture, Capture::Skipped(SkipReason::OwnMessage));
        assert!(db.get_message(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backfill_then_live() {
        let db = test_db();
        let listener = Listener::new(db.clone(), &test_config());
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

        // Newest first, as sources return history
        let history: Vec<RawEvent> = (1..=100)
            .rev()
            .map(|i| event(i, 7, &format!("history message {i}"), base + ChronoDuration::minutes(i)))
            .collect();
        let live = event(101, 7, "fresh live message", Utc::now());

        let source = FakeSource {
            conversations: vec![chat(7, Some("Study group"), None)],
            history: HashMap::from([(7, history)]),
            live: Mutex::new(vec![Ok(live)]),
            ..Default::default()
        };
        listener.run(&source).await;

        let stats = db.stats().unwrap();
        assert_eq!(stats.total, 101);

        let recent = db.recent_messages(2).unwrap();
        assert_eq!(recent[0].id, 101);
        assert!(recent[0].date >= recent[1].date);
        assert_eq!(recent[1].id, 100);
    }

    #[tokio::test]
    async fn test_stream_faults_do_not_stop_listening() {
        let db = test_db();
        let listener = Listener::new(db.clone(), &test_config());
        let source = FakeSource {
            live: Mutex::new(vec![
                Err(SourceError::Decode("garbled update".to_string())),
                Ok(event(1, 7, "after the fault", Utc::now())),
                Ok(event(2, 7, "/status", Utc::now())),
                Ok(event(3, 7, "still listening", Utc::now())),
            ]),
            ..Default::default()
        };

        listener.listen(&source).await;

        assert!(db.get_message(1).unwrap().is_some());
        assert!(db.get_message(2).unwrap().is_none());
        assert!(db.get_message(3).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_faults_are_isolated_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("messages.db");
        let db = Database::open(&db_path).unwrap();
        db.execute_init().unwrap();
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_first BEFORE INSERT ON messages WHEN NEW.id = 1
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let listener = Listener::new(db.clone(), &test_config());

        // Direct call surfaces the fault...
        let err = listener
            .handle_event(event(1, 7, "first message", Utc::now()))
            .await;
        assert!(err.is_err());

        // ...while the stream loop logs it and moves on
        let source = FakeSource {
            live: Mutex::new(vec![
                Ok(event(1, 7, "first message", Utc::now())),
                Ok(event(2, 7, "second message", Utc::now())),
            ]),
            ..Default::default()
        };
        listener.listen(&source).await;

        assert!(db.get_message(1).unwrap().is_none());
        assert_eq!(db.get_message(2).unwrap().unwrap().text, "second message");
    }

    #[tokio::test]
    async fn test_connect_retries_until_success() {
        let listener = Listener::new(test_db(), &test_config());
        let source = FakeSource {
            connect_failures: AtomicU32::new(2),
            ..Default::default()
        };

        listener.connect_with_retry(&source).await;
        assert_eq!(source.connect_attempts.load(Ordering::SeqCst), 3);
    }
}
