pub mod schema;

use crate::config::Config;
use crate::error::StoreError;
use chrono::{DateTime, FixedOffset, Offset, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Every ledger timestamp is rendered in this fixed offset (UTC+3).
pub const LEDGER_UTC_OFFSET_SECS: i32 = 3 * 3600;

pub fn ledger_offset() -> FixedOffset {
    FixedOffset::east_opt(LEDGER_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Renders a timestamp the way the ledger stores it. All values share one
/// offset and precision, so string order equals chronological order.
pub fn ledger_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String {
    at.with_timezone(&ledger_offset())
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// A normalized message ready to be captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: i64,
    pub chat_id: i64,
    pub sender: String,
    pub text: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: i64,
    pub chat_id: i64,
    pub sender: String,
    pub text: String,
    pub date: String,
    pub summarized: bool,
}

impl MessageRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            sender: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            date: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            summarized: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
        })
    }
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Same id from the same chat was already stored.
    Duplicate,
    /// Same id is already stored for a different chat; the new message is dropped.
    Shadowed { stored_chat_id: i64 },
}

/// A digest about to be written, anchored on the first message it covers.
#[derive(Debug, Clone)]
pub struct DigestDraft {
    pub origin_message_id: i64,
    pub last_message_id: i64,
    pub message_count: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRecord {
    pub id: i64,
    pub chat_id: Option<i64>,
    pub origin_message_id: i64,
    pub last_message_id: i64,
    pub message_count: i64,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStats {
    pub total: i64,
    pub summarized: i64,
    pub pending: i64,
    pub last_summary_at: Option<String>,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs a ledger operation on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn execute_init(&self) -> Result<()> {
        info!("Database: Initializing schema...");
        let mut conn = self.lock()?;
        conn.execute_batch(schema::MESSAGES_TABLE)?;
        conn.execute_batch(schema::DIGESTS_TABLE)?;

        // Ledgers created before processing state existed lack the flag.
        let has_flag = conn
            .prepare("SELECT 1 FROM pragma_table_info('messages') WHERE name = 'summarized'")?
            .exists([])?;
        if !has_flag {
            info!("Database: Adding summarized column to existing messages table");
            conn.execute(
                "ALTER TABLE messages ADD COLUMN summarized INTEGER DEFAULT 0",
                [],
            )?;
        }

        conn.execute_batch(schema::INDEXES)?;

        let rewritten = normalize_dates(&mut conn)?;
        if rewritten > 0 {
            info!("Database: Normalized {} legacy message dates to ledger time", rewritten);
        }
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Insert-if-absent keyed by `id`. Never overwrites a stored row.
    pub fn append(&self, message: &NewMessage) -> Result<AppendOutcome> {
        debug!(
            "Database: Saving message {} from {} in chat {}",
            message.id, message.sender, message.chat_id
        );
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages (id, chat_id, sender, text, date, summarized)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                message.id,
                message.chat_id,
                message.sender,
                message.text,
                message.date
            ],
        )?;
        if inserted > 0 {
            return Ok(AppendOutcome::Inserted);
        }

        let stored_chat_id: i64 = conn.query_row(
            "SELECT chat_id FROM messages WHERE id = ?1",
            [message.id],
            |row| row.get(0),
        )?;
        if stored_chat_id == message.chat_id {
            Ok(AppendOutcome::Duplicate)
        } else {
            Ok(AppendOutcome::Shadowed { stored_chat_id })
        }
    }

    /// Up to `limit` unsummarized rows with non-empty text, oldest first.
    pub fn select_pending(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, sender, text, date, summarized
             FROM messages
             WHERE summarized = 0 AND text IS NOT NULL AND text != ''
             ORDER BY date ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], MessageRecord::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE summarized = 0 AND text IS NOT NULL AND text != ''",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Idempotent; the flag only ever moves to true.
    pub fn mark_summarized(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE messages SET summarized = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Writes one digest row. `chat_id` comes from the origin message, or null
    /// when that message is not in the ledger.
    pub fn record_digest(&self, draft: &DigestDraft) -> Result<i64> {
        let conn = self.lock()?;
        insert_digest(&conn, draft)
    }

    /// Records the digest and marks every covered id in one transaction.
    pub fn apply_batch(&self, draft: &DigestDraft, ids: &[i64]) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let digest_id = insert_digest(&tx, draft)?;
        {
            let mut mark = tx.prepare("UPDATE messages SET summarized = 1 WHERE id = ?1")?;
            for id in ids {
                mark.execute([id])?;
            }
        }
        tx.commit()?;
        debug!(
            "Database: Applied digest {} covering {} messages",
            digest_id,
            ids.len()
        );
        Ok(digest_id)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT id, chat_id, sender, text, date, summarized FROM messages WHERE id = ?1",
                [id],
                MessageRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Newest first, for the reporting surface.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, sender, text, date, summarized
             FROM messages
             ORDER BY date DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], MessageRecord::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn recent_digests(&self, limit: usize) -> Result<Vec<DigestRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, origin_message_id, last_message_id, message_count, text, created_at
             FROM digests
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(DigestRecord {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                origin_message_id: row.get(2)?,
                last_message_id: row.get(3)?,
                message_count: row.get(4)?,
                text: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let conn = self.lock()?;
        let (total, summarized): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN summarized = 1 THEN 1 ELSE 0 END), 0)
             FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let last_summary_at: Option<String> =
            conn.query_row("SELECT MAX(created_at) FROM digests", [], |row| row.get(0))?;

        Ok(LedgerStats {
            total,
            summarized,
            pending: total - summarized,
            last_summary_at,
        })
    }
}

fn insert_digest(conn: &Connection, draft: &DigestDraft) -> Result<i64> {
    conn.execute(
        "INSERT INTO digests (chat_id, origin_message_id, last_message_id, message_count, text, created_at)
         VALUES ((SELECT chat_id FROM messages WHERE id = ?1), ?1, ?2, ?3, ?4, ?5)",
        params![
            draft.origin_message_id,
            draft.last_message_id,
            draft.message_count as i64,
            draft.text,
            ledger_timestamp(&Utc::now())
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Rewrites dates stored under another offset or precision (older ledgers
/// kept UTC with microseconds). Unparseable values are left untouched.
fn normalize_dates(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction()?;
    let stale = {
        let mut stmt = tx.prepare(
            "SELECT id, date FROM messages
             WHERE date IS NOT NULL AND date NOT GLOB '????-??-??T??:??:??+03:00'",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        let mut stale = Vec::new();
        for row in rows {
            stale.push(row?);
        }
        stale
    };

    let mut rewritten = 0;
    for (id, date) in stale {
        match DateTime::parse_from_rfc3339(&date) {
            Ok(parsed) => {
                rewritten += tx.execute(
                    "UPDATE messages SET date = ?1 WHERE id = ?2",
                    params![ledger_timestamp(&parsed), id],
                )?;
            }
            Err(e) => debug!("Database: Keeping unparseable date {:?} on message {}: {}", date, id, e),
        }
    }
    tx.commit()?;
    Ok(rewritten)
}
