/// Captured messages. `id` is the raw upstream message id; it is not
/// namespaced by chat, so two chats emitting the same id collide.
pub const MESSAGES_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY,
        chat_id INTEGER NOT NULL,
        sender TEXT,
        text TEXT,
        date TEXT,
        summarized INTEGER DEFAULT 0
    );
";

/// Generated digests, each covering a run of captured messages.
pub const DIGESTS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS digests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id INTEGER,
        origin_message_id INTEGER NOT NULL,
        last_message_id INTEGER NOT NULL,
        message_count INTEGER NOT NULL,
        text TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
";

/// Applied after the legacy column migration so `summarized` is present.
pub const INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS idx_messages_pending_date ON messages (summarized, date);
    CREATE INDEX IF NOT EXISTS idx_digests_created ON digests (created_at);
";
