//! SQLite storage layer for confab.
//!
//! Backs the external collaborators the relay core depends on: the
//! active-session table consulted at connection time, the friendship
//! relation used to authorize relays, the durable presence store, and the
//! offline mailbox that outlives process restarts. Live connection state is
//! deliberately *not* stored here; the session registry owns that.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A message queued for a receiver who had no live connections at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessageRow {
    pub message_uuid: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub message_type: String,
    /// Client-assigned send timestamp (milliseconds since epoch).
    pub client_timestamp: u64,
    /// Server-side store timestamp (milliseconds since epoch); drain order.
    pub created_at: u64,
}

/// Durable presence record for one user.
#[derive(Debug, Clone)]
pub struct PresenceRow {
    pub user_id: String,
    pub online: bool,
    pub last_seen: Option<u64>,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Path of the confab database inside a data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("confab.db")
}

pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open (or create) the database at `path`, creating parent directories
    /// and the schema as needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                user_id     TEXT NOT NULL,
                session_id  TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (user_id, session_id)
            );

            CREATE TABLE IF NOT EXISTS friendships (
                user_a      TEXT NOT NULL,
                user_b      TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (user_a, user_b)
            );

            CREATE TABLE IF NOT EXISTS presence (
                user_id     TEXT PRIMARY KEY,
                online      INTEGER NOT NULL DEFAULT 0,
                last_seen   INTEGER
            );

            CREATE TABLE IF NOT EXISTS offline_messages (
                message_uuid     TEXT PRIMARY KEY,
                sender_id        TEXT NOT NULL,
                receiver_id      TEXT NOT NULL,
                body             TEXT NOT NULL,
                message_type     TEXT NOT NULL,
                client_timestamp INTEGER NOT NULL,
                created_at       INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_offline_receiver
                ON offline_messages (receiver_id, created_at);
            ",
        )?;
        Ok(())
    }

    // -- sessions ----------------------------------------------------------

    /// Register an active (user, session) pair. Idempotent.
    pub fn insert_session(
        &self,
        user_id: &str,
        session_id: &str,
        now: u64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sessions (user_id, session_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, session_id, now],
        )?;
        Ok(())
    }

    /// Invalidate one session (logout). Visible to the next
    /// [`is_session_active`](Self::is_session_active) call immediately.
    pub fn delete_session(&self, user_id: &str, session_id: &str) -> Result<bool, StorageError> {
        let n = self.conn.execute(
            "DELETE FROM sessions WHERE user_id = ?1 AND session_id = ?2",
            params![user_id, session_id],
        )?;
        Ok(n > 0)
    }

    /// Whether the (user, session) pair is currently active. Always reads the
    /// table directly; logout must never be masked by a cache.
    pub fn is_session_active(&self, user_id: &str, session_id: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sessions WHERE user_id = ?1 AND session_id = ?2",
                params![user_id, session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -- friendships -------------------------------------------------------

    /// Record a (symmetric) friendship. Pair order is normalized so the
    /// relation is stored once. Idempotent.
    pub fn add_friendship(&self, user_a: &str, user_b: &str, now: u64) -> Result<(), StorageError> {
        let (lo, hi) = normalize_pair(user_a, user_b);
        self.conn.execute(
            "INSERT OR IGNORE INTO friendships (user_a, user_b, created_at)
             VALUES (?1, ?2, ?3)",
            params![lo, hi, now],
        )?;
        Ok(())
    }

    pub fn remove_friendship(&self, user_a: &str, user_b: &str) -> Result<bool, StorageError> {
        let (lo, hi) = normalize_pair(user_a, user_b);
        let n = self.conn.execute(
            "DELETE FROM friendships WHERE user_a = ?1 AND user_b = ?2",
            params![lo, hi],
        )?;
        Ok(n > 0)
    }

    pub fn are_friends(&self, user_a: &str, user_b: &str) -> Result<bool, StorageError> {
        let (lo, hi) = normalize_pair(user_a, user_b);
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM friendships WHERE user_a = ?1 AND user_b = ?2",
                params![lo, hi],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All friends of `user_id`, either side of the stored pair.
    pub fn list_friends(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT CASE WHEN user_a = ?1 THEN user_b ELSE user_a END
             FROM friendships
             WHERE user_a = ?1 OR user_b = ?1
             ORDER BY 1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        let mut friends = Vec::new();
        for row in rows {
            friends.push(row?);
        }
        Ok(friends)
    }

    // -- presence ----------------------------------------------------------

    /// Upsert the durable online flag; `last_seen` is updated on transitions
    /// to offline and preserved otherwise.
    pub fn set_online(
        &self,
        user_id: &str,
        online: bool,
        last_seen: Option<u64>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO presence (user_id, online, last_seen)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET
                online = excluded.online,
                last_seen = COALESCE(excluded.last_seen, presence.last_seen)",
            params![user_id, online, last_seen],
        )?;
        Ok(())
    }

    pub fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, online, last_seen FROM presence WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(PresenceRow {
                        user_id: row.get(0)?,
                        online: row.get(1)?,
                        last_seen: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -- offline mailbox ---------------------------------------------------

    /// Append a message to the receiver's mailbox. Duplicate message UUIDs
    /// are ignored so a client retry cannot double-queue.
    pub fn queue_message(&self, row: &QueuedMessageRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO offline_messages
                (message_uuid, sender_id, receiver_id, body, message_type,
                 client_timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.message_uuid,
                row.sender_id,
                row.receiver_id,
                row.body,
                row.message_type,
                row.client_timestamp,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    /// All pending messages for `receiver_id` in original store order,
    /// regardless of sender. The caller deletes after successful emission.
    pub fn drain_queued(&self, receiver_id: &str) -> Result<Vec<QueuedMessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_uuid, sender_id, receiver_id, body, message_type,
                    client_timestamp, created_at
             FROM offline_messages
             WHERE receiver_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![receiver_id], |row| {
            Ok(QueuedMessageRow {
                message_uuid: row.get(0)?,
                sender_id: row.get(1)?,
                receiver_id: row.get(2)?,
                body: row.get(3)?,
                message_type: row.get(4)?,
                client_timestamp: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Delete queued messages by UUID. Unknown or already-deleted ids are
    /// ignored; returns the number actually removed.
    pub fn delete_queued(&self, message_uuids: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for uuid in message_uuids {
            removed += self.conn.execute(
                "DELETE FROM offline_messages WHERE message_uuid = ?1",
                params![uuid],
            )?;
        }
        Ok(removed)
    }

    /// Drop the mailbox table so subsequent queue operations fail.
    #[cfg(test)]
    pub(crate) fn drop_mailbox_table(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("DROP TABLE offline_messages")?;
        Ok(())
    }

    /// Total queued messages across all receivers (stats endpoint).
    pub fn count_queued(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM offline_messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Order a user pair so the symmetric friendship relation stores one row.
fn normalize_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> Storage {
        Storage::open_in_memory().expect("open in-memory storage")
    }

    fn queued(uuid: &str, sender: &str, receiver: &str, created_at: u64) -> QueuedMessageRow {
        QueuedMessageRow {
            message_uuid: uuid.to_string(),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            body: format!("body of {uuid}"),
            message_type: "text".to_string(),
            client_timestamp: created_at,
            created_at,
        }
    }

    #[test]
    fn test_sessions_lifecycle() {
        let storage = test_storage();

        assert!(!storage.is_session_active("alice", "s1").unwrap());

        storage.insert_session("alice", "s1", 1000).unwrap();
        storage.insert_session("alice", "s2", 1001).unwrap();
        assert!(storage.is_session_active("alice", "s1").unwrap());
        assert!(storage.is_session_active("alice", "s2").unwrap());

        // Duplicate insert is a no-op
        storage.insert_session("alice", "s1", 1002).unwrap();

        // Logout of one session leaves the other active
        assert!(storage.delete_session("alice", "s1").unwrap());
        assert!(!storage.is_session_active("alice", "s1").unwrap());
        assert!(storage.is_session_active("alice", "s2").unwrap());

        // Deleting an unknown session is not an error
        assert!(!storage.delete_session("alice", "s1").unwrap());
    }

    #[test]
    fn test_friendships_symmetric() {
        let storage = test_storage();

        storage.add_friendship("bob", "alice", 1000).unwrap();
        assert!(storage.are_friends("alice", "bob").unwrap());
        assert!(storage.are_friends("bob", "alice").unwrap());
        assert!(!storage.are_friends("alice", "carol").unwrap());

        // Insert in the other order is the same row
        storage.add_friendship("alice", "bob", 1001).unwrap();
        storage.add_friendship("alice", "carol", 1002).unwrap();

        assert_eq!(storage.list_friends("alice").unwrap(), vec!["bob", "carol"]);
        assert_eq!(storage.list_friends("bob").unwrap(), vec!["alice"]);

        assert!(storage.remove_friendship("bob", "alice").unwrap());
        assert!(!storage.are_friends("alice", "bob").unwrap());
        assert!(!storage.remove_friendship("bob", "alice").unwrap());
    }

    #[test]
    fn test_presence_upsert() {
        let storage = test_storage();

        assert!(storage.get_presence("alice").unwrap().is_none());

        storage.set_online("alice", true, None).unwrap();
        let p = storage.get_presence("alice").unwrap().unwrap();
        assert!(p.online);
        assert_eq!(p.last_seen, None);

        storage.set_online("alice", false, Some(5000)).unwrap();
        let p = storage.get_presence("alice").unwrap().unwrap();
        assert!(!p.online);
        assert_eq!(p.last_seen, Some(5000));

        // Coming back online preserves last_seen
        storage.set_online("alice", true, None).unwrap();
        let p = storage.get_presence("alice").unwrap().unwrap();
        assert!(p.online);
        assert_eq!(p.last_seen, Some(5000));
    }

    #[test]
    fn test_mailbox_fifo_across_senders() {
        let storage = test_storage();

        storage.queue_message(&queued("m1", "alice", "bob", 100)).unwrap();
        storage.queue_message(&queued("m2", "carol", "bob", 200)).unwrap();
        storage.queue_message(&queued("m3", "alice", "bob", 300)).unwrap();
        storage.queue_message(&queued("m4", "alice", "dave", 150)).unwrap();

        // Store order preserved, not grouped by sender
        let drained = storage.drain_queued("bob").unwrap();
        let uuids: Vec<&str> = drained.iter().map(|m| m.message_uuid.as_str()).collect();
        assert_eq!(uuids, vec!["m1", "m2", "m3"]);

        // Other receivers untouched
        assert_eq!(storage.drain_queued("dave").unwrap().len(), 1);
        assert_eq!(storage.count_queued().unwrap(), 4);
    }

    #[test]
    fn test_mailbox_dedup_on_store() {
        let storage = test_storage();

        storage.queue_message(&queued("m1", "alice", "bob", 100)).unwrap();
        // Retry with the same uuid does not double-queue
        storage.queue_message(&queued("m1", "alice", "bob", 101)).unwrap();

        let drained = storage.drain_queued("bob").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].created_at, 100);
    }

    #[test]
    fn test_mailbox_delete_idempotent() {
        let storage = test_storage();

        storage.queue_message(&queued("m1", "alice", "bob", 100)).unwrap();
        storage.queue_message(&queued("m2", "alice", "bob", 200)).unwrap();

        let ids = vec!["m1".to_string(), "m2".to_string(), "m9".to_string()];
        assert_eq!(storage.delete_queued(&ids).unwrap(), 2);
        // Second delete with the same set is a no-op, not an error
        assert_eq!(storage.delete_queued(&ids).unwrap(), 0);
        // Empty id list is fine too
        assert_eq!(storage.delete_queued(&[]).unwrap(), 0);

        assert!(storage.drain_queued("bob").unwrap().is_empty());
    }
}
