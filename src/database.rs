use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const DB_FILE: &str = "inferdesk.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationThread {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// Append/read access to stored conversations.
pub trait ConversationStore: Send + Sync {
    fn initialize(&self) -> Result<()>;
    /// Most recently updated first.
    fn list_threads(&self) -> Result<Vec<ConversationThread>>;
    /// Oldest first.
    fn list_messages(&self, thread_id: &str) -> Result<Vec<ConversationMessage>>;
    fn create_thread(&self, title: &str) -> Result<String>;
    fn update_thread_title(&self, thread_id: &str, title: &str) -> Result<()>;
    fn touch_thread(&self, thread_id: &str) -> Result<()>;
    fn add_message(&self, thread_id: &str, role: &str, content: &str) -> Result<String>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).ok();
        let conn = Connection::open(data_dir.join(DB_FILE))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<ConversationThread>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM threads WHERE id = ?1",
            [thread_id],
            |row| {
                Ok(ConversationThread {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl ConversationStore for Database {
    fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, created_at)",
            [],
        )?;
        Ok(())
    }

    fn list_threads(&self) -> Result<Vec<ConversationThread>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM threads
             ORDER BY updated_at DESC, rowid DESC",
        )?;
        let threads = stmt.query_map([], |row| {
            Ok(ConversationThread {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        threads.collect()
    }

    fn list_messages(&self, thread_id: &str) -> Result<Vec<ConversationMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, role, content, created_at FROM messages
             WHERE thread_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let messages = stmt.query_map([thread_id], |row| {
            Ok(ConversationMessage {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        messages.collect()
    }

    fn create_thread(&self, title: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now();
        self.conn().execute(
            "INSERT INTO threads (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, title, now, now],
        )?;
        Ok(id)
    }

    fn update_thread_title(&self, thread_id: &str, title: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE threads SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now(), thread_id],
        )?;
        Ok(())
    }

    fn touch_thread(&self, thread_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![now(), thread_id],
        )?;
        Ok(())
    }

    fn add_message(&self, thread_id: &str, role: &str, content: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT INTO messages (id, thread_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, thread_id, role, content, now()],
        )?;
        Ok(id)
    }
}
