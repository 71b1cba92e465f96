use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use crate::api::models::{Conversation, Message};
use crate::error::StorageError;
use crate::store::StoreSnapshot;

const ACTIVE_KEY: &str = "active_conversation_id";

pub fn default_db_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "RealChat")?;
    Some(proj.data_dir().join("conversations.sqlite"))
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Caches conversations and messages between runs so the client has
/// something to show before the first fetch completes.
#[derive(Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn open_default() -> Result<Self, StorageError> {
        let path = default_db_path().ok_or(StorageError::NoDataDir)?;
        Self::open(path)
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let storage = Self { path: path.into() };
        storage.init()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<Connection, StorageError> {
        ensure_dir(&self.path)?;
        Ok(Connection::open(&self.path)?)
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                raw_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                raw_json TEXT NOT NULL,
                PRIMARY KEY (conversation_id, seq)
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            "#,
        )?;
        Ok(())
    }

    /// Replace the stored state with `snapshot`.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM conversations", [])?;
        tx.execute("DELETE FROM messages", [])?;
        for (position, conv) in snapshot.conversations.iter().enumerate() {
            tx.execute(
                "INSERT INTO conversations (id, position, raw_json) VALUES (?1, ?2, ?3)",
                params![conv.id, position as i64, serde_json::to_string(conv)?],
            )?;
        }
        for (conversation_id, messages) in &snapshot.messages {
            for (seq, msg) in messages.iter().enumerate() {
                tx.execute(
                    "INSERT INTO messages (conversation_id, seq, raw_json) VALUES (?1, ?2, ?3)",
                    params![conversation_id, seq as i64, serde_json::to_string(msg)?],
                )?;
            }
        }
        tx.execute(
            r#"
            INSERT INTO meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![ACTIVE_KEY, snapshot.active_conversation_id],
        )?;
        tx.commit()?;
        debug!(
            "Saved {} conversations to {}",
            snapshot.conversations.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn load(&self) -> Result<StoreSnapshot, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare("SELECT raw_json FROM conversations ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut conversations = Vec::new();
        for raw in rows {
            conversations.push(serde_json::from_str::<Conversation>(&raw?)?);
        }

        let mut stmt = conn.prepare(
            "SELECT conversation_id, raw_json FROM messages ORDER BY conversation_id ASC, seq ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut messages: HashMap<String, Vec<Message>> = HashMap::new();
        for row in rows {
            let (conversation_id, raw) = row?;
            messages
                .entry(conversation_id)
                .or_default()
                .push(serde_json::from_str(&raw)?);
        }

        let active_conversation_id: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![ACTIVE_KEY], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?
            .flatten();

        Ok(StoreSnapshot {
            conversations,
            messages,
            active_conversation_id,
        })
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.save(&StoreSnapshot::default())
    }
}
