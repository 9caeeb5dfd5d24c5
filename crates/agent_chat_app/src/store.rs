//! SQLite-backed transcript.
//!
//! One row per message, ordered by its position in the last committed list.
//! Every `apply` is a single transaction: upserts and deletions land together
//! or not at all.

use std::path::{Path, PathBuf};

use agent_chat_client::{IdOrigin, Message, Role, TranscriptStore};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS messages_position ON messages(position);
"#;

const UPSERT: &str = r#"
INSERT INTO messages (id, position, role, content, updated_at)
VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
ON CONFLICT(id) DO UPDATE SET
    position = excluded.position,
    role = excluded.role,
    content = excluded.content,
    updated_at = excluded.updated_at
"#;

pub struct SqliteTranscript {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteTranscript {
    /// Open (or create) the transcript database at `path`, creating its
    /// parent directory if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io("creating transcript directory", parent, e))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!(path = ?path, "transcript store ready");
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }
}

impl TranscriptStore for SqliteTranscript {
    type Error = StoreError;

    fn load(&self) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, role, content FROM messages ORDER BY position, rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, role, content) = row?;
            let Some(role) = Role::parse(&role) else {
                return Err(StoreError::UnknownRole { id, role });
            };
            let content = match serde_json::from_str(&content) {
                Ok(content) => content,
                Err(source) => return Err(StoreError::Decode { id, source }),
            };
            messages.push(Message::new(id, role, content, IdOrigin::Server));
        }
        Ok(messages)
    }

    fn apply(&mut self, messages: &[Message], delete_ids: &[String]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare(UPSERT)?;
            for (position, message) in messages.iter().enumerate() {
                let content =
                    serde_json::to_string(&message.content).map_err(|source| StoreError::Encode {
                        id: message.id.clone(),
                        source,
                    })?;
                upsert.execute(params![
                    message.id,
                    position as i64,
                    message.role.as_str(),
                    content
                ])?;
            }

            let mut delete = tx.prepare("DELETE FROM messages WHERE id = ?1")?;
            for id in delete_ids {
                delete.execute(params![id])?;
            }
        }
        tx.commit()?;
        debug!(
            upserted = messages.len(),
            deleted = delete_ids.len(),
            "transcript batch committed"
        );
        Ok(())
    }
}
