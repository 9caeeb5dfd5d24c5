//! Conversation messages and durable transcript stores.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reconcile::{reconcile, ReconciliationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// Who assigned a message's identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdOrigin {
    Server,
    #[default]
    Client,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Structured content, e.g. a list of parts.
    pub content: Value,
    #[serde(default)]
    pub origin: IdOrigin,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: Value, origin: IdOrigin) -> Self {
        Self {
            id: id.into(),
            role,
            content,
            origin,
        }
    }

    /// Plain-text message with a fresh client-assigned id.
    pub fn client_text(role: Role, text: &str) -> Self {
        Self::new(
            uuid::Uuid::new_v4().simple().to_string(),
            role,
            text_parts(text),
            IdOrigin::Client,
        )
    }

    pub fn server_text(id: impl Into<String>, role: Role, text: &str) -> Self {
        Self::new(id, role, text_parts(text), IdOrigin::Server)
    }

    /// Concatenated `text` parts of the content.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        }
    }
}

fn text_parts(text: &str) -> Value {
    serde_json::json!([{ "type": "text", "text": text }])
}

/// Durable, server-authoritative transcript.
pub trait TranscriptStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persisted messages in conversation order.
    fn load(&self) -> Result<Vec<Message>, Self::Error>;

    /// Upsert `messages` by id (their list position is their order) and
    /// delete `delete_ids`, as one atomic batch.
    fn apply(&mut self, messages: &[Message], delete_ids: &[String]) -> Result<(), Self::Error>;
}

/// Reconcile `client` against what `store` holds and commit the result.
pub fn persist_messages<S: TranscriptStore>(
    store: &mut S,
    client: &[Message],
) -> Result<ReconciliationResult, S::Error> {
    let server = store.load()?;
    let result = reconcile(&server, client);
    store.apply(&result.messages, &result.to_delete)?;
    tracing::debug!(
        upserted = result.messages.len(),
        deleted = result.to_delete.len(),
        deletion_allowed = result.deletion_allowed,
        "transcript persisted"
    );
    Ok(result)
}

#[derive(Debug, Clone)]
struct Row {
    position: usize,
    seq: u64,
    message: Message,
}

/// In-memory transcript store.
#[derive(Debug, Default, Clone)]
pub struct MemoryTranscript {
    rows: Vec<Row>,
    next_seq: u64,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with server-assigned rows.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        let mut store = Self::default();
        let seeded: Vec<Message> = messages
            .into_iter()
            .map(|m| Message {
                origin: IdOrigin::Server,
                ..m
            })
            .collect();
        let _ = store.apply(&seeded, &[]);
        store
    }

    pub fn ids(&self) -> Vec<String> {
        self.sorted().into_iter().map(|m| m.id).collect()
    }

    fn sorted(&self) -> Vec<Message> {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|r| (r.position, r.seq));
        rows.into_iter().map(|r| r.message).collect()
    }
}

impl TranscriptStore for MemoryTranscript {
    type Error = std::convert::Infallible;

    fn load(&self) -> Result<Vec<Message>, Self::Error> {
        Ok(self.sorted())
    }

    fn apply(&mut self, messages: &[Message], delete_ids: &[String]) -> Result<(), Self::Error> {
        for (position, message) in messages.iter().enumerate() {
            let stored = Message {
                origin: IdOrigin::Server,
                ..message.clone()
            };
            match self.rows.iter_mut().find(|r| r.message.id == message.id) {
                Some(row) => {
                    row.position = position;
                    row.message = stored;
                }
                None => {
                    self.next_seq += 1;
                    self.rows.push(Row {
                        position,
                        seq: self.next_seq,
                        message: stored,
                    });
                }
            }
        }
        self.rows.retain(|r| !delete_ids.contains(&r.message.id));
        Ok(())
    }
}
