//! One conversation: a live transport plus the durable transcript.
//!
//! Each turn sends the whole transcript as the request payload, streams the
//! reply, and persists through reconciliation so client-assigned ids settle
//! on the canonical ones. A dropped connection mid-stream triggers a
//! reconnect and a resume handshake before the stream is given up.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agent_chat_client::{
    connect_transport, persist_messages, Chunk, ChatTransport, Config, ConnectedTransport,
    IdOrigin, Message, RequestId, ResumeOutcome, Role, SendOptions, StreamChannel, StreamError,
    TranscriptStore, WsConnection,
};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::store::SqliteTranscript;

/// Trigger sent with every new user turn.
pub const SUBMIT_TRIGGER: &str = "submit-message";

const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// How a streamed turn ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    /// Concatenated chunk bodies received before the stream ended.
    pub answer: String,
    /// Server or transport failure that ended the stream early.
    pub error: Option<String>,
    pub cancelled: bool,
}

impl ChatReply {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

#[derive(Serialize)]
struct RequestPayload<'a> {
    messages: &'a [Message],
}

/// Cancels whatever turn the session is currently streaming. Safe to use
/// from another task (e.g. a Ctrl-C handler).
#[derive(Clone)]
pub struct CancelHandle {
    transport: ChatTransport,
    current: Arc<Mutex<Option<RequestId>>>,
}

impl CancelHandle {
    pub fn cancel(&self) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match current {
            Some(id) => {
                info!(request_id = %id, "cancelling in-flight request");
                self.transport.cancel(&id)
            }
            None => false,
        }
    }
}

enum Step {
    Item(Option<Result<Chunk, StreamError>>),
    LinkDown,
}

pub struct ChatSession {
    config: Config,
    transport: ChatTransport,
    connection: Arc<WsConnection>,
    unsolicited: mpsc::UnboundedReceiver<StreamChannel>,
    store: SqliteTranscript,
    messages: Vec<Message>,
    current: Arc<Mutex<Option<RequestId>>>,
}

impl ChatSession {
    /// Connect to the configured agent and open the configured transcript.
    pub async fn open(config: Config) -> Result<Self, SessionError> {
        let path = config.store_path().ok_or(SessionError::NoStorePath)?;
        let store = SqliteTranscript::open(&path)?;
        Self::with_store(config, store).await
    }

    /// Connect to the configured agent, continuing the transcript in `store`.
    pub async fn with_store(config: Config, store: SqliteTranscript) -> Result<Self, SessionError> {
        let url = config.server_url().to_string();
        let ConnectedTransport {
            transport,
            connection,
            unsolicited,
        } = connect_transport(&url, config.transport_config())
            .await
            .map_err(|source| SessionError::Connect { url, source })?;
        let messages = store.load()?;
        info!(
            url = config.server_url(),
            messages = messages.len(),
            "session opened"
        );
        Ok(Self {
            config,
            transport,
            connection,
            unsolicited,
            store,
            messages,
            current: Arc::new(Mutex::new(None)),
        })
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn transport(&self) -> &ChatTransport {
        &self.transport
    }

    pub fn store(&self) -> &SqliteTranscript {
        &self.store
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            transport: self.transport.clone(),
            current: self.current.clone(),
        }
    }

    /// Reattach to a reply the server is still producing, if any: either one
    /// it announced when the connection opened, or one found by asking.
    /// Replayed and live chunks are both passed to `on_chunk` in arrival
    /// order.
    pub async fn resume_pending<F>(&mut self, mut on_chunk: F) -> Result<Option<ChatReply>, SessionError>
    where
        F: FnMut(&Chunk),
    {
        let announced = match self.unsolicited.try_recv() {
            Ok(channel) => Some(channel),
            Err(_) => match self.transport.resume_with_outcome().await {
                ResumeOutcome::Attached(channel) => Some(channel),
                // The announcement may have landed while the request was out.
                _ => self.unsolicited.try_recv().ok(),
            },
        };
        let Some(channel) = announced else {
            debug!("nothing to resume");
            return Ok(None);
        };
        info!(request_id = %channel.id(), "resumed in-flight reply");
        let reply = self.stream_reply(channel, &mut on_chunk).await?;
        self.persist()?;
        Ok(Some(reply))
    }

    /// Ask `question` and stream the reply to `on_chunk`.
    pub async fn ask<F>(&mut self, question: &str, mut on_chunk: F) -> Result<ChatReply, SessionError>
    where
        F: FnMut(&Chunk),
    {
        self.messages.push(Message::client_text(Role::User, question));
        let channel = match self.send_transcript() {
            Ok(channel) => channel,
            Err(e) => {
                self.messages.pop();
                return Err(e);
            }
        };
        info!(request_id = %channel.id(), "question sent");
        let reply = self.stream_reply(channel, &mut on_chunk).await?;
        self.persist()?;
        Ok(reply)
    }

    fn send_transcript(&self) -> Result<StreamChannel, SessionError> {
        let payload = serde_json::to_string(&RequestPayload {
            messages: &self.messages,
        })
        .map_err(SessionError::Payload)?;
        Ok(self
            .transport
            .send(&payload, &SendOptions::with_trigger(SUBMIT_TRIGGER))?)
    }

    fn set_current(&self, id: Option<RequestId>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    async fn stream_reply<F>(
        &mut self,
        mut channel: StreamChannel,
        on_chunk: &mut F,
    ) -> Result<ChatReply, SessionError>
    where
        F: FnMut(&Chunk),
    {
        let mut reply = ChatReply::default();
        self.set_current(Some(channel.id().clone()));

        loop {
            let link = self.connection.clone();
            let step = tokio::select! {
                biased;
                item = channel.next() => Step::Item(item),
                _ = link.closed() => Step::LinkDown,
            };

            match step {
                Step::Item(Some(Ok(chunk))) => {
                    reply.answer.push_str(&chunk.body);
                    on_chunk(&chunk);
                }
                Step::Item(Some(Err(StreamError::Cancelled))) => {
                    reply.cancelled = true;
                    break;
                }
                Step::Item(Some(Err(e))) => {
                    reply.error = Some(e.to_string());
                    break;
                }
                Step::Item(None) => break,
                Step::LinkDown => {
                    warn!(request_id = %channel.id(), "connection lost mid-stream");
                    if let Err(e) = self.reconnect().await {
                        self.set_current(None);
                        return Err(e);
                    }
                    match self.transport.resume_with_outcome().await {
                        ResumeOutcome::AlreadyActive(id) => {
                            debug!(request_id = %id, "stream continues on new connection");
                        }
                        ResumeOutcome::Attached(resumed) => {
                            info!(
                                previous = %channel.id(),
                                request_id = %resumed.id(),
                                "server resumed a different request"
                            );
                            channel = resumed;
                            self.set_current(Some(channel.id().clone()));
                        }
                        ResumeOutcome::TimedOut | ResumeOutcome::Superseded => {
                            reply.error = Some("stream was not resumed after reconnect".into());
                            break;
                        }
                    }
                }
            }
        }

        self.set_current(None);
        if !reply.answer.is_empty() {
            self.messages
                .push(Message::client_text(Role::Assistant, &reply.answer));
        }
        Ok(reply)
    }

    async fn reconnect(&mut self) -> Result<(), SessionError> {
        let attempts = self.config.reconnect_attempts();
        let url = self.config.server_url().to_string();
        for attempt in 1..=attempts {
            // Listen before the handshake so an announcement on open is seen.
            let connection = WsConnection::spawn(&url);
            self.transport.replace_connection(connection.clone());
            match connection.wait_open().await {
                Ok(()) => {
                    self.connection = connection;
                    info!(%url, attempt, "reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "reconnect failed");
                    tokio::time::sleep(RECONNECT_BACKOFF * attempt).await;
                }
            }
        }
        Err(SessionError::ReconnectExhausted { attempts })
    }

    /// Reconcile the in-memory list against the store and commit it.
    pub fn persist(&mut self) -> Result<(), SessionError> {
        let result = persist_messages(&mut self.store, &self.messages)?;
        for (from, to) in result.remapped() {
            debug!(from, to, "message id remapped");
        }
        self.messages = result
            .messages
            .into_iter()
            .map(|m| Message {
                origin: IdOrigin::Server,
                ..m
            })
            .collect();
        Ok(())
    }
}
