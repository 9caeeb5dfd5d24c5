//! Per-request chunk streams.
//!
//! A `StreamChannel` is a lazy, pull-based, finite sequence of chunks for one
//! request id. Every way a stream can end (done chunk, server error, caller
//! cancel, dropping the channel) funnels through `StreamShared::finish`, which
//! runs at most once.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::ConnectionSlot;
use crate::error::StreamError;
use crate::messages::{ClientFrame, ResponseChunkFrame};
use crate::multiplexer::ActiveRequests;

/// Opaque request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random id (UUID v4, simple form).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// One incremental unit of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub body: String,
    /// Historical chunk re-sent during resumption.
    pub replay: bool,
    /// Last chunk of the stream.
    pub done: bool,
}

#[derive(Debug)]
enum StreamItem {
    Chunk(Chunk),
    Failed(StreamError),
}

/// How a stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Finish {
    Completed,
    Failed(StreamError),
    Cancelled { notify_peer: bool },
}

impl Finish {
    fn state(&self) -> RequestState {
        match self {
            Finish::Completed => RequestState::Completed,
            Finish::Failed(_) => RequestState::Errored,
            Finish::Cancelled { .. } => RequestState::Cancelled,
        }
    }
}

struct SharedInner {
    state: RequestState,
    tx: Option<mpsc::UnboundedSender<StreamItem>>,
}

/// Producer side of a stream, owned by the active-request table.
pub(crate) struct StreamShared {
    id: RequestId,
    inner: Mutex<SharedInner>,
    active: Weak<ActiveRequests>,
    connection: ConnectionSlot,
}

impl StreamShared {
    pub(crate) fn id(&self) -> &RequestId {
        &self.id
    }

    pub(crate) fn state(&self) -> RequestState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an inbound chunk in arrival order.
    pub(crate) fn deliver(self: &Arc<Self>, frame: ResponseChunkFrame) {
        if frame.is_error() {
            self.finish(Finish::Failed(StreamError::Remote(frame.body)));
            return;
        }

        let done = frame.done;
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                trace!(request_id = %self.id, "dropping chunk for finished stream");
                return;
            }
            inner.state = RequestState::Streaming;
            if let Some(tx) = &inner.tx {
                let _ = tx.send(StreamItem::Chunk(Chunk {
                    body: frame.body,
                    replay: frame.replay.unwrap_or(false),
                    done,
                }));
            }
        }

        if done {
            self.finish(Finish::Completed);
        }
    }

    /// Drive the stream to its terminal state. Returns `false` if it had
    /// already finished.
    pub(crate) fn finish(self: &Arc<Self>, how: Finish) -> bool {
        let tx = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = how.state();
            inner.tx.take()
        };

        debug!(request_id = %self.id, state = ?how.state(), "stream finished");

        if let Finish::Cancelled { notify_peer: true } = how {
            let cancel = ClientFrame::cancel(self.id.as_str());
            match cancel.to_json() {
                Ok(json) => {
                    if let Err(e) = self.connection.send(json) {
                        debug!(request_id = %self.id, error = %e, "cancel frame not sent");
                    }
                }
                Err(e) => debug!(request_id = %self.id, error = %e, "cancel frame not encoded"),
            }
        }

        if let Some(tx) = tx {
            match how {
                Finish::Completed => {}
                Finish::Failed(err) => {
                    let _ = tx.send(StreamItem::Failed(err));
                }
                Finish::Cancelled { .. } => {
                    let _ = tx.send(StreamItem::Failed(StreamError::Cancelled));
                }
            }
        }

        if let Some(active) = self.active.upgrade() {
            active.remove(self);
        }
        true
    }
}

/// Consumer side of a stream.
///
/// Yields every chunk in arrival order, including the final `done` chunk,
/// then `None`. A failed or cancelled stream yields exactly one `Err` and
/// then `None`. Dropping an unfinished channel cancels the request.
pub struct StreamChannel {
    id: RequestId,
    shared: Arc<StreamShared>,
    rx: mpsc::UnboundedReceiver<StreamItem>,
}

impl StreamChannel {
    /// Create a channel and the shared producer for `id`. The caller registers
    /// the producer before handing out the channel.
    pub(crate) fn pair(
        id: RequestId,
        active: &Arc<ActiveRequests>,
        connection: ConnectionSlot,
    ) -> (Self, Arc<StreamShared>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared {
            id: id.clone(),
            inner: Mutex::new(SharedInner {
                state: RequestState::Pending,
                tx: Some(tx),
            }),
            active: Arc::downgrade(active),
            connection,
        });
        (
            Self {
                id,
                shared: shared.clone(),
                rx,
            },
            shared,
        )
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn state(&self) -> RequestState {
        self.shared.state()
    }

    /// Consumer-initiated stop: tells the peer and ends the stream with
    /// `StreamError::Cancelled`. No-op once finished.
    pub fn cancel(&self) -> bool {
        self.shared.finish(Finish::Cancelled { notify_peer: true })
    }

    /// Drain the stream and concatenate chunk bodies.
    pub async fn collect_text(mut self) -> Result<String, StreamError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?.body);
        }
        Ok(text)
    }
}

impl Stream for StreamChannel {
    type Item = Result<Chunk, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|item| {
            item.map(|item| match item {
                StreamItem::Chunk(chunk) => Ok(chunk),
                StreamItem::Failed(err) => Err(err),
            })
        })
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if self.shared.finish(Finish::Cancelled { notify_peer: true }) {
            debug!(request_id = %self.id, "stream dropped before finishing");
        }
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
