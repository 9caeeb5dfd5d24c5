//! `ChatTransport`: one handle over the multiplexer, the resume coordinator
//! and the inbound dispatcher for the current connection.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionSlot, Subscription};
use crate::error::ClientError;
use crate::messages::{ClientFrame, ServerFrame};
use crate::multiplexer::{RequestMultiplexer, SendOptions};
use crate::resume::{ResumeCoordinator, ResumeOutcome, DEFAULT_RESUME_TIMEOUT};
use crate::stream::{RequestId, RequestState, StreamChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// How long `resume` waits for a `stream_resuming` notification.
    pub resume_timeout: Duration,
    /// Attach to streams the server announces when no resume is pending.
    pub accept_unsolicited_resume: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            resume_timeout: DEFAULT_RESUME_TIMEOUT,
            accept_unsolicited_resume: true,
        }
    }
}

struct TransportInner {
    connection: ConnectionSlot,
    mux: RequestMultiplexer,
    resume: ResumeCoordinator,
    config: TransportConfig,
    subscription: Mutex<Option<Subscription>>,
    unsolicited: Mutex<Option<mpsc::UnboundedSender<StreamChannel>>>,
}

/// Cheaply clonable transport handle.
#[derive(Clone)]
pub struct ChatTransport {
    inner: Arc<TransportInner>,
}

impl ChatTransport {
    pub fn new(connection: Arc<dyn Connection>, config: TransportConfig) -> Self {
        let slot = ConnectionSlot::new(connection.clone());
        let mux = RequestMultiplexer::new(slot.clone());
        let resume = ResumeCoordinator::new(mux.clone(), config.resume_timeout);
        let transport = Self {
            inner: Arc::new(TransportInner {
                connection: slot,
                mux,
                resume,
                config,
                subscription: Mutex::new(None),
                unsolicited: Mutex::new(None),
            }),
        };
        transport.listen(connection.as_ref());
        transport
    }

    fn listen(&self, connection: &dyn Connection) {
        let weak = Arc::downgrade(&self.inner);
        let subscription = connection.subscribe(Arc::new(move |text: &str| {
            if let Some(inner) = weak.upgrade() {
                ChatTransport { inner }.dispatch(text);
            }
        }));
        let previous = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(subscription);
        drop(previous);
    }

    /// Swap in a new connection after a reconnect. Active streams stay bound;
    /// their chunks keep flowing once the server resumes them on the new
    /// connection.
    pub fn replace_connection(&self, connection: Arc<dyn Connection>) {
        self.inner.connection.replace(connection.clone());
        self.listen(connection.as_ref());
        info!(active = self.inner.mux.active().len(), "connection replaced");
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.inner.connection.current()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn multiplexer(&self) -> &RequestMultiplexer {
        &self.inner.mux
    }

    pub fn resume_coordinator(&self) -> &ResumeCoordinator {
        &self.inner.resume
    }

    pub fn send(&self, payload: &str, options: &SendOptions) -> Result<StreamChannel, ClientError> {
        self.inner.mux.send(payload, options)
    }

    pub fn cancel(&self, id: &RequestId) -> bool {
        self.inner.mux.cancel(id)
    }

    pub async fn resume(&self) -> Option<StreamChannel> {
        self.inner.resume.resume().await
    }

    pub async fn resume_with_outcome(&self) -> ResumeOutcome {
        self.inner.resume.resume_with_outcome().await
    }

    pub fn handle_stream_resuming(&self, id: &str) -> bool {
        self.inner.resume.handle_stream_resuming(id)
    }

    pub fn is_active(&self, id: &RequestId) -> bool {
        self.inner.mux.is_active(id)
    }

    pub fn active_ids(&self) -> Vec<RequestId> {
        self.inner.mux.active_ids()
    }

    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.inner.mux.state(id)
    }

    /// Receive streams the server announces while no resume is pending
    /// (e.g. the notification it sends on connect). Replaces any previous
    /// receiver.
    pub fn unsolicited_resumes(&self) -> mpsc::UnboundedReceiver<StreamChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .unsolicited
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Handle one inbound text frame.
    pub fn dispatch(&self, text: &str) {
        let frame = match ServerFrame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame {
            ServerFrame::ResponseChunk(chunk) => {
                self.inner.mux.route(chunk);
            }
            ServerFrame::StreamResuming { id } => {
                if !self.inner.resume.handle_stream_resuming(&id) {
                    self.accept_unsolicited(&id);
                }
            }
        }
    }

    fn accept_unsolicited(&self, id: &str) {
        if !self.inner.config.accept_unsolicited_resume {
            debug!(request_id = id, "unsolicited resume disabled; ignoring");
            return;
        }

        let tx = self
            .inner
            .unsolicited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned();
        let Some(tx) = tx else {
            debug!(request_id = id, "no resume pending; ignoring notification");
            return;
        };

        let Some(channel) = self.inner.mux.attach(RequestId::from(id)) else {
            debug!(request_id = id, "duplicate resume notification ignored");
            return;
        };
        self.inner.mux.send_best_effort(ClientFrame::resume_ack(id));
        info!(request_id = id, "attached unsolicited stream");

        if tx.send(channel).is_err() {
            debug!(request_id = id, "unsolicited receiver dropped");
        }
    }
}
