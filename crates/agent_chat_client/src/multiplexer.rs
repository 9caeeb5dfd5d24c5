//! Request multiplexing over one connection.
//!
//! Each outgoing request gets a fresh id and a `StreamChannel`; inbound
//! `response_chunk` frames are routed to the channel bound to their id.
//! Frames for unknown or finished ids are dropped: that is expected after a
//! cancellation or a late duplicate delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::connection::ConnectionSlot;
use crate::error::{ClientError, StreamError};
use crate::messages::{ClientFrame, ResponseChunkFrame};
use crate::stream::{Finish, RequestId, RequestState, StreamChannel, StreamShared};

/// Options for `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Why the turn was started, e.g. `submit-message` or `regenerate-message`.
    pub trigger: Option<String>,
}

impl SendOptions {
    pub fn with_trigger(trigger: impl Into<String>) -> Self {
        Self {
            trigger: Some(trigger.into()),
        }
    }
}

/// The set of active request ids and the streams bound to them.
#[derive(Default)]
pub struct ActiveRequests {
    entries: Mutex<HashMap<RequestId, Arc<StreamShared>>>,
}

impl ActiveRequests {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Arc<StreamShared>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Register a stream. Fails if its id is already active.
    pub(crate) fn insert(&self, shared: Arc<StreamShared>) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(shared.id()) {
            return false;
        }
        entries.insert(shared.id().clone(), shared);
        true
    }

    /// Unregister `shared`, leaving any other stream bound to the same id alone.
    pub(crate) fn remove(&self, shared: &Arc<StreamShared>) -> bool {
        let mut entries = self.lock();
        match entries.get(shared.id()) {
            Some(current) if Arc::ptr_eq(current, shared) => {
                entries.remove(shared.id());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get(&self, id: &RequestId) -> Option<Arc<StreamShared>> {
        self.lock().get(id).cloned()
    }
}

/// Assigns ids, tracks active requests and routes inbound chunks.
#[derive(Clone)]
pub struct RequestMultiplexer {
    connection: ConnectionSlot,
    active: Arc<ActiveRequests>,
}

impl RequestMultiplexer {
    pub fn new(connection: ConnectionSlot) -> Self {
        Self {
            connection,
            active: Arc::new(ActiveRequests::default()),
        }
    }

    pub fn connection(&self) -> &ConnectionSlot {
        &self.connection
    }

    pub fn active(&self) -> &Arc<ActiveRequests> {
        &self.active
    }

    /// Start a request and return the stream bound to it. A failed initial
    /// send is returned to the caller; there is no fallback for it.
    pub fn send(&self, payload: &str, options: &SendOptions) -> Result<StreamChannel, ClientError> {
        let (channel, shared) = self.register_fresh();
        let id = channel.id().clone();

        let frame = ClientFrame::send_request(id.as_str(), payload, options.trigger.as_deref());
        let sent = frame
            .to_json()
            .map_err(ClientError::from)
            .and_then(|json| {
                self.connection.send(json).map_err(|source| ClientError::Send {
                    id: id.to_string(),
                    source,
                })
            });

        if let Err(err) = sent {
            shared.finish(Finish::Failed(StreamError::Local(err.to_string())));
            return Err(err);
        }

        debug!(request_id = %id, trigger = ?options.trigger, "request sent");
        Ok(channel)
    }

    fn register_fresh(&self) -> (StreamChannel, Arc<StreamShared>) {
        loop {
            let id = RequestId::generate();
            if self.active.contains(&id) {
                continue;
            }
            let (channel, shared) =
                StreamChannel::pair(id, &self.active, self.connection.clone());
            if self.active.insert(shared.clone()) {
                return (channel, shared);
            }
            // Lost a race for this id: retire the unregistered stream quietly
            // so dropping it does not cancel someone else's request.
            shared.finish(Finish::Cancelled { notify_peer: false });
        }
    }

    /// Bind a stream to an id chosen by the server (resumption). Returns
    /// `None` if the id is already active.
    pub fn attach(&self, id: RequestId) -> Option<StreamChannel> {
        if self.active.contains(&id) {
            return None;
        }
        let (channel, shared) = StreamChannel::pair(id, &self.active, self.connection.clone());
        if self.active.insert(shared.clone()) {
            debug!(request_id = %channel.id(), "stream attached");
            Some(channel)
        } else {
            shared.finish(Finish::Cancelled { notify_peer: false });
            None
        }
    }

    /// Cancel `id`: best-effort CANCEL to the peer, then abort the local
    /// stream. Returns `false` if the id is not active.
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.active.get(id) {
            Some(shared) => shared.finish(Finish::Cancelled { notify_peer: true }),
            None => {
                trace!(request_id = %id, "cancel for inactive request ignored");
                false
            }
        }
    }

    /// Route a chunk to its stream. Returns `false` if the id is unknown.
    pub fn route(&self, frame: ResponseChunkFrame) -> bool {
        let id = RequestId::from(frame.id.as_str());
        match self.active.get(&id) {
            Some(shared) => {
                shared.deliver(frame);
                true
            }
            None => {
                trace!(request_id = %id, "dropping chunk for unknown request");
                false
            }
        }
    }

    pub fn is_active(&self, id: &RequestId) -> bool {
        self.active.contains(id)
    }

    pub fn active_ids(&self) -> Vec<RequestId> {
        self.active.ids()
    }

    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.active.get(id).map(|shared| shared.state())
    }

    /// Send a frame whose failure is covered by a timeout or is otherwise
    /// harmless (cancel, resume request, resume ack).
    pub(crate) fn send_best_effort(&self, frame: ClientFrame) {
        let kind = frame.kind();
        let result = frame
            .to_json()
            .map_err(ClientError::from)
            .and_then(|json| self.connection.send(json).map_err(ClientError::from));
        if let Err(e) = result {
            debug!(kind, error = %e, "best-effort send failed");
        }
    }
}
