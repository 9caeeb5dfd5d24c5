//! Stream resumption after a reconnect.
//!
//! `resume` sends a resume request and waits, for at most the configured
//! window, for the inbound dispatcher to call `handle_stream_resuming`. Only
//! the most recent pending resume is ever honored; a superseded call resolves
//! with nothing when its own timer fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::messages::ClientFrame;
use crate::multiplexer::RequestMultiplexer;
use crate::stream::{RequestId, StreamChannel};

/// Default wait for a `stream_resuming` notification.
pub const DEFAULT_RESUME_TIMEOUT: Duration = Duration::from_secs(5);

/// What a pending resume call is waiting to receive.
#[derive(Debug)]
enum Handoff {
    Attached(StreamChannel),
    /// The announced id already has a live stream on this transport.
    AlreadyActive(RequestId),
}

/// The single pending-resume slot.
enum ResumeSlot {
    Idle,
    Waiting {
        generation: u64,
        resolver: oneshot::Sender<Handoff>,
    },
    Resolved {
        generation: u64,
    },
    TimedOut {
        generation: u64,
    },
}

/// Observable phase of the pending-resume slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePhase {
    Idle,
    Waiting { generation: u64 },
    Resolved { generation: u64 },
    TimedOut { generation: u64 },
}

/// How one resume call ended.
#[derive(Debug)]
pub enum ResumeOutcome {
    /// A new stream was bound to the announced id.
    Attached(StreamChannel),
    /// The announced id was already streaming here; its existing channel
    /// keeps receiving chunks.
    AlreadyActive(RequestId),
    /// No notification arrived within the window.
    TimedOut,
    /// A newer resume call took over the slot; resolved at this call's own
    /// deadline.
    Superseded,
}

impl ResumeOutcome {
    pub fn into_stream(self) -> Option<StreamChannel> {
        match self {
            ResumeOutcome::Attached(channel) => Some(channel),
            _ => None,
        }
    }
}

impl From<Handoff> for ResumeOutcome {
    fn from(handoff: Handoff) -> Self {
        match handoff {
            Handoff::Attached(channel) => ResumeOutcome::Attached(channel),
            Handoff::AlreadyActive(id) => ResumeOutcome::AlreadyActive(id),
        }
    }
}

struct CoordinatorInner {
    mux: RequestMultiplexer,
    timeout: Duration,
    generation: AtomicU64,
    slot: Mutex<ResumeSlot>,
}

/// Negotiates reattachment to a server-side stream already in progress.
#[derive(Clone)]
pub struct ResumeCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ResumeCoordinator {
    pub fn new(mux: RequestMultiplexer, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                mux,
                timeout,
                generation: AtomicU64::new(0),
                slot: Mutex::new(ResumeSlot::Idle),
            }),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, ResumeSlot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn phase(&self) -> ResumePhase {
        match &*self.lock_slot() {
            ResumeSlot::Idle => ResumePhase::Idle,
            ResumeSlot::Waiting { generation, .. } => ResumePhase::Waiting {
                generation: *generation,
            },
            ResumeSlot::Resolved { generation } => ResumePhase::Resolved {
                generation: *generation,
            },
            ResumeSlot::TimedOut { generation } => ResumePhase::TimedOut {
                generation: *generation,
            },
        }
    }

    /// Ask the server whether a stream is in flight. Resolves with the
    /// attached stream, or `None` when there is nothing to resume.
    pub async fn resume(&self) -> Option<StreamChannel> {
        self.resume_with_outcome().await.into_stream()
    }

    pub async fn resume_with_outcome(&self) -> ResumeOutcome {
        let (resolver, mut receiver) = oneshot::channel();
        let deadline = Instant::now() + self.inner.timeout;

        let generation = {
            let mut slot = self.lock_slot();
            let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
            if let ResumeSlot::Waiting {
                generation: previous,
                ..
            } = &*slot
            {
                debug!(previous, generation, "superseding pending resume");
            }
            *slot = ResumeSlot::Waiting {
                generation,
                resolver,
            };
            generation
        };

        // A failed request is covered by the timeout below.
        self.inner.mux.send_best_effort(ClientFrame::ResumeRequest);
        debug!(generation, "resume requested");

        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(handoff)) => handoff.into(),
            Ok(Err(_)) => {
                tokio::time::sleep_until(deadline).await;
                debug!(generation, "superseded resume expired");
                ResumeOutcome::Superseded
            }
            Err(_) => self.expire(generation, receiver).await,
        }
    }

    async fn expire(
        &self,
        generation: u64,
        mut receiver: oneshot::Receiver<Handoff>,
    ) -> ResumeOutcome {
        let handing_off = {
            let mut slot = self.lock_slot();
            match &*slot {
                ResumeSlot::Waiting { generation: g, .. } if *g == generation => {
                    *slot = ResumeSlot::TimedOut { generation };
                    false
                }
                ResumeSlot::Resolved { generation: g } => *g == generation,
                _ => false,
            }
        };

        // A hand-off that claimed this call before the timer fired always
        // sends or drops the resolver without waiting, so this cannot hang.
        let handoff = if handing_off {
            receiver.await.ok()
        } else {
            receiver.try_recv().ok()
        };
        match handoff {
            Some(handoff) => handoff.into(),
            None => {
                debug!(generation, "no active stream to resume");
                ResumeOutcome::TimedOut
            }
        }
    }

    /// Hand-off called by the inbound dispatcher on `stream_resuming{id}`.
    ///
    /// Returns `false` without side effects when no resume is pending, so the
    /// caller can take its own fallback path. Otherwise consumes the pending
    /// resolver, marks `id` active, sends `resume_ack{id}` and resolves the
    /// waiting resume call.
    pub fn handle_stream_resuming(&self, id: &str) -> bool {
        let (generation, resolver) = {
            let mut slot = self.lock_slot();
            match std::mem::replace(&mut *slot, ResumeSlot::Idle) {
                ResumeSlot::Waiting {
                    generation,
                    resolver,
                } if !resolver.is_closed() => {
                    *slot = ResumeSlot::Resolved { generation };
                    (generation, resolver)
                }
                ResumeSlot::Waiting { generation, .. } => {
                    debug!(generation, "resume caller went away; notification not consumed");
                    return false;
                }
                other => {
                    *slot = other;
                    return false;
                }
            }
        };

        // The slot is released before anything reaches the connection: a
        // connection may deliver inbound frames from inside `send`.
        let id = RequestId::from(id);
        let handoff = match self.inner.mux.attach(id.clone()) {
            Some(channel) => Handoff::Attached(channel),
            None => Handoff::AlreadyActive(id.clone()),
        };
        self.inner.mux.send_best_effort(ClientFrame::resume_ack(id.as_str()));
        info!(request_id = %id, generation, "resuming stream");

        if resolver.send(handoff).is_err() {
            debug!(request_id = %id, "resume caller dropped during hand-off");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionSlot, LoopbackConnection};

    fn coordinator() -> (Arc<LoopbackConnection>, RequestMultiplexer, ResumeCoordinator) {
        let conn = LoopbackConnection::new();
        let mux = RequestMultiplexer::new(ConnectionSlot::new(conn.clone()));
        let resume = ResumeCoordinator::new(mux.clone(), DEFAULT_RESUME_TIMEOUT);
        (conn, mux, resume)
    }

    #[test]
    fn hand_off_without_pending_resume_does_nothing() {
        let (conn, mux, resume) = coordinator();
        assert!(!resume.handle_stream_resuming("srv-1"));
        assert!(conn.sent().is_empty());
        assert!(mux.active_ids().is_empty());
        assert_eq!(resume.phase(), ResumePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn hand_off_resolves_pending_resume_once() {
        let (conn, mux, resume) = coordinator();
        let pending = tokio::spawn({
            let resume = resume.clone();
            async move { resume.resume().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(conn.sent_of_kind("resume_request").len(), 1);
        assert!(matches!(resume.phase(), ResumePhase::Waiting { .. }));

        assert!(resume.handle_stream_resuming("srv-1"));
        assert!(!resume.handle_stream_resuming("srv-1"));
        assert!(!resume.handle_stream_resuming("srv-2"));

        let channel = pending.await.unwrap().expect("stream attached");
        assert_eq!(channel.id().as_str(), "srv-1");
        assert!(mux.is_active(channel.id()));
        let acks = conn.sent_of_kind("resume_ack");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["id"], "srv-1");
    }

    #[tokio::test(start_paused = true)]
    async fn resume_times_out_and_clears_slot() {
        let (conn, _mux, resume) = coordinator();
        let outcome = resume.resume_with_outcome().await;
        assert!(matches!(outcome, ResumeOutcome::TimedOut));
        assert!(matches!(resume.phase(), ResumePhase::TimedOut { .. }));
        assert!(!resume.handle_stream_resuming("srv-1"));
        assert!(conn.sent_of_kind("resume_ack").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resume_request_falls_back_to_timeout() {
        let (conn, _mux, resume) = coordinator();
        conn.set_closed(true);
        let started = Instant::now();
        assert!(resume.resume().await.is_none());
        assert!(started.elapsed() >= DEFAULT_RESUME_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn hand_off_for_active_id_acks_without_second_stream() {
        let (conn, mux, resume) = coordinator();
        let existing = mux.attach("srv-1".into()).unwrap();
        let pending = tokio::spawn({
            let resume = resume.clone();
            async move { resume.resume_with_outcome().await }
        });
        tokio::task::yield_now().await;

        assert!(resume.handle_stream_resuming("srv-1"));
        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, ResumeOutcome::AlreadyActive(ref id) if id.as_str() == "srv-1"));
        assert_eq!(conn.sent_of_kind("resume_ack").len(), 1);
        assert_eq!(mux.active_ids(), vec![existing.id().clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_always_holds_the_newest_generation() {
        let (conn, _mux, resume) = coordinator();
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let resume = resume.clone();
                tokio::spawn(async move { resume.resume_with_outcome().await })
            })
            .collect();
        tokio::task::yield_now().await;
        assert_eq!(conn.sent_of_kind("resume_request").len(), 3);
        assert_eq!(resume.phase(), ResumePhase::Waiting { generation: 3 });

        assert!(resume.handle_stream_resuming("srv-1"));
        assert_eq!(resume.phase(), ResumePhase::Resolved { generation: 3 });

        let mut outcomes = Vec::new();
        for call in calls {
            outcomes.push(call.await.unwrap());
        }
        assert!(matches!(outcomes[0], ResumeOutcome::Superseded));
        assert!(matches!(outcomes[1], ResumeOutcome::Superseded));
        assert!(matches!(outcomes[2], ResumeOutcome::Attached(_)));
        assert_eq!(conn.sent_of_kind("resume_ack").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_resume_does_not_consume_notification() {
        let (conn, _mux, resume) = coordinator();
        let pending = tokio::spawn({
            let resume = resume.clone();
            async move { resume.resume().await }
        });
        tokio::task::yield_now().await;
        pending.abort();
        let _ = pending.await;

        assert!(!resume.handle_stream_resuming("srv-1"));
        assert!(conn.sent_of_kind("resume_ack").is_empty());
    }
}
