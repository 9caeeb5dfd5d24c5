//! Agent chat client library: a multiplexed, resumable streaming transport
//! over one duplex connection, and reconciliation of client and server
//! message lists for a durable transcript.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod messages;
pub mod multiplexer;
pub mod reconcile;
pub mod resume;
pub mod stream;
pub mod transcript;
pub mod transport;

pub use client::{connect, connect_transport, ConnectedTransport, LinkState, WsConnection};
pub use config::{default_config_path, Config, LoggingSection, ServerSection, StoreSection, TransportSection};
pub use connection::{Connection, ConnectionSlot, FrameHandler, LoopbackConnection, Subscription};
pub use error::{ClientError, ConfigError, ConnectionError, ProtocolError, StreamError};
pub use multiplexer::{RequestMultiplexer, SendOptions};
pub use reconcile::{reconcile, ReconciliationResult};
pub use resume::{ResumeCoordinator, ResumeOutcome, ResumePhase, DEFAULT_RESUME_TIMEOUT};
pub use stream::{Chunk, RequestId, RequestState, StreamChannel};
pub use transcript::{persist_messages, IdOrigin, MemoryTranscript, Message, Role, TranscriptStore};
pub use transport::{ChatTransport, TransportConfig};
