//! Agent chat command-line client: a chat session over the resumable
//! transport, persisted to a SQLite transcript.

pub mod cli;
pub mod error;
pub mod session;
pub mod store;

pub use cli::CliArgs;
pub use error::{SessionError, StoreError};
pub use session::{CancelHandle, ChatReply, ChatSession, SUBMIT_TRIGGER};
pub use store::SqliteTranscript;
