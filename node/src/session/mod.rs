//! Sync sessions.
//!
//! A session runs over one connection and moves both sides through
//! `Idle -> Handshaking -> ExchangingVectors -> ComputingDelta ->
//! TransferringDelta/Applying -> Acknowledging -> Idle`. Any failure before
//! the end moves it to `Aborted`. Operations merged before an abort stay
//! merged, but the sync cursor only advances once both sides acknowledged.

mod driver;
mod manager;
mod protocol;
mod state;

pub use driver::{SessionReport, SyncSession};
pub use manager::{SessionGuard, SessionInfo, SessionManager};
pub use protocol::{into_batches, ProtocolError, SyncMessage};
pub use state::{Role, SessionState};
