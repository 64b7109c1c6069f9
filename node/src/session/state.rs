//! Sync session states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a session is in its lifecycle.
///
/// A session starts and ends in `Idle`. `Aborted` is terminal and reachable
/// from every other non-idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Handshaking,
    ExchangingVectors,
    ComputingDelta,
    TransferringDelta,
    Applying,
    Acknowledging,
    Aborted,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl SessionState {
    /// Whether moving to `next` is a legal transition.
    ///
    /// The initiator transfers before it applies, the responder applies
    /// before it transfers, so both orders are accepted.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Handshaking) => true,
            (Aborted, _) | (Idle, _) => false,
            (_, Aborted) => true,
            (Handshaking, ExchangingVectors) => true,
            (ExchangingVectors, ComputingDelta) => true,
            (ComputingDelta, TransferringDelta) | (ComputingDelta, Applying) => true,
            (TransferringDelta, Applying) | (Applying, TransferringDelta) => true,
            (TransferringDelta, Acknowledging) | (Applying, Acknowledging) => true,
            (Acknowledging, Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Handshaking => "handshaking",
            SessionState::ExchangingVectors => "exchanging vectors",
            SessionState::ComputingDelta => "computing delta",
            SessionState::TransferringDelta => "transferring delta",
            SessionState::Applying => "applying",
            SessionState::Acknowledging => "acknowledging",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}
