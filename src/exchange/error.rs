//! Exchange error taxonomy.

use thiserror::Error;

/// Failure of a single exchange.
///
/// Peer closure is not represented here: every state maps a closed channel
/// to graceful termination. The site and its log stay usable after a failed
/// exchange; reconnecting is the pairing layer's decision.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// The peer sent a message that is illegal in the current state.
    #[error("protocol violation: unexpected {received} in {state} state")]
    ProtocolViolation {
        received: &'static str,
        state: &'static str,
    },

    /// Raised by transport glue around an exchange; carried through
    /// unchanged so the pairing layer can retry.
    #[error("transport failure: {0}")]
    Transport(String),
}
