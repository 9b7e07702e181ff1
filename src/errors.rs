use thiserror::Error;

use crate::twopc::{TransactionId, TransactionState};

/// Errors surfaced by participants, the coordinator and the durable log.
///
/// Validation failures of an operation have no variant: a malformed operation
/// becomes a NO vote and never crosses the protocol boundary as a fault.
#[derive(Error, Debug)]
pub enum PactumError {
    /// A commit, precommit or abort was requested from a state that does not
    /// allow it. `state` is `None` when the participant never heard of the
    /// transaction.
    #[error("invalid state for {requested} on transaction {txid}: {state:?}")]
    InvalidState {
        txid: TransactionId,
        state: Option<TransactionState>,
        requested: &'static str,
    },

    /// A call between coordinator and participant failed or timed out.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Appending to or syncing the write-ahead log failed.
    #[error("Durability error: {0}")]
    Durability(#[source] std::io::Error),

    #[error("Invalid transaction id: {0:?}")]
    InvalidTransactionId(String),

    #[error("Transaction {0} is already being coordinated")]
    TransactionInFlight(TransactionId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PactumError {
    /// True for the protocol-state rejection a participant sends back on an
    /// incompatible commit/precommit/abort.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, PactumError::InvalidState { .. })
    }
}

impl From<serde_json::Error> for PactumError {
    fn from(err: serde_json::Error) -> Self {
        PactumError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PactumError>;
