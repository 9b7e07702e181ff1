//! JSON bodies exchanged between coordinator, participants and clients.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;
use crate::twopc::{Protocol, TransactionState, Vote};

/// Body of `PREPARE` and `CAN_COMMIT`.
///
/// `txid` stays a plain string here so that a malformed id can be answered
/// with a 400 instead of a body-rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub txid: String,
    #[serde(default)]
    pub op: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote: Vote,
}

/// Body of `PRECOMMIT`, `COMMIT` and `ABORT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxidRequest {
    pub txid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: TransactionState,
}

/// Body of the coordinator's `tx/start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub op: Option<Operation>,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Participant state at the time of a rejected transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TransactionState>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            state: None,
        }
    }
}
