use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{PactumError, Result};
use crate::operation::Operation;

/// A caller-supplied transaction identifier.
///
/// The identifier is the first whitespace-separated field of every log line,
/// so it must be non-empty and must not contain whitespace. Construction
/// through [`TransactionId::new`] (or deserialization) enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(PactumError::InvalidTransactionId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TransactionId {
    type Error = PactumError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TransactionId> for String {
    fn from(value: TransactionId) -> Self {
        value.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates `as_token` plus the `Display`/`FromStr` pair for an enum whose
/// wire token and log token are the same upper-case string.
macro_rules! protocol_tokens {
    ($ty:ident { $($variant:ident => $token:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_token(&self) -> &'static str {
                match self {
                    $($ty::$variant => $token),+
                }
            }
        }

        impl ::std::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_token())
            }
        }

        impl ::std::str::FromStr for $ty {
            type Err = $crate::errors::PactumError;

            fn from_str(s: &str) -> $crate::errors::Result<Self> {
                match s {
                    $($token => Ok($ty::$variant),)+
                    other => Err($crate::errors::PactumError::Serialization(format!(
                        "unknown {} token {:?}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use protocol_tokens;

/// A participant's answer to PREPARE / CAN_COMMIT as recorded by the
/// coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
    /// The participant could not be reached within the RPC timeout. Counts as
    /// a NO for the decision.
    #[serde(rename = "NO_TIMEOUT")]
    NoTimeout,
}

protocol_tokens!(Vote {
    Yes => "YES",
    No => "NO",
    NoTimeout => "NO_TIMEOUT",
});

impl Vote {
    pub fn is_yes(&self) -> bool {
        matches!(self, Vote::Yes)
    }
}

/// The coordinator's global outcome for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "COMMIT")]
    Commit,
    #[serde(rename = "ABORT")]
    Abort,
}

protocol_tokens!(Decision {
    Commit => "COMMIT",
    Abort => "ABORT",
});

impl Decision {
    /// COMMIT iff every vote is exactly YES. An empty vote set aborts.
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        let mut votes = votes.into_iter().peekable();
        if votes.peek().is_none() {
            return Decision::Abort;
        }
        if votes.all(Vote::is_yes) {
            Decision::Commit
        } else {
            Decision::Abort
        }
    }
}

/// Per-participant transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Voted YES, effect not yet applied.
    #[serde(rename = "READY")]
    Ready,
    /// Global commit announced by a three-phase coordinator.
    #[serde(rename = "PRECOMMIT")]
    PreCommit,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

protocol_tokens!(TransactionState {
    Ready => "READY",
    PreCommit => "PRECOMMIT",
    Committed => "COMMITTED",
    Aborted => "ABORTED",
});

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Protocol selector accepted by the coordinator entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "2PC")]
    TwoPhase,
    /// Two-phase voting plus a PRECOMMIT round before COMMIT. Participants do
    /// not run a timeout-driven termination protocol.
    #[serde(rename = "3PC")]
    ThreePhase,
}

protocol_tokens!(Protocol {
    TwoPhase => "2PC",
    ThreePhase => "3PC",
});

/// Trait for a participant in a two-phase commit protocol.
///
/// Every method runs its state check, log append and in-memory transition as
/// one critical section. A method that returns `Ok` has durably recorded the
/// transition it reports; a method that returns
/// [`PactumError::Durability`] has left the in-memory state untouched.
///
/// Implementations must be `Send` and `Sync` so that a single participant can
/// serve concurrent transactions.
pub trait TwoPhaseCommitParticipant: Send + Sync {
    /// Phase 1: validate `op` and vote.
    ///
    /// A valid operation moves the transaction to
    /// [`TransactionState::Ready`] and returns [`Vote::Yes`]; an invalid one
    /// moves it to [`TransactionState::Aborted`] and returns [`Vote::No`].
    /// Repeating the call for a transaction the participant already knows
    /// returns the previously recorded vote without validating again.
    ///
    /// # Errors
    ///
    /// Returns [`PactumError::Durability`] if the vote could not be logged.
    fn prepare_transaction(&self, txid: &TransactionId, op: &Operation) -> Result<Vote>;

    /// Three-phase variant of [`prepare_transaction`]; identical semantics,
    /// logged under its own action.
    ///
    /// [`prepare_transaction`]: TwoPhaseCommitParticipant::prepare_transaction
    fn can_commit_transaction(&self, txid: &TransactionId, op: &Operation) -> Result<Vote>;

    /// Moves a [`TransactionState::Ready`] transaction to
    /// [`TransactionState::PreCommit`].
    ///
    /// # Errors
    ///
    /// [`PactumError::InvalidState`] from any other state.
    fn precommit_transaction(&self, txid: &TransactionId) -> Result<TransactionState>;

    /// Phase 2: apply the prepared operation and move to
    /// [`TransactionState::Committed`].
    ///
    /// # Errors
    ///
    /// [`PactumError::InvalidState`] unless the transaction is `Ready` or
    /// `PreCommit`. This signals a protocol violation, not a retryable
    /// condition.
    fn commit_transaction(&self, txid: &TransactionId) -> Result<TransactionState>;

    /// Phase 2: discard the transaction. Succeeds for unknown transactions and
    /// is a no-op for already aborted ones.
    ///
    /// # Errors
    ///
    /// [`PactumError::InvalidState`] for a committed transaction, whose
    /// terminal state cannot change.
    fn abort_transaction(&self, txid: &TransactionId) -> Result<TransactionState>;
}
