//! Pactum: atomic state changes across independent nodes with two-phase
//! commit.
//!
//! A [`Coordinator`] collects votes from a static set of participants,
//! durably records the decision and then broadcasts it. Each [`Participant`]
//! runs a per-transaction state machine whose transitions are appended to a
//! write-ahead log before they take effect, and is rebuilt from that log on
//! restart with [`Participant::recover`].

pub mod data_store;
pub mod distributed;
pub mod errors;
pub mod operation;
pub mod participant;
pub mod storage;
pub mod twopc;
pub mod wal;

// Re-export key types and structs for easier access
pub use data_store::kv_store::KvStore;
pub use data_store::versioned_value::VersionedValue;
pub use distributed::coordinator::{Coordinator, CoordinatorStatus, Outcome};
pub use distributed::network::{LocalParticipant, ParticipantClient};
pub use errors::{PactumError, Result};
pub use operation::{Command, Operation};
pub use participant::{Participant, ParticipantStatus, TransactionEntry};
pub use storage::{DurableLog, MemoryLog, WalAction, WalRecord};
pub use twopc::{
    Decision, Protocol, TransactionId, TransactionState, TwoPhaseCommitParticipant, Vote,
};
pub use wal::FileLog;

#[cfg(feature = "distributed")]
pub use distributed::network::HttpParticipant;

/// Pactum Prelude
pub mod prelude {
    pub use crate::distributed::dist_config::*;
    pub use crate::errors::*;
    pub use crate::storage::*;
    pub use crate::*;
}
