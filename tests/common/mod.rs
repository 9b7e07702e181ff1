//! Common utilities for Pactum integration tests.
#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pactum::storage::Replay;
use pactum::{
    DurableLog, LocalParticipant, MemoryLog, Operation, PactumError, Participant,
    ParticipantClient, Result, TransactionId, TransactionState, Vote, WalRecord,
};
use parking_lot::Mutex;

pub fn txid(s: &str) -> TransactionId {
    TransactionId::new(s).unwrap()
}

// --- FailingLog ---

/// A `MemoryLog` whose appends can be made to fail on demand, standing in for
/// a full or broken disk.
#[derive(Default)]
pub struct FailingLog {
    inner: MemoryLog,
    failing: AtomicBool,
}

impl FailingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<WalRecord> {
        self.inner.records()
    }
}

impl DurableLog for FailingLog {
    fn append(&self, record: &WalRecord) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PactumError::Durability(io::Error::other("injected fsync failure")));
        }
        self.inner.append(record)
    }

    fn replay(&self) -> Result<Replay<'_>> {
        self.inner.replay()
    }
}

// --- ScriptedParticipant ---

/// How a [`ScriptedParticipant`] answers.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Vote with the given value and acknowledge phase 2.
    Vote(Vote),
    /// Never answer a vote request within `Duration`.
    Hang(Duration),
    /// Every call fails with a transport error.
    Unreachable,
    /// Vote YES, then reject every phase-2 call as an invalid state.
    RejectPhaseTwo,
}

/// A participant double that records the calls it receives.
pub struct ScriptedParticipant {
    id: String,
    behavior: Behavior,
    calls: Mutex<Vec<String>>,
}

impl ScriptedParticipant {
    pub fn new(id: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behavior,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Calls received so far, e.g. `["PREPARE t1", "ABORT t1"]`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn vote(&self, call: &str, txid: &TransactionId) -> Result<Vote> {
        self.calls.lock().push(format!("{call} {txid}"));
        match self.behavior {
            Behavior::Vote(vote) => Ok(vote),
            Behavior::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Vote::Yes)
            }
            Behavior::Unreachable => Err(PactumError::Transport("connection refused".into())),
            Behavior::RejectPhaseTwo => Ok(Vote::Yes),
        }
    }

    fn ack(
        &self,
        call: &'static str,
        txid: &TransactionId,
        state: TransactionState,
    ) -> Result<TransactionState> {
        self.calls.lock().push(format!("{call} {txid}"));
        match self.behavior {
            Behavior::Unreachable => Err(PactumError::Transport("connection refused".into())),
            Behavior::RejectPhaseTwo => Err(PactumError::InvalidState {
                txid: txid.clone(),
                state: None,
                requested: call,
            }),
            _ => Ok(state),
        }
    }
}

#[async_trait]
impl ParticipantClient for ScriptedParticipant {
    fn id(&self) -> &str {
        &self.id
    }

    async fn prepare(&self, txid: &TransactionId, _op: &Operation) -> Result<Vote> {
        self.vote("PREPARE", txid).await
    }

    async fn can_commit(&self, txid: &TransactionId, _op: &Operation) -> Result<Vote> {
        self.vote("CAN_COMMIT", txid).await
    }

    async fn precommit(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.ack("PRECOMMIT", txid, TransactionState::PreCommit)
    }

    async fn commit(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.ack("COMMIT", txid, TransactionState::Committed)
    }

    async fn abort(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.ack("ABORT", txid, TransactionState::Aborted)
    }
}

// --- MalformingParticipant ---

/// Forwards to a real participant but replaces the operation of every vote
/// request with one that fails validation.
pub struct MalformingParticipant {
    inner: LocalParticipant<Participant>,
}

impl MalformingParticipant {
    pub fn new(id: &str, participant: Arc<Participant>) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalParticipant::new(id, participant),
        })
    }

    fn malformed() -> Operation {
        Operation::from_json(serde_json::json!({"type": "SET"}))
    }
}

#[async_trait]
impl ParticipantClient for MalformingParticipant {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn prepare(&self, txid: &TransactionId, _op: &Operation) -> Result<Vote> {
        self.inner.prepare(txid, &Self::malformed()).await
    }

    async fn can_commit(&self, txid: &TransactionId, _op: &Operation) -> Result<Vote> {
        self.inner.can_commit(txid, &Self::malformed()).await
    }

    async fn precommit(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.inner.precommit(txid).await
    }

    async fn commit(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.inner.commit(txid).await
    }

    async fn abort(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.inner.abort(txid).await
    }
}

// --- Helper Functions ---

/// In-memory participants with matching in-process clients.
pub fn local_cluster(names: &[&str]) -> (Vec<Arc<Participant>>, Vec<Arc<dyn ParticipantClient>>) {
    let nodes: Vec<Arc<Participant>> = names
        .iter()
        .map(|name| Arc::new(Participant::in_memory(*name)))
        .collect();
    let clients = nodes
        .iter()
        .map(|node| local_client(node))
        .collect();
    (nodes, clients)
}

pub fn local_client(node: &Arc<Participant>) -> Arc<dyn ParticipantClient> {
    Arc::new(LocalParticipant::new(node.node_id().to_string(), Arc::clone(node)))
}
