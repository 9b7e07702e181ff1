//! Participant side of the commit protocol.
//!
//! A [`Participant`] owns one node's transaction table and key/value store.
//! Every protocol call checks the current state, appends the matching log
//! record and only then performs the in-memory transition, all under the
//! table lock. The lock is never held across network calls.

pub mod recovery;

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::data_store::kv_store::KvStore;
use crate::data_store::versioned_value::VersionedValue;
use crate::errors::{PactumError, Result};
use crate::operation::{Command, Operation};
use crate::storage::{DurableLog, MemoryLog, WalAction, WalRecord};
use crate::twopc::{TransactionId, TransactionState, TwoPhaseCommitParticipant, Vote};

/// What a participant knows about one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub state: TransactionState,
    /// The vote this participant cast. `None` when an ABORT arrived before any
    /// PREPARE.
    pub vote: Option<Vote>,
    /// The validated operation, present for YES votes.
    pub op: Option<Operation>,
    #[serde(skip)]
    command: Option<Command>,
}

impl TransactionEntry {
    fn voted(state: TransactionState, vote: Vote, command: Option<Command>) -> Self {
        Self {
            state,
            vote: Some(vote),
            op: command.as_ref().map(Operation::from),
            command,
        }
    }

    fn aborted_unprepared() -> Self {
        Self {
            state: TransactionState::Aborted,
            vote: None,
            op: None,
            command: None,
        }
    }
}

/// Diagnostic snapshot returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub node: String,
    pub kv: BTreeMap<String, String>,
    pub tx: BTreeMap<TransactionId, TransactionEntry>,
}

#[derive(Default)]
pub(crate) struct ParticipantTable {
    transactions: HashMap<TransactionId, TransactionEntry>,
    store: KvStore,
}

/// A single node's participant state machine.
pub struct Participant {
    node_id: String,
    log: Arc<dyn DurableLog>,
    table: Mutex<ParticipantTable>,
}

impl Participant {
    /// A participant without durable storage. Nothing survives a restart.
    pub fn in_memory(node_id: impl Into<String>) -> Self {
        Self::from_parts(node_id.into(), Arc::new(MemoryLog::new()), ParticipantTable::default())
    }

    pub(crate) fn from_parts(
        node_id: String,
        log: Arc<dyn DurableLog>,
        table: ParticipantTable,
    ) -> Self {
        Self {
            node_id,
            log,
            table: Mutex::new(table),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Phase 1 vote. See [`TwoPhaseCommitParticipant::prepare_transaction`].
    pub fn prepare(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
        self.vote_on(txid, op, WalAction::Prepare)
    }

    /// Three-phase vote; same rules as [`Participant::prepare`].
    pub fn can_commit(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
        self.vote_on(txid, op, WalAction::CanCommit)
    }

    fn vote_on(&self, txid: &TransactionId, op: &Operation, action: WalAction) -> Result<Vote> {
        let mut table = self.table.lock();

        if let Some(entry) = table.transactions.get(txid) {
            let vote = entry.vote.unwrap_or(Vote::No);
            debug!(
                "[{}] {} for known tx {} ({}), repeating vote {}",
                self.node_id, action, txid, entry.state, vote
            );
            return Ok(vote);
        }

        let command = op.validate();
        let (vote, state) = match command {
            Some(_) => (Vote::Yes, TransactionState::Ready),
            None => (Vote::No, TransactionState::Aborted),
        };
        let logged_op = command.as_ref().map(Operation::from);
        self.log
            .append(&WalRecord::vote(txid, action, vote, logged_op.as_ref())?)?;

        table
            .transactions
            .insert(txid.clone(), TransactionEntry::voted(state, vote, command));
        info!("[{}] {} tx {} -> vote {} ({})", self.node_id, action, txid, vote, state);
        Ok(vote)
    }

    /// Moves a READY transaction to PRECOMMIT.
    pub fn precommit(&self, txid: &TransactionId) -> Result<TransactionState> {
        let mut table = self.table.lock();
        let current = table.transactions.get(txid).map(|e| e.state);
        if current != Some(TransactionState::Ready) {
            return Err(self.reject(txid, current, "precommit"));
        }

        self.log.append(&WalRecord::marker(txid, WalAction::PreCommit))?;
        if let Some(entry) = table.transactions.get_mut(txid) {
            entry.state = TransactionState::PreCommit;
        }
        info!("[{}] tx {} -> PRECOMMIT", self.node_id, txid);
        Ok(TransactionState::PreCommit)
    }

    /// Applies the prepared operation and moves to COMMITTED.
    pub fn commit(&self, txid: &TransactionId) -> Result<TransactionState> {
        let mut table = self.table.lock();
        let ParticipantTable {
            transactions,
            store,
        } = &mut *table;

        let entry = match transactions.get_mut(txid) {
            Some(entry)
                if matches!(
                    entry.state,
                    TransactionState::Ready | TransactionState::PreCommit
                ) && entry.command.is_some() =>
            {
                entry
            }
            other => {
                let current = other.map(|e| e.state);
                return Err(self.reject(txid, current, "commit"));
            }
        };

        self.log.append(&WalRecord::marker(txid, WalAction::Commit))?;
        if let Some(command) = &entry.command {
            store.apply_effect(txid, command);
        }
        entry.state = TransactionState::Committed;
        info!("[{}] tx {} -> COMMITTED", self.node_id, txid);
        Ok(TransactionState::Committed)
    }

    /// Moves any non-committed transaction to ABORTED, including ones this
    /// participant never prepared.
    pub fn abort(&self, txid: &TransactionId) -> Result<TransactionState> {
        let mut table = self.table.lock();
        let current = table.transactions.get(txid).map(|e| e.state);
        match current {
            Some(TransactionState::Aborted) => {
                debug!("[{}] tx {} already ABORTED", self.node_id, txid);
                return Ok(TransactionState::Aborted);
            }
            Some(TransactionState::Committed) => {
                return Err(self.reject(txid, current, "abort"));
            }
            Some(TransactionState::Ready | TransactionState::PreCommit) | None => {}
        }

        self.log.append(&WalRecord::marker(txid, WalAction::Abort))?;
        table
            .transactions
            .entry(txid.clone())
            .and_modify(|entry| {
                entry.state = TransactionState::Aborted;
                entry.command = None;
            })
            .or_insert_with(TransactionEntry::aborted_unprepared);
        info!("[{}] tx {} -> ABORTED", self.node_id, txid);
        Ok(TransactionState::Aborted)
    }

    fn reject(
        &self,
        txid: &TransactionId,
        state: Option<TransactionState>,
        requested: &'static str,
    ) -> PactumError {
        warn!(
            "[{}] rejecting {} for tx {} in state {:?}",
            self.node_id, requested, txid, state
        );
        PactumError::InvalidState {
            txid: txid.clone(),
            state,
            requested,
        }
    }

    pub fn state(&self, txid: &TransactionId) -> Option<TransactionState> {
        self.table.lock().transactions.get(txid).map(|e| e.state)
    }

    pub fn entry(&self, txid: &TransactionId) -> Option<TransactionEntry> {
        self.table.lock().transactions.get(txid).cloned()
    }

    /// Current value of `key` in the application state.
    pub fn value(&self, key: &str) -> Option<String> {
        self.table.lock().store.value(key).map(str::to_string)
    }

    pub fn versioned_value(&self, key: &str) -> Option<VersionedValue> {
        self.table.lock().store.get(key).cloned()
    }

    pub fn status(&self) -> ParticipantStatus {
        let table = self.table.lock();
        ParticipantStatus {
            node: self.node_id.clone(),
            kv: table.store.snapshot(),
            tx: table
                .transactions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl TwoPhaseCommitParticipant for Participant {
    fn prepare_transaction(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
        self.prepare(txid, op)
    }

    fn can_commit_transaction(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
        self.can_commit(txid, op)
    }

    fn precommit_transaction(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.precommit(txid)
    }

    fn commit_transaction(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.commit(txid)
    }

    fn abort_transaction(&self, txid: &TransactionId) -> Result<TransactionState> {
        self.abort(txid)
    }
}
