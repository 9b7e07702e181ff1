//! Rebuilding a participant from its write-ahead log.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::errors::Result;
use crate::participant::{Participant, ParticipantTable, TransactionEntry};
use crate::storage::{DurableLog, WalAction, WalRecord};
use crate::twopc::{TransactionState, Vote};

impl Participant {
    /// Replays `log` from the beginning and returns a participant whose table
    /// and store match the state before the last shutdown or crash.
    ///
    /// Must run before the participant serves any request. Committed
    /// operations are applied once during the scan and never again.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PactumError::Durability`] if the log cannot be read.
    pub fn recover(node_id: impl Into<String>, log: Arc<dyn DurableLog>) -> Result<Self> {
        let node_id = node_id.into();
        let mut table = ParticipantTable::default();
        let mut replayed = 0usize;

        for record in log.replay()? {
            table.replay_record(record?);
            replayed += 1;
        }

        info!(
            "[{}] recovered {} log records: {} transactions, {} keys",
            node_id,
            replayed,
            table.transactions.len(),
            table.store.len()
        );
        Ok(Participant::from_parts(node_id, log, table))
    }
}

impl ParticipantTable {
    /// Applies one record. Later records for the same id override earlier
    /// ones, except that a terminal state is never left.
    fn replay_record(&mut self, record: WalRecord) {
        let txid = record.txid.clone();
        match record.action {
            WalAction::Prepare | WalAction::CanCommit => {
                if self.transactions.contains_key(&txid) {
                    debug!("replay: duplicate vote record for {}", txid);
                    return;
                }
                let vote = record.vote_token().unwrap_or(Vote::No);
                let command = if vote.is_yes() {
                    record.operation().and_then(|op| op.validate())
                } else {
                    None
                };
                if vote.is_yes() && command.is_none() {
                    warn!("replay: YES vote for {} without a usable operation", txid);
                }
                let state = if vote.is_yes() {
                    TransactionState::Ready
                } else {
                    TransactionState::Aborted
                };
                self.transactions
                    .insert(txid, TransactionEntry::voted(state, vote, command));
            }
            WalAction::PreCommit => match self.transactions.get_mut(&txid) {
                Some(entry) if entry.state == TransactionState::Ready => {
                    entry.state = TransactionState::PreCommit;
                }
                _ => debug!("replay: PRECOMMIT for {} ignored", txid),
            },
            WalAction::Commit => match self.transactions.get_mut(&txid) {
                Some(entry) if !entry.state.is_terminal() => match &entry.command {
                    Some(command) => {
                        self.store.apply_effect(&txid, command);
                        entry.state = TransactionState::Committed;
                    }
                    None => warn!("replay: COMMIT for {} has no operation to apply", txid),
                },
                Some(entry) => debug!("replay: COMMIT for {} already {}", txid, entry.state),
                None => warn!("replay: COMMIT for unknown transaction {}", txid),
            },
            WalAction::Abort => {
                let entry = self
                    .transactions
                    .entry(txid)
                    .or_insert_with(TransactionEntry::aborted_unprepared);
                if entry.state != TransactionState::Committed {
                    entry.state = TransactionState::Aborted;
                    entry.command = None;
                }
            }
            WalAction::Decision => debug!("replay: coordinator record for {} ignored", txid),
        }
    }
}
