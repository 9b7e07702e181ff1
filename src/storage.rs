use std::fmt;

use log::warn;
use parking_lot::Mutex;

use crate::errors::{PactumError, Result};
use crate::operation::Operation;
use crate::twopc::{Decision, TransactionId, Vote, protocol_tokens};

/// The protocol step a log record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalAction {
    Prepare,
    CanCommit,
    PreCommit,
    Commit,
    Abort,
    /// Coordinator-side global decision.
    Decision,
}

protocol_tokens!(WalAction {
    Prepare => "PREPARE",
    CanCommit => "CAN_COMMIT",
    PreCommit => "PRECOMMIT",
    Commit => "COMMIT",
    Abort => "ABORT",
    Decision => "DECISION",
});

/// One line of a node's write-ahead log: `<txid> <ACTION> [detail]`.
///
/// The detail is action specific:
///
/// * `PREPARE` / `CAN_COMMIT`: the vote token, followed for a YES vote by the
///   compact JSON of the operation so replay can re-apply it.
/// * `DECISION`: the decision token.
/// * everything else: empty.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub txid: TransactionId,
    pub action: WalAction,
    pub detail: String,
}

impl WalRecord {
    /// A PREPARE or CAN_COMMIT record.
    pub fn vote(
        txid: &TransactionId,
        action: WalAction,
        vote: Vote,
        op: Option<&Operation>,
    ) -> Result<Self> {
        let detail = match op {
            Some(op) => format!("{} {}", vote, serde_json::to_string(op)?),
            None => vote.to_string(),
        };
        Ok(Self {
            txid: txid.clone(),
            action,
            detail,
        })
    }

    pub fn decision(txid: &TransactionId, decision: Decision) -> Self {
        Self {
            txid: txid.clone(),
            action: WalAction::Decision,
            detail: decision.to_string(),
        }
    }

    /// A record without detail (PRECOMMIT, COMMIT, ABORT).
    pub fn marker(txid: &TransactionId, action: WalAction) -> Self {
        Self {
            txid: txid.clone(),
            action,
            detail: String::new(),
        }
    }

    /// Renders the record as a single line, without the terminating newline.
    pub fn encode(&self) -> String {
        if self.detail.is_empty() {
            format!("{} {}", self.txid, self.action)
        } else {
            format!("{} {} {}", self.txid, self.action, self.detail)
        }
    }

    /// Parses one line produced by [`WalRecord::encode`]. A trailing newline
    /// is tolerated.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut fields = line.splitn(3, char::is_whitespace);
        let txid = fields.next().unwrap_or_default();
        let action = fields
            .next()
            .ok_or_else(|| PactumError::Serialization(format!("missing action in {line:?}")))?;
        let detail = fields.next().unwrap_or_default().trim().to_string();
        Ok(Self {
            txid: TransactionId::new(txid)?,
            action: action.parse()?,
            detail,
        })
    }

    /// The vote carried by a PREPARE / CAN_COMMIT record.
    pub fn vote_token(&self) -> Option<Vote> {
        match self.action {
            WalAction::Prepare | WalAction::CanCommit => {
                self.detail.split_whitespace().next()?.parse().ok()
            }
            _ => None,
        }
    }

    /// The operation carried by a YES PREPARE / CAN_COMMIT record.
    pub fn operation(&self) -> Option<Operation> {
        match self.action {
            WalAction::Prepare | WalAction::CanCommit => {
                let (_, json) = self.detail.split_once(char::is_whitespace)?;
                serde_json::from_str(json.trim()).ok()
            }
            _ => None,
        }
    }

    /// The decision carried by a DECISION record.
    pub fn decision_token(&self) -> Option<Decision> {
        match self.action {
            WalAction::Decision => self.detail.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A lazy scan over previously appended records, in append order.
pub type Replay<'a> = Box<dyn Iterator<Item = Result<WalRecord>> + Send + 'a>;

/// Append-only record store backing a node's protocol state.
///
/// The log is the ground truth for recovery: every PREPARE, PRECOMMIT, COMMIT,
/// ABORT and DECISION that ever changed in-memory state has a record here.
/// Records are never mutated, deleted or compacted.
///
/// Implementations must be `Send` and `Sync`; callers serialize appends that
/// belong to the same transaction themselves.
pub trait DurableLog: Send + Sync {
    /// Appends one record and returns only once it is on stable storage.
    ///
    /// # Arguments
    ///
    /// * `record` - The record to append.
    ///
    /// # Errors
    ///
    /// Returns [`PactumError::Durability`] if the write or the sync failed.
    /// The caller must not acknowledge the protocol step the record describes.
    fn append(&self, record: &WalRecord) -> Result<()>;

    /// Starts a fresh scan from the first record.
    ///
    /// Each call returns an independent iterator, so replay can be restarted.
    /// It is a read-only operation and is never run concurrently with
    /// appends for the same node.
    ///
    /// # Errors
    ///
    /// Returns [`PactumError::Durability`] if the log could not be opened.
    /// Read failures during the scan surface as `Err` items.
    fn replay(&self) -> Result<Replay<'_>>;
}

/// A non-durable [`DurableLog`] kept in memory.
///
/// Used for nodes started without a WAL path and in tests. Records are stored
/// in encoded form and go through the same parser as the file log on replay.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Decoded copy of every record appended so far.
    pub fn records(&self) -> Vec<WalRecord> {
        self.lines
            .lock()
            .iter()
            .filter_map(|line| WalRecord::parse(line).ok())
            .collect()
    }
}

impl DurableLog for MemoryLog {
    fn append(&self, record: &WalRecord) -> Result<()> {
        self.lines.lock().push(record.encode());
        Ok(())
    }

    fn replay(&self) -> Result<Replay<'_>> {
        let lines = self.lines.lock().clone();
        Ok(Box::new(lines.into_iter().filter_map(|line| {
            match WalRecord::parse(&line) {
                Ok(record) => Some(Ok(record)),
                Err(e) => {
                    warn!("Skipping malformed log line {:?}: {}", line, e);
                    None
                }
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(s: &str) -> TransactionId {
        TransactionId::new(s).unwrap()
    }

    #[test]
    fn prepare_record_carries_vote_and_operation() {
        let op = Operation::set("x", "hello world");
        let record =
            WalRecord::vote(&txid("t1"), WalAction::Prepare, Vote::Yes, Some(&op)).unwrap();
        let line = record.encode();
        assert!(line.starts_with("t1 PREPARE YES {"));

        let parsed = WalRecord::parse(&line).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.vote_token(), Some(Vote::Yes));
        assert_eq!(parsed.operation(), Some(op));
    }

    #[test]
    fn no_vote_has_no_operation() {
        let record = WalRecord::vote(&txid("t2"), WalAction::CanCommit, Vote::No, None).unwrap();
        assert_eq!(record.encode(), "t2 CAN_COMMIT NO");
        assert_eq!(record.vote_token(), Some(Vote::No));
        assert_eq!(record.operation(), None);
    }

    #[test]
    fn parses_markers_and_decisions() {
        assert_eq!(
            WalRecord::parse("t3 COMMIT\n").unwrap(),
            WalRecord::marker(&txid("t3"), WalAction::Commit)
        );
        let decision = WalRecord::parse("t4 DECISION ABORT").unwrap();
        assert_eq!(decision.decision_token(), Some(Decision::Abort));
        assert_eq!(decision.vote_token(), None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(WalRecord::parse("").is_err());
        assert!(WalRecord::parse("t5").is_err());
        assert!(WalRecord::parse("t5 FROB").is_err());
    }

    #[test]
    fn memory_log_replays_in_order_and_restarts() {
        let log = MemoryLog::new();
        log.append(&WalRecord::marker(&txid("a"), WalAction::Abort)).unwrap();
        log.append(&WalRecord::decision(&txid("b"), Decision::Commit)).unwrap();

        for _ in 0..2 {
            let ids: Vec<String> = log
                .replay()
                .unwrap()
                .map(|r| r.unwrap().txid.to_string())
                .collect();
            assert_eq!(ids, vec!["a", "b"]);
        }
        assert_eq!(log.len(), 2);
    }
}
