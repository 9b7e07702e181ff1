use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pactum::{
    Coordinator, Decision, DurableLog, FileLog, MemoryLog, Operation, PactumError, Participant,
    ParticipantClient, Protocol, Result, TransactionId, TransactionState, Vote, WalAction,
    WalRecord,
};
use parking_lot::Mutex;
use tempfile::TempDir;

mod common;
use common::{FailingLog, local_client, txid};

const TIMEOUT: Duration = Duration::from_millis(500);

#[test]
fn test_crash_after_durable_commit_replays_effect_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("participant-a.wal");
    let t = txid("t1");

    {
        let participant =
            Participant::recover("A", Arc::new(FileLog::open(&path).unwrap())).unwrap();
        assert_eq!(participant.prepare(&t, &Operation::set("x", "1")).unwrap(), Vote::Yes);
        participant.commit(&t).unwrap();
        // Process dies here, before the COMMIT reply leaves the node.
    }

    let participant = Participant::recover("A", Arc::new(FileLog::open(&path).unwrap())).unwrap();
    assert_eq!(participant.state(&t), Some(TransactionState::Committed));
    let value = participant.versioned_value("x").unwrap();
    assert_eq!(value.value(), "1");
    assert_eq!(value.version(), 1);
    assert_eq!(value.written_by(), &t);

    // The coordinator's retry of COMMIT is refused; nothing is applied twice.
    assert!(participant.commit(&t).unwrap_err().is_invalid_state());
    assert_eq!(participant.versioned_value("x").unwrap().version(), 1);

    // A second restart is still idempotent.
    drop(participant);
    let participant = Participant::recover("A", Arc::new(FileLog::open(&path).unwrap())).unwrap();
    assert_eq!(participant.versioned_value("x").unwrap().version(), 1);
}

#[test]
fn test_replay_follows_append_order_across_transactions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("participant-b.wal");

    {
        let participant =
            Participant::recover("B", Arc::new(FileLog::open(&path).unwrap())).unwrap();
        for (id, value) in [("t1", "1"), ("t2", "2"), ("t3", "3")] {
            participant.prepare(&txid(id), &Operation::set("x", value)).unwrap();
        }
        participant.commit(&txid("t2")).unwrap();
        participant.commit(&txid("t1")).unwrap();
        participant.abort(&txid("t3")).unwrap();
    }

    let participant = Participant::recover("B", Arc::new(FileLog::open(&path).unwrap())).unwrap();
    let x = participant.versioned_value("x").unwrap();
    assert_eq!(x.value(), "1");
    assert_eq!(x.version(), 2);
    assert_eq!(x.written_by(), &txid("t1"));
    assert_eq!(participant.state(&txid("t3")), Some(TransactionState::Aborted));
}

#[test]
fn test_torn_commit_record_is_treated_as_never_written() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("participant-c.wal");
    let t = txid("t1");

    {
        let participant =
            Participant::recover("C", Arc::new(FileLog::open(&path).unwrap())).unwrap();
        participant.prepare(&t, &Operation::set("x", "1")).unwrap();
    }
    // Crash halfway through writing the COMMIT line.
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"t1 COMM").unwrap();
    drop(file);

    let participant = Participant::recover("C", Arc::new(FileLog::open(&path).unwrap())).unwrap();
    assert_eq!(participant.state(&t), Some(TransactionState::Ready));
    assert_eq!(participant.value("x"), None);

    // The coordinator can still finish the transaction.
    participant.commit(&t).unwrap();
    assert_eq!(participant.value("x").as_deref(), Some("1"));
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.ends_with("t1 COMMIT\n"));
    assert!(!contents.contains("COMMt1"));
}

#[test]
fn test_durability_failure_leaves_participant_state_untouched() {
    let log = Arc::new(FailingLog::new());
    let participant = Participant::recover("A", log.clone()).unwrap();
    let t = txid("t1");

    log.set_failing(true);
    let err = participant.prepare(&t, &Operation::set("x", "1")).unwrap_err();
    assert!(matches!(err, PactumError::Durability(_)));
    assert_eq!(participant.state(&t), None);

    log.set_failing(false);
    assert_eq!(participant.prepare(&t, &Operation::set("x", "1")).unwrap(), Vote::Yes);

    log.set_failing(true);
    assert!(matches!(participant.commit(&t), Err(PactumError::Durability(_))));
    assert_eq!(participant.state(&t), Some(TransactionState::Ready));
    assert_eq!(participant.value("x"), None);
    assert!(matches!(participant.abort(&t), Err(PactumError::Durability(_))));
    assert_eq!(participant.state(&t), Some(TransactionState::Ready));

    log.set_failing(false);
    participant.commit(&t).unwrap();
    assert_eq!(participant.value("x").as_deref(), Some("1"));
    assert_eq!(
        log.records()
            .iter()
            .map(|r| r.action)
            .collect::<Vec<_>>(),
        vec![WalAction::Prepare, WalAction::Commit]
    );
}

/// Captures the coordinator log at the moment phase 2 reaches it.
struct DecisionWatcher {
    log: Arc<MemoryLog>,
    seen_at_commit: Mutex<Option<Vec<WalRecord>>>,
}

#[async_trait]
impl ParticipantClient for DecisionWatcher {
    fn id(&self) -> &str {
        "watcher"
    }

    async fn prepare(&self, _txid: &TransactionId, _op: &Operation) -> Result<Vote> {
        assert!(self.log.is_empty(), "decision written before all votes arrived");
        Ok(Vote::Yes)
    }

    async fn can_commit(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
        self.prepare(txid, op).await
    }

    async fn precommit(&self, _txid: &TransactionId) -> Result<TransactionState> {
        Ok(TransactionState::PreCommit)
    }

    async fn commit(&self, _txid: &TransactionId) -> Result<TransactionState> {
        *self.seen_at_commit.lock() = Some(self.log.records());
        Ok(TransactionState::Committed)
    }

    async fn abort(&self, _txid: &TransactionId) -> Result<TransactionState> {
        Ok(TransactionState::Aborted)
    }
}

#[tokio::test]
async fn test_decision_is_durable_before_phase_two() {
    let log = Arc::new(MemoryLog::new());
    let watcher = Arc::new(DecisionWatcher {
        log: log.clone(),
        seen_at_commit: Mutex::new(None),
    });
    let coordinator = Coordinator::recover(
        "coord",
        vec![watcher.clone() as Arc<dyn ParticipantClient>],
        log.clone(),
        TIMEOUT,
    )
    .unwrap();

    coordinator
        .run(txid("t1"), Operation::set("x", "1"), Protocol::TwoPhase)
        .await
        .unwrap();

    let seen = watcher.seen_at_commit.lock().clone().unwrap();
    assert_eq!(seen, vec![WalRecord::decision(&txid("t1"), Decision::Commit)]);
}

#[tokio::test]
async fn test_coordinator_durability_failure_sends_no_phase_two() {
    let node = Arc::new(Participant::in_memory("A"));
    let log = Arc::new(FailingLog::new());
    let coordinator =
        Coordinator::recover("coord", vec![local_client(&node)], log.clone(), TIMEOUT).unwrap();

    log.set_failing(true);
    let result = coordinator
        .run(txid("t1"), Operation::set("x", "1"), Protocol::TwoPhase)
        .await;

    assert!(matches!(result, Err(PactumError::Durability(_))));
    assert_eq!(coordinator.decision(&txid("t1")), None);
    // The participant voted and is left waiting for a decision.
    assert_eq!(node.state(&txid("t1")), Some(TransactionState::Ready));
    assert_eq!(node.value("x"), None);
}

#[tokio::test]
async fn test_restarted_coordinator_finishes_blocked_participant() {
    let dir = TempDir::new().unwrap();
    let coord_wal = dir.path().join("coord.wal");
    let node = Arc::new(Participant::in_memory("A"));
    let t = txid("t1");

    // Decision is durable, then the coordinator dies before phase 2.
    {
        let log = FileLog::open(&coord_wal).unwrap();
        node.prepare(&t, &Operation::set("x", "1")).unwrap();
        log.append(&WalRecord::decision(&t, Decision::Commit)).unwrap();
    }
    assert_eq!(node.state(&t), Some(TransactionState::Ready));

    let coordinator = Coordinator::recover(
        "coord",
        vec![local_client(&node)],
        Arc::new(FileLog::open(&coord_wal).unwrap()),
        TIMEOUT,
    )
    .unwrap();
    assert_eq!(coordinator.decision(&t), Some(Decision::Commit));

    // Starting the transaction again re-sends the recorded decision, even if
    // the request now carries a different operation.
    let outcome = coordinator
        .run(t.clone(), Operation::set("x", "2"), Protocol::TwoPhase)
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Commit);
    assert_eq!(node.state(&t), Some(TransactionState::Committed));
    assert_eq!(node.value("x").as_deref(), Some("1"));
    assert_eq!(
        fs::read_to_string(&coord_wal).unwrap(),
        "t1 DECISION COMMIT\n"
    );
}
