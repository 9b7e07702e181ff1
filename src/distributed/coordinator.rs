//! Coordinator side of the commit protocol.
//!
//! For one transaction the [`Coordinator`] fans a vote request out to every
//! participant, decides, appends the decision to its own log and only then
//! broadcasts it. Phase 2 is best effort: a participant that misses the
//! broadcast stays in READY until the transaction is started again, which
//! re-sends the recorded decision. This is the usual blocking limitation of
//! two-phase commit.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::distributed::network::ParticipantClient;
use crate::errors::{PactumError, Result};
use crate::operation::Operation;
use crate::storage::{DurableLog, MemoryLog, WalAction, WalRecord};
use crate::twopc::{Decision, Protocol, TransactionId, Vote};

/// What `tx/start` returns: the decision and every participant's vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub txid: TransactionId,
    pub decision: Decision,
    /// Keyed by [`ParticipantClient::id`]. Empty when the outcome was
    /// recovered from the log rather than produced by this process.
    pub votes: BTreeMap<String, Vote>,
}

/// Diagnostic snapshot returned by the coordinator's status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub node: String,
    /// Transactions run by this process.
    pub tx: BTreeMap<TransactionId, Outcome>,
    /// Every durable decision, including those recovered at startup.
    pub decisions: BTreeMap<TransactionId, Decision>,
}

/// Rounds sent after the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    PreCommit,
    Commit,
    Abort,
}

impl Round {
    fn as_str(&self) -> &'static str {
        match self {
            Round::PreCommit => "PRECOMMIT",
            Round::Commit => "COMMIT",
            Round::Abort => "ABORT",
        }
    }
}

/// Drives transactions against a static set of participants.
pub struct Coordinator {
    node_id: String,
    participants: Vec<Arc<dyn ParticipantClient>>,
    log: Arc<dyn DurableLog>,
    rpc_timeout: Duration,
    decision_delay: Duration,
    decisions: Mutex<HashMap<TransactionId, Decision>>,
    outcomes: Mutex<BTreeMap<TransactionId, Outcome>>,
    in_flight: Mutex<HashSet<TransactionId>>,
}

impl Coordinator {
    /// Rebuilds the decision table from the DECISION records of `log`.
    ///
    /// # Errors
    ///
    /// * [`PactumError::Config`] if two participants share an id.
    /// * [`PactumError::Durability`] if the log cannot be read.
    pub fn recover(
        node_id: impl Into<String>,
        participants: Vec<Arc<dyn ParticipantClient>>,
        log: Arc<dyn DurableLog>,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let node_id = node_id.into();
        let mut ids = HashSet::new();
        for participant in &participants {
            if !ids.insert(participant.id()) {
                return Err(PactumError::Config(format!(
                    "participant {} is listed more than once",
                    participant.id()
                )));
            }
        }
        drop(ids);

        let mut decisions = HashMap::new();
        for record in log.replay()? {
            let record = record?;
            match (record.action, record.decision_token()) {
                (WalAction::Decision, Some(decision)) => {
                    match decisions.get(&record.txid) {
                        Some(first) if *first != decision => warn!(
                            "[{}] conflicting decision {} for {} ignored, keeping {}",
                            node_id, decision, record.txid, first
                        ),
                        Some(_) => {}
                        None => {
                            decisions.insert(record.txid, decision);
                        }
                    }
                }
                (WalAction::Decision, None) => {
                    warn!("[{}] DECISION record without a decision: {}", node_id, record)
                }
                _ => debug!("[{}] ignoring non-coordinator record {}", node_id, record),
            }
        }

        info!(
            "[{}] recovered {} decisions, {} participants",
            node_id,
            decisions.len(),
            participants.len()
        );
        Ok(Self {
            node_id,
            participants,
            log,
            rpc_timeout,
            decision_delay: Duration::ZERO,
            decisions: Mutex::new(decisions),
            outcomes: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// A coordinator whose decisions are not persisted.
    pub fn in_memory(
        node_id: impl Into<String>,
        participants: Vec<Arc<dyn ParticipantClient>>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            participants,
            log: Arc::new(MemoryLog::new()),
            rpc_timeout,
            decision_delay: Duration::ZERO,
            decisions: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Pause between the durable decision and the phase-2 broadcast. Used to
    /// demonstrate crashes in that window.
    pub fn with_decision_delay(mut self, delay: Duration) -> Self {
        self.decision_delay = delay;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Runs one transaction to a decision and broadcasts it.
    ///
    /// A transaction id that already has a durable decision is not voted on
    /// again: the recorded decision is re-broadcast and returned. That
    /// re-broadcast always takes the 2PC path, so a COMMIT is re-sent without
    /// a PRECOMMIT round whatever `protocol` asks for.
    ///
    /// # Errors
    ///
    /// * [`PactumError::TransactionInFlight`] if the same id is already
    ///   being run.
    /// * [`PactumError::Durability`] if the DECISION record could not be
    ///   written. Nothing has been broadcast in that case.
    pub async fn run(
        &self,
        txid: TransactionId,
        op: Operation,
        protocol: Protocol,
    ) -> Result<Outcome> {
        let _guard = InFlightGuard::acquire(&self.in_flight, &txid)?;

        if let Some(decision) = self.decision(&txid) {
            info!(
                "[{}] {} already decided {}, re-broadcasting",
                self.node_id, txid, decision
            );
            self.broadcast(&txid, decision, Protocol::TwoPhase).await;
            let known = self.outcomes.lock().get(&txid).cloned();
            return Ok(known.unwrap_or_else(|| Outcome {
                txid,
                decision,
                votes: BTreeMap::new(),
            }));
        }

        info!("[{}] starting {} ({})", self.node_id, txid, protocol);
        let ballots = self.collect_votes(&txid, &op, protocol).await;
        // Every answer counts, including those from clients sharing an id.
        let decision = Decision::from_votes(ballots.iter().map(|(_, vote)| vote));
        let votes: BTreeMap<String, Vote> = ballots.into_iter().collect();
        info!(
            "[{}] {} votes {:?} -> {}",
            self.node_id, txid, votes, decision
        );

        self.persist_decision(&txid, decision).await?;
        let outcome = Outcome {
            txid: txid.clone(),
            decision,
            votes,
        };
        self.decisions.lock().insert(txid.clone(), decision);
        self.outcomes.lock().insert(txid.clone(), outcome.clone());

        if !self.decision_delay.is_zero() {
            info!(
                "[{}] holding {} for {:?} before broadcast",
                self.node_id, txid, self.decision_delay
            );
            tokio::time::sleep(self.decision_delay).await;
        }

        self.broadcast(&txid, decision, protocol).await;
        Ok(outcome)
    }

    /// The durable decision for `txid`, if any.
    pub fn decision(&self, txid: &TransactionId) -> Option<Decision> {
        self.decisions.lock().get(txid).copied()
    }

    pub fn status(&self) -> CoordinatorStatus {
        let decisions = self
            .decisions
            .lock()
            .iter()
            .map(|(txid, decision)| (txid.clone(), *decision))
            .collect();
        CoordinatorStatus {
            node: self.node_id.clone(),
            tx: self.outcomes.lock().clone(),
            decisions,
        }
    }

    /// Phase 1. Waits for every participant; a failed or late answer is
    /// recorded as NO_TIMEOUT.
    async fn collect_votes(
        &self,
        txid: &TransactionId,
        op: &Operation,
        protocol: Protocol,
    ) -> Vec<(String, Vote)> {
        let calls = self.participants.iter().map(|participant| async move {
            let call = match protocol {
                Protocol::TwoPhase => participant.prepare(txid, op),
                Protocol::ThreePhase => participant.can_commit(txid, op),
            };
            let vote = match timeout(self.rpc_timeout, call).await {
                Ok(Ok(vote)) => vote,
                Ok(Err(e)) => {
                    warn!(
                        "[{}] vote request for {} to {} failed: {}",
                        self.node_id,
                        txid,
                        participant.id(),
                        e
                    );
                    Vote::NoTimeout
                }
                Err(_) => {
                    warn!(
                        "[{}] vote request for {} to {} timed out after {:?}",
                        self.node_id,
                        txid,
                        participant.id(),
                        self.rpc_timeout
                    );
                    Vote::NoTimeout
                }
            };
            (participant.id().to_string(), vote)
        });
        join_all(calls).await
    }

    async fn persist_decision(&self, txid: &TransactionId, decision: Decision) -> Result<()> {
        let log = Arc::clone(&self.log);
        let record = WalRecord::decision(txid, decision);
        tokio::task::spawn_blocking(move || log.append(&record))
            .await
            .map_err(|e| PactumError::Durability(io::Error::other(e)))?
            .inspect_err(|e| {
                warn!(
                    "[{}] could not persist decision for {}: {}",
                    self.node_id, txid, e
                )
            })
    }

    /// Phase 2. Failures are logged and dropped.
    async fn broadcast(&self, txid: &TransactionId, decision: Decision, protocol: Protocol) {
        match decision {
            Decision::Commit => {
                if protocol == Protocol::ThreePhase {
                    self.round(txid, Round::PreCommit).await;
                }
                self.round(txid, Round::Commit).await;
            }
            Decision::Abort => self.round(txid, Round::Abort).await,
        }
    }

    async fn round(&self, txid: &TransactionId, round: Round) {
        let calls = self.participants.iter().map(|participant| async move {
            let call = match round {
                Round::PreCommit => participant.precommit(txid),
                Round::Commit => participant.commit(txid),
                Round::Abort => participant.abort(txid),
            };
            match timeout(self.rpc_timeout, call).await {
                Ok(Ok(state)) => debug!(
                    "[{}] {} {} acknowledged by {}: {}",
                    self.node_id,
                    round.as_str(),
                    txid,
                    participant.id(),
                    state
                ),
                Ok(Err(e)) => warn!(
                    "[{}] {} {} to {} failed: {}",
                    self.node_id,
                    round.as_str(),
                    txid,
                    participant.id(),
                    e
                ),
                Err(_) => warn!(
                    "[{}] {} {} to {} timed out after {:?}",
                    self.node_id,
                    round.as_str(),
                    txid,
                    participant.id(),
                    self.rpc_timeout
                ),
            }
        });
        join_all(calls).await;
    }
}

/// Marks a transaction id as being run until dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<TransactionId>>,
    txid: TransactionId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<TransactionId>>, txid: &TransactionId) -> Result<Self> {
        if !set.lock().insert(txid.clone()) {
            return Err(PactumError::TransactionInFlight(txid.clone()));
        }
        Ok(Self {
            set,
            txid: txid.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.txid);
    }
}
