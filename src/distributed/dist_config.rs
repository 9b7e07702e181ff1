use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{PactumError, Result};
use crate::participant::Participant;
use crate::storage::{DurableLog, MemoryLog};
use crate::wal::FileLog;

pub const DEFAULT_PARTICIPANT_PORT: u16 = 8001;
pub const DEFAULT_COORDINATOR_PORT: u16 = 8000;
pub const DEFAULT_COORDINATOR_WAL: &str = "/tmp/coord.wal";
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings of one participant process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParticipantConfig {
    pub node_id: String,
    pub listen: SocketAddr,
    /// `None` keeps the log in memory; nothing survives a restart.
    pub wal_path: Option<PathBuf>,
}

impl ParticipantConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PARTICIPANT_PORT)),
            wal_path: None,
        }
    }

    /// Opens the log and replays it.
    pub fn open_participant(&self) -> Result<Participant> {
        Participant::recover(self.node_id.clone(), open_log(self.wal_path.as_ref())?)
    }
}

/// Settings of the coordinator process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub node_id: String,
    pub listen: SocketAddr,
    /// Base URLs of the participants, e.g. `http://127.0.0.1:8001`.
    pub participants: Vec<String>,
    pub wal_path: Option<PathBuf>,
    /// Bound on every coordinator-to-participant call.
    pub rpc_timeout: Duration,
    /// Pause between the durable decision and the broadcast.
    pub decision_delay: Duration,
}

impl CoordinatorConfig {
    pub fn new(node_id: impl Into<String>, participants: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_COORDINATOR_PORT)),
            participants,
            wal_path: Some(PathBuf::from(DEFAULT_COORDINATOR_WAL)),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            decision_delay: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(PactumError::Config(
                "at least one participant is required".to_string(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(PactumError::Config(
                "rpc timeout must be greater than zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for url in &self.participants {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(PactumError::Config(format!(
                    "participant {url:?} is not an http(s) URL"
                )));
            }
            if !seen.insert(url.trim_end_matches('/')) {
                return Err(PactumError::Config(format!("participant {url} listed twice")));
            }
        }
        Ok(())
    }

    /// Validates, opens the decision log and connects HTTP clients to every
    /// participant.
    #[cfg(feature = "distributed")]
    pub fn open_coordinator(&self) -> Result<crate::distributed::coordinator::Coordinator> {
        use crate::distributed::coordinator::Coordinator;
        use crate::distributed::network::{HttpParticipant, ParticipantClient};

        self.validate()?;
        let participants = self
            .participants
            .iter()
            .map(|url| {
                HttpParticipant::new(url.as_str(), self.rpc_timeout)
                    .map(|client| Arc::new(client) as Arc<dyn ParticipantClient>)
            })
            .collect::<Result<Vec<_>>>()?;
        let coordinator = Coordinator::recover(
            self.node_id.clone(),
            participants,
            open_log(self.wal_path.as_ref())?,
            self.rpc_timeout,
        )?;
        Ok(coordinator.with_decision_delay(self.decision_delay))
    }
}

fn open_log(path: Option<&PathBuf>) -> Result<Arc<dyn DurableLog>> {
    Ok(match path {
        Some(path) => Arc::new(FileLog::open(path)?),
        None => Arc::new(MemoryLog::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::twopc::{TransactionId, TransactionState};
    use tempfile::TempDir;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn coordinator_defaults() {
        let config = CoordinatorConfig::new("coord", urls(&["http://127.0.0.1:8001"]));
        assert_eq!(config.listen.port(), 8000);
        assert_eq!(config.rpc_timeout, Duration::from_secs(2));
        assert_eq!(config.wal_path.as_deref(), Some(std::path::Path::new("/tmp/coord.wal")));
        assert!(config.validate().is_ok());
        assert_eq!(ParticipantConfig::new("A").listen.port(), 8001);
    }

    #[test]
    fn validate_rejects_bad_participant_lists() {
        let empty = CoordinatorConfig::new("coord", Vec::new());
        assert!(matches!(empty.validate(), Err(PactumError::Config(_))));

        let twice = CoordinatorConfig::new(
            "coord",
            urls(&["http://127.0.0.1:8001", "http://127.0.0.1:8001/"]),
        );
        assert!(matches!(twice.validate(), Err(PactumError::Config(_))));

        let no_scheme = CoordinatorConfig::new("coord", urls(&["127.0.0.1:8001"]));
        assert!(matches!(no_scheme.validate(), Err(PactumError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = CoordinatorConfig::new("coord", urls(&["http://a:1"]));
        config.rpc_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(PactumError::Config(_))));
    }

    #[test]
    fn participant_reopens_its_wal() {
        let dir = TempDir::new().unwrap();
        let mut config = ParticipantConfig::new("A");
        config.wal_path = Some(dir.path().join("a.wal"));
        let t = TransactionId::new("t1").unwrap();

        {
            let participant = config.open_participant().unwrap();
            participant.prepare(&t, &Operation::set("x", "1")).unwrap();
            participant.commit(&t).unwrap();
        }

        let participant = config.open_participant().unwrap();
        assert_eq!(participant.state(&t), Some(TransactionState::Committed));
        assert_eq!(participant.value("x").as_deref(), Some("1"));
    }

    #[test]
    fn participant_without_wal_starts_empty() {
        let participant = ParticipantConfig::new("A").open_participant().unwrap();
        assert!(participant.status().tx.is_empty());
    }
}
