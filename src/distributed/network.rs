use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{PactumError, Result};
use crate::operation::Operation;
use crate::twopc::{TransactionId, TransactionState, TwoPhaseCommitParticipant, Vote};

/// The coordinator's handle on one participant.
///
/// Each method is one protocol call. Any `Err` other than
/// [`PactumError::InvalidState`] is a transport-level failure from the
/// coordinator's point of view.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Stable identifier used as the key of the coordinator's vote map.
    fn id(&self) -> &str;

    async fn prepare(&self, txid: &TransactionId, op: &Operation) -> Result<Vote>;

    async fn can_commit(&self, txid: &TransactionId, op: &Operation) -> Result<Vote>;

    async fn precommit(&self, txid: &TransactionId) -> Result<TransactionState>;

    async fn commit(&self, txid: &TransactionId) -> Result<TransactionState>;

    async fn abort(&self, txid: &TransactionId) -> Result<TransactionState>;
}

/// A participant living in the same process as the coordinator.
///
/// Calls run on the blocking pool because every participant transition ends
/// in an fsync.
pub struct LocalParticipant<P> {
    id: String,
    inner: Arc<P>,
}

impl<P> LocalParticipant<P>
where
    P: TwoPhaseCommitParticipant + 'static,
{
    pub fn new(id: impl Into<String>, inner: Arc<P>) -> Self {
        Self {
            id: id.into(),
            inner,
        }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&P) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| {
                PactumError::Transport(format!("participant {} task failed: {}", self.id, e))
            })?
    }
}

#[async_trait]
impl<P> ParticipantClient for LocalParticipant<P>
where
    P: TwoPhaseCommitParticipant + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn prepare(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
        let (txid, op) = (txid.clone(), op.clone());
        self.call(move |p| p.prepare_transaction(&txid, &op)).await
    }

    async fn can_commit(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
        let (txid, op) = (txid.clone(), op.clone());
        self.call(move |p| p.can_commit_transaction(&txid, &op)).await
    }

    async fn precommit(&self, txid: &TransactionId) -> Result<TransactionState> {
        let txid = txid.clone();
        self.call(move |p| p.precommit_transaction(&txid)).await
    }

    async fn commit(&self, txid: &TransactionId) -> Result<TransactionState> {
        let txid = txid.clone();
        self.call(move |p| p.commit_transaction(&txid)).await
    }

    async fn abort(&self, txid: &TransactionId) -> Result<TransactionState> {
        let txid = txid.clone();
        self.call(move |p| p.abort_transaction(&txid)).await
    }
}

#[cfg(feature = "distributed")]
pub use http::HttpParticipant;

#[cfg(feature = "distributed")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde::Serialize;
    use serde::de::DeserializeOwned;

    use super::ParticipantClient;
    use crate::distributed::messages::{
        ErrorResponse, PrepareRequest, StateResponse, TxidRequest, VoteResponse,
    };
    use crate::errors::{PactumError, Result};
    use crate::operation::Operation;
    use crate::twopc::{TransactionId, TransactionState, Vote};

    /// A remote participant reached over HTTP/JSON.
    pub struct HttpParticipant {
        base_url: String,
        client: reqwest::Client,
    }

    impl HttpParticipant {
        /// Creates a client for the participant at `base_url`. Every request
        /// is bounded by `timeout`.
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PactumError::Config(format!("failed to create HTTP client: {e}")))?;
            Ok(Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                client,
            })
        }

        async fn post<B, T>(
            &self,
            path: &str,
            txid: &TransactionId,
            body: &B,
            requested: &'static str,
        ) -> Result<T>
        where
            B: Serialize + Sync,
            T: DeserializeOwned + Send,
        {
            let url = format!("{}{}", self.base_url, path);
            let response = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| PactumError::Transport(format!("POST {url}: {e}")))?;

            let status = response.status();
            if status.is_success() {
                return response.json::<T>().await.map_err(|e| {
                    PactumError::Transport(format!("POST {url}: bad response body: {e}"))
                });
            }

            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::CONFLICT {
                let state = serde_json::from_str::<ErrorResponse>(&body)
                    .ok()
                    .and_then(|e| e.state);
                return Err(PactumError::InvalidState {
                    txid: txid.clone(),
                    state,
                    requested,
                });
            }
            Err(PactumError::Transport(format!(
                "POST {url} returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )))
        }

        async fn vote(&self, path: &str, txid: &TransactionId, op: &Operation) -> Result<Vote> {
            let request = PrepareRequest {
                txid: txid.to_string(),
                op: op.clone(),
            };
            let response: VoteResponse = self.post(path, txid, &request, "prepare").await?;
            Ok(response.vote)
        }

        async fn transition(
            &self,
            path: &str,
            txid: &TransactionId,
            requested: &'static str,
        ) -> Result<TransactionState> {
            let request = TxidRequest {
                txid: txid.to_string(),
            };
            let response: StateResponse = self.post(path, txid, &request, requested).await?;
            Ok(response.state)
        }
    }

    #[async_trait]
    impl ParticipantClient for HttpParticipant {
        fn id(&self) -> &str {
            &self.base_url
        }

        async fn prepare(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
            self.vote("/prepare", txid, op).await
        }

        async fn can_commit(&self, txid: &TransactionId, op: &Operation) -> Result<Vote> {
            self.vote("/can_commit", txid, op).await
        }

        async fn precommit(&self, txid: &TransactionId) -> Result<TransactionState> {
            self.transition("/precommit", txid, "precommit").await
        }

        async fn commit(&self, txid: &TransactionId) -> Result<TransactionState> {
            self.transition("/commit", txid, "commit").await
        }

        async fn abort(&self, txid: &TransactionId) -> Result<TransactionState> {
            self.transition("/abort", txid, "abort").await
        }
    }
}
