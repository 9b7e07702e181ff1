use serde::{Deserialize, Serialize};

use crate::twopc::TransactionId;

/// A stored value together with the transaction that last wrote it.
///
/// `version` counts how many committed transactions have written the key,
/// which makes a double application of the same commit observable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    value: String,
    version: u64,
    written_by: TransactionId,
}

impl VersionedValue {
    pub fn new(value: String, version: u64, written_by: TransactionId) -> Self {
        Self {
            value,
            version,
            written_by,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn written_by(&self) -> &TransactionId {
        &self.written_by
    }
}
