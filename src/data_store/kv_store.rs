use std::collections::BTreeMap;

use crate::data_store::versioned_value::VersionedValue;
use crate::operation::Command;
use crate::twopc::TransactionId;

/// A participant's application state: a plain key/value map.
///
/// The store has no locking of its own. It lives inside the participant's
/// transaction table and is only touched while that table's lock is held.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, VersionedValue>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed command on behalf of `txid`.
    pub fn apply_effect(&mut self, txid: &TransactionId, command: &Command) {
        match command {
            Command::Set { key, value } => {
                let version = self.data.get(key).map_or(0, VersionedValue::version) + 1;
                self.data.insert(
                    key.clone(),
                    VersionedValue::new(value.clone(), version, txid.clone()),
                );
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&VersionedValue> {
        self.data.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(VersionedValue::value)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Plain `key -> value` view, as reported by the status endpoint.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .map(|(k, v)| (k.clone(), v.value().to_string()))
            .collect()
    }
}
