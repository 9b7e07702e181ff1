use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The only operation type participants accept.
pub const SET_OPERATION: &str = "SET";

/// An operation payload exactly as a client sent it.
///
/// Payloads are opaque until a participant validates them during prepare, so
/// this type accepts any JSON value. A malformed payload is not a
/// deserialization failure: it turns into a NO vote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation(Value);

impl Operation {
    /// Builds a well-formed `SET key = value` payload.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(SET_OPERATION.to_string()));
        object.insert("key".to_string(), Value::String(key.into()));
        object.insert("value".to_string(), Value::String(value.into()));
        Self(Value::Object(object))
    }

    pub fn from_json(value: Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    /// Checks the payload against the operation schema.
    ///
    /// The schema requires `type == "SET"` and a non-empty string `key`.
    /// `value` is optional; strings are taken verbatim, any other JSON value
    /// is stored as its JSON text and a missing value is the empty string.
    pub fn validate(&self) -> Option<Command> {
        let object = self.0.as_object()?;
        if object.get("type").and_then(Value::as_str) != Some(SET_OPERATION) {
            return None;
        }
        let key = object.get("key").and_then(Value::as_str).filter(|k| !k.is_empty())?;
        let value = match object.get("value") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        Some(Command::Set {
            key: key.to_string(),
            value,
        })
    }
}

impl From<&Command> for Operation {
    fn from(command: &Command) -> Self {
        match command {
            Command::Set { key, value } => Operation::set(key.clone(), value.clone()),
        }
    }
}

/// A validated operation, ready to be applied to a participant's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set { key: String, value: String },
}

impl Command {
    /// The key the command mutates.
    pub fn target(&self) -> &str {
        match self {
            Command::Set { key, .. } => key,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Set { key, value } => write!(f, "SET {key}={value}"),
        }
    }
}
