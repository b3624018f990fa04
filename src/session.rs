//! Read-only session view.
//!
//! Session storage is the host application's concern (cookie layer, redis
//! store, whatever it uses). This crate only consumes a narrow view of the
//! established session: the id and a flat value map. The host's session
//! layer attaches a [`Session`] to the request context; the request logger
//! then records the session id and any configured keys.

use std::collections::HashMap;

use serde_json::Value;

/// Snapshot of an established session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    id: String,
    values: HashMap<String, Value>,
}

impl Session {
    /// Create a session view with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: HashMap::new(),
        }
    }

    /// Attach a value (builder style, for session-layer adapters).
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Look up a session value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}
