use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Backend-assigned job identifier, opaque to callers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Broker token required to acknowledge or modify one received message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    /// Generate a new unique receipt handle
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReceiptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReceiptHandle {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for ReceiptHandle {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}
