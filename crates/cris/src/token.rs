//! Correlation tokens tie a submission to its validation, execution and events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, creation-timestamped identifier used for log correlation.
///
/// Tokens are immutable and compared by value. They carry no behaviour beyond
/// identity; the runtime only threads them through logs and results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken {
    created_at: DateTime<Utc>,
    id: Uuid,
}

impl CorrelationToken {
    /// Synthesize a fresh token stamped with the current time.
    pub fn new() -> Self {
        Self {
            created_at: Utc::now(),
            id: Uuid::new_v4(),
        }
    }

    /// Adopt an identity created by the caller's tracing context.
    pub fn from_parts(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self { created_at, id }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
