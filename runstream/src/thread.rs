use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::run::ThreadId;

/// Informational thread status, maintained by the supervisor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Idle,
    Busy,
    Interrupted,
    Error,
}

/// Persistent conversation context that runs execute against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: ThreadId,
    /// Latest state snapshot produced by the engine.
    pub values: Value,
    pub status: ThreadStatus,
    pub metadata: Map<String, Value>,
    pub temporary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(thread_id: ThreadId) -> Self {
        let now = Utc::now();
        Self {
            thread_id,
            values: Value::Object(Map::new()),
            status: ThreadStatus::Idle,
            metadata: Map::new(),
            temporary: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn temporary(thread_id: ThreadId) -> Self {
        Self {
            temporary: true,
            ..Self::new(thread_id)
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_values(mut self, values: Value) -> Self {
        self.values = values;
        self
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
