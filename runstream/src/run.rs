use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;
use uuid::Uuid;

use crate::cancel::CancelAction;
use crate::channel::StreamMode;
use crate::error::RunError;

pub trait EntityId:
    Copy + Eq + Hash + Serialize + DeserializeOwned + Display + Send + Sync + 'static
{
    fn as_uuid(&self) -> Uuid;

    /// Human readable entity name used in error messages.
    fn label() -> &'static str;
}

/// Parse a client-supplied identifier, mapping malformed input to
/// `InvalidArgument` so no lookup is ever attempted with garbage.
pub fn parse_id<T>(raw: &str) -> Result<T, RunError>
where
    T: EntityId + From<Uuid>,
{
    Uuid::parse_str(raw.trim())
        .map(T::from)
        .map_err(|_| RunError::InvalidArgument(format!("invalid {} id: {raw:?}", T::label())))
}

macro_rules! entity_id {
    ($name:ident, $label:literal, $ctor:expr) => {
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self($ctor)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = RunError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_id(s)
            }
        }

        impl EntityId for $name {
            fn as_uuid(&self) -> Uuid {
                self.0
            }

            fn label() -> &'static str {
                $label
            }
        }
    };
}

// Run ids are v7 so that creation order and id order agree for cursoring.
entity_id!(RunId, "run", Uuid::now_v7());
entity_id!(ThreadId, "thread", Uuid::new_v4());
entity_id!(CronId, "cron", Uuid::now_v7());

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Whether moving from `self` to `next` keeps run progress monotonic.
    ///
    /// `pending` may skip straight to `interrupted` (cancelled before a
    /// worker picked it up) or `error` (dispatch failure). Terminal states
    /// have no successors.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Interrupted)
                | (Pending, Error)
                | (Running, Success)
                | (Running, Error)
                | (Running, Timeout)
                | (Running, Interrupted)
        )
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "timeout" => Ok(RunStatus::Timeout),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(RunError::InvalidArgument(format!(
                "unknown run status: {other:?}"
            ))),
        }
    }
}

/// What to do when the target thread of a stateful run does not exist.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfNotExists {
    Create,
    #[default]
    Reject,
}

/// What to do with a create-and-stream/wait run when its client goes away.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDisconnect {
    #[default]
    Continue,
    Cancel,
}

/// Fate of a temporary thread once its run is terminal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCompletion {
    #[default]
    Delete,
    Keep,
}

/// Client payload for creating a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCreate {
    pub assistant_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub stream_mode: Vec<StreamMode>,
    #[serde(default)]
    pub if_not_exists: IfNotExists,
    #[serde(default)]
    pub on_disconnect: OnDisconnect,
    #[serde(default)]
    pub on_completion: OnCompletion,
}

impl RunCreate {
    pub fn new(assistant_id: impl Into<String>) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode.push(mode);
        self
    }

    pub fn with_if_not_exists(mut self, policy: IfNotExists) -> Self {
        self.if_not_exists = policy;
        self
    }

    pub fn with_on_disconnect(mut self, policy: OnDisconnect) -> Self {
        self.on_disconnect = policy;
        self
    }

    pub fn with_on_completion(mut self, policy: OnCompletion) -> Self {
        self.on_completion = policy;
        self
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.assistant_id.trim().is_empty() {
            return Err(RunError::InvalidArgument(
                "assistant_id must not be empty".into(),
            ));
        }
        if !(self.input.is_object() || self.input.is_null()) {
            return Err(RunError::InvalidArgument(
                "input must be a JSON object or null".into(),
            ));
        }
        if !(self.config.is_object() || self.config.is_null()) {
            return Err(RunError::InvalidArgument(
                "config must be a JSON object or null".into(),
            ));
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON encoding of the payload.
    ///
    /// Object keys are ordered by `serde_json::Map`, so two payloads that
    /// differ only in key order share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

/// A creation request as seen by the registry: payload plus addressing.
#[derive(Clone, Debug)]
pub struct RunSubmission {
    pub thread_id: Option<ThreadId>,
    pub run_id: Option<RunId>,
    pub payload: RunCreate,
    pub request_started_at: Option<DateTime<Utc>>,
}

impl RunSubmission {
    /// Run against an existing (or `if_not_exists = create`) thread.
    pub fn stateful(thread_id: ThreadId, payload: RunCreate) -> Self {
        Self {
            thread_id: Some(thread_id),
            run_id: None,
            payload,
            request_started_at: None,
        }
    }

    /// Run against a temporary thread created for it.
    pub fn stateless(payload: RunCreate) -> Self {
        Self {
            thread_id: None,
            run_id: None,
            payload,
            request_started_at: None,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_request_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.request_started_at = Some(at);
        self
    }

    pub fn is_stateless(&self) -> bool {
        self.thread_id.is_none()
    }

    pub fn kind(&self) -> &'static str {
        if self.is_stateless() {
            "stateless"
        } else {
            "stateful"
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub thread_id: ThreadId,
    pub assistant_id: String,
    pub status: RunStatus,
    pub input: Value,
    pub metadata: Map<String, Value>,
    pub config: Value,
    pub stream_mode: Vec<StreamMode>,
    pub fingerprint: String,
    pub temporary: bool,
    pub on_completion: OnCompletion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested: Option<CancelAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_started_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn pending(
        run_id: RunId,
        thread_id: ThreadId,
        payload: &RunCreate,
        temporary: bool,
        request_started_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            thread_id,
            assistant_id: payload.assistant_id.clone(),
            status: RunStatus::Pending,
            input: payload.input.clone(),
            metadata: payload.metadata.clone(),
            config: payload.config.clone(),
            stream_mode: payload.stream_mode.clone(),
            fingerprint: payload.fingerprint(),
            temporary,
            on_completion: payload.on_completion,
            cancel_requested: None,
            created_at: now,
            updated_at: now,
            request_started_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
