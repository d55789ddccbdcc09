use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::run::RunId;

/// Tag carried by every engine event.
///
/// `Error` is the only mode that terminates a channel on publish.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StreamMode {
    Values,
    Updates,
    Messages,
    Custom,
    Events,
    Debug,
    Error,
    Metadata,
    Other(String),
}

impl StreamMode {
    pub fn as_str(&self) -> &str {
        match self {
            StreamMode::Values => "values",
            StreamMode::Updates => "updates",
            StreamMode::Messages => "messages",
            StreamMode::Custom => "custom",
            StreamMode::Events => "events",
            StreamMode::Debug => "debug",
            StreamMode::Error => "error",
            StreamMode::Metadata => "metadata",
            StreamMode::Other(other) => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamMode::Error)
    }
}

impl From<&str> for StreamMode {
    fn from(value: &str) -> Self {
        match value {
            "values" => StreamMode::Values,
            "updates" => StreamMode::Updates,
            "messages" => StreamMode::Messages,
            "custom" => StreamMode::Custom,
            "events" => StreamMode::Events,
            "debug" => StreamMode::Debug,
            "error" => StreamMode::Error,
            "metadata" => StreamMode::Metadata,
            other => StreamMode::Other(other.to_string()),
        }
    }
}

impl From<String> for StreamMode {
    fn from(value: String) -> Self {
        StreamMode::from(value.as_str())
    }
}

impl From<StreamMode> for String {
    fn from(value: StreamMode) -> Self {
        value.as_str().to_string()
    }
}

impl Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Position in the channel, starting at 1.
    pub seq: u64,
    pub mode: StreamMode,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("event channel for run {0} is finished")]
    Finished(RunId),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Tail {
    len: u64,
    finished: bool,
}

/// Append-only event log for a single run.
///
/// One writer (the supervisor's event sink) appends; any number of readers
/// replay from their own cursor. The tail is advertised through a `watch`
/// channel so a caught-up reader parks until the next append or `finish`.
pub struct EventChannel {
    run_id: RunId,
    log: RwLock<Vec<StreamEvent>>,
    tail: watch::Sender<Tail>,
    listeners: AtomicUsize,
    created_at: DateTime<Utc>,
}

impl EventChannel {
    pub fn new(run_id: RunId) -> Self {
        let (tail, _) = watch::channel(Tail::default());
        Self {
            run_id,
            log: RwLock::new(Vec::new()),
            tail,
            listeners: AtomicUsize::new(0),
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Append an event and return its sequence number.
    pub fn publish(&self, mode: StreamMode, payload: Value) -> Result<u64, ChannelError> {
        let mut log = self.log.write();
        let finished = self.tail.borrow().finished;
        if finished {
            return Err(ChannelError::Finished(self.run_id));
        }
        let seq = log.len() as u64 + 1;
        let terminal = mode.is_terminal();
        log.push(StreamEvent { seq, mode, payload });
        // Advertise while still holding the write lock so the tail never regresses.
        self.tail.send_replace(Tail {
            len: seq,
            finished: terminal,
        });
        Ok(seq)
    }

    /// Mark the channel terminal. Returns `false` if it already was.
    pub fn finish(&self) -> bool {
        let _log = self.log.write();
        self.tail.send_if_modified(|tail| {
            if tail.finished {
                false
            } else {
                tail.finished = true;
                true
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.tail.borrow().finished
    }

    pub fn len(&self) -> u64 {
        self.tail.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self) -> usize {
        self.listeners.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the number of listeners left.
    pub(crate) fn detach(&self) -> usize {
        self.listeners.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    /// Events with `seq > cursor` that are in the log right now.
    pub fn events_after(&self, cursor: u64) -> Vec<StreamEvent> {
        let log = self.log.read();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(log.len());
        log[start..].to_vec()
    }

    /// Replay every event after `cursor`, then follow the live tail until the
    /// channel is finished and drained.
    pub fn replay_from(self: &Arc<Self>, cursor: u64) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let channel = Arc::clone(self);
        let mut tail_rx = channel.tail.subscribe();
        async_stream::stream! {
            let mut cursor = cursor;
            loop {
                // Mark the current tail as seen before reading so an append
                // racing with this read still wakes `changed()`.
                let tail = *tail_rx.borrow_and_update();
                if tail.len > cursor {
                    for event in channel.events_after(cursor) {
                        cursor = event.seq;
                        yield event;
                    }
                    continue;
                }
                if tail.finished {
                    break;
                }
                if tail_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("run_id", &self.run_id)
            .field("len", &self.len())
            .field("finished", &self.is_finished())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
