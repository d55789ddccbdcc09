use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::channel::{EventChannel, StreamEvent};
use crate::run::RunId;

/// Owns every live [`EventChannel`], keyed by run id.
///
/// Channels are created lazily by whichever side arrives first: a client
/// subscribing before the run exists, or the supervisor opening the run.
/// A channel is retired once it is finished and nobody is attached.
#[derive(Default)]
pub struct StreamBroker {
    channels: Mutex<HashMap<RunId, Arc<EventChannel>>>,
}

impl StreamBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a listener to the run's channel, creating it if needed.
    pub fn subscribe(self: &Arc<Self>, run_id: RunId) -> Subscription {
        let channel = {
            let mut channels = self.channels.lock();
            let channel = Arc::clone(
                channels
                    .entry(run_id)
                    .or_insert_with(|| Arc::new(EventChannel::new(run_id))),
            );
            // Attach under the map lock so retirement cannot slip in between.
            channel.attach();
            channel
        };
        debug!(run_id = %run_id, listeners = channel.listener_count(), "Subscribed to run channel");
        Subscription {
            broker: Arc::clone(self),
            channel,
            cursor: 0,
        }
    }

    /// Publisher-side access: returns the existing channel or creates one.
    pub fn open(&self, run_id: RunId) -> Arc<EventChannel> {
        let mut channels = self.channels.lock();
        Arc::clone(
            channels
                .entry(run_id)
                .or_insert_with(|| Arc::new(EventChannel::new(run_id))),
        )
    }

    pub fn get(&self, run_id: RunId) -> Option<Arc<EventChannel>> {
        self.channels.lock().get(&run_id).cloned()
    }

    /// Finish the run's channel (if any) and retire it when idle.
    pub fn finish(&self, run_id: RunId) {
        if let Some(channel) = self.get(run_id) {
            channel.finish();
        }
        self.retire_if_idle(run_id);
    }

    /// Drop a channel that never saw an event and has no listeners.
    ///
    /// Used when a subscribe-then-create handshake fails at the create step.
    pub fn discard_if_unused(&self, run_id: RunId) -> bool {
        let mut channels = self.channels.lock();
        let unused = channels
            .get(&run_id)
            .is_some_and(|channel| channel.listener_count() == 0 && channel.is_empty());
        if unused {
            channels.remove(&run_id);
        }
        unused
    }

    pub fn retire_if_idle(&self, run_id: RunId) -> bool {
        let mut channels = self.channels.lock();
        let idle = channels
            .get(&run_id)
            .is_some_and(|channel| channel.is_finished() && channel.listener_count() == 0);
        if idle {
            channels.remove(&run_id);
            debug!(run_id = %run_id, "Retired run channel");
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A listener registration on one run's channel.
///
/// Dropping it detaches the listener; the channel itself survives until it is
/// both finished and listener-free.
pub struct Subscription {
    broker: Arc<StreamBroker>,
    channel: Arc<EventChannel>,
    cursor: u64,
}

impl Subscription {
    pub fn run_id(&self) -> RunId {
        self.channel.run_id()
    }

    pub fn channel(&self) -> &Arc<EventChannel> {
        &self.channel
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Start the replay after `cursor` (e.g. a client's `Last-Event-ID`).
    pub fn resume_from(mut self, cursor: u64) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn events(&self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        self.channel.replay_from(self.cursor)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let run_id = self.channel.run_id();
        let remaining = {
            let _channels = self.broker.channels.lock();
            self.channel.detach()
        };
        if remaining == 0 {
            self.broker.retire_if_idle(run_id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("run_id", &self.run_id())
            .field("cursor", &self.cursor)
            .finish()
    }
}
