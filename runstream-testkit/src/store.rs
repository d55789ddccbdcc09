use async_trait::async_trait;
use runstream::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// [`InMemoryRunStore`] whose `insert_run` takes a fixed time.
///
/// Tracks how many inserts were in flight at once, which is what batch
/// latency depends on.
pub struct LatencyStore {
    inner: InMemoryRunStore,
    insert_latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    inserts: AtomicUsize,
}

impl LatencyStore {
    pub fn new(insert_latency: Duration) -> Self {
        Self {
            inner: InMemoryRunStore::new(),
            insert_latency,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
        }
    }

    /// Largest number of inserts observed in flight together.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryRunStore {
        &self.inner
    }
}

#[async_trait]
impl RunStore for LatencyStore {
    async fn get_thread(&self, thread_id: ThreadId) -> Result<Option<Thread>, StoreError> {
        self.inner.get_thread(thread_id).await
    }

    async fn put_thread(&self, thread: Thread) -> Result<(), StoreError> {
        self.inner.put_thread(thread).await
    }

    async fn delete_thread(&self, thread_id: ThreadId) -> Result<bool, StoreError> {
        self.inner.delete_thread(thread_id).await
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn insert_run(&self, run: Run) -> Result<(), StoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.insert_latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_run(run).await
    }

    async fn transition_run(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<Option<Run>, StoreError> {
        self.inner.transition_run(run_id, from, to).await
    }

    async fn mark_cancel_requested(
        &self,
        run_id: RunId,
        action: CancelAction,
    ) -> Result<Option<Run>, StoreError> {
        self.inner.mark_cancel_requested(run_id, action).await
    }

    async fn delete_run(&self, run_id: RunId) -> Result<bool, StoreError> {
        self.inner.delete_run(run_id).await
    }

    async fn search_runs(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError> {
        self.inner.search_runs(query).await
    }

    async fn find_by_status(&self, filter: StatusFilter) -> Result<Vec<Run>, StoreError> {
        self.inner.find_by_status(filter).await
    }

    async fn put_cron(&self, cron: Cron) -> Result<(), StoreError> {
        self.inner.put_cron(cron).await
    }

    async fn delete_cron(&self, cron_id: CronId) -> Result<bool, StoreError> {
        self.inner.delete_cron(cron_id).await
    }

    async fn search_crons(&self, query: &CronQuery) -> Result<Vec<Cron>, StoreError> {
        self.inner.search_crons(query).await
    }

    async fn count_crons(&self, query: &CronQuery) -> Result<usize, StoreError> {
        self.inner.count_crons(query).await
    }
}
