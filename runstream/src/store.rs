use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::cancel::{CancelAction, StatusFilter};
use crate::run::{CronId, Run, RunId, RunStatus, ThreadId};
use crate::thread::Thread;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Window over the runs of one thread.
#[derive(Clone, Debug)]
pub struct RunQuery {
    pub thread_id: ThreadId,
    pub status: Option<RunStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl RunQuery {
    pub fn for_thread(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            status: None,
            limit: 10,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_window(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Persisted schedule record. Nothing in this crate fires crons.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cron {
    pub cron_id: CronId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    pub assistant_id: String,
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CronQuery {
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    #[serde(default = "default_cron_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_cron_limit() -> usize {
    10
}

impl Default for CronQuery {
    fn default() -> Self {
        Self {
            assistant_id: None,
            thread_id: None,
            limit: default_cron_limit(),
            offset: 0,
        }
    }
}

impl CronQuery {
    fn matches(&self, cron: &Cron) -> bool {
        self.assistant_id
            .as_deref()
            .map_or(true, |id| cron.assistant_id == id)
            && self.thread_id.map_or(true, |id| cron.thread_id == Some(id))
    }
}

/// Transactional storage for threads, runs and crons.
///
/// Status changes go through [`RunStore::transition_run`], a compare-and-set
/// on the current status, so concurrent writers can never move a run
/// backwards.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_thread(&self, thread_id: ThreadId) -> Result<Option<Thread>, StoreError>;

    async fn put_thread(&self, thread: Thread) -> Result<(), StoreError>;

    /// Delete a thread together with every run that belongs to it.
    async fn delete_thread(&self, thread_id: ThreadId) -> Result<bool, StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    /// Insert a new run; `StoreError::Conflict` if the id is taken.
    async fn insert_run(&self, run: Run) -> Result<(), StoreError>;

    /// Set `to` only if the stored status is still `from`.
    ///
    /// Returns the updated run, or `None` when the run is absent or its
    /// status no longer matches.
    async fn transition_run(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<Option<Run>, StoreError>;

    /// Stamp the cancel action on a run that has not finished yet.
    ///
    /// Returns `None` when the run is missing or already terminal.
    async fn mark_cancel_requested(
        &self,
        run_id: RunId,
        action: CancelAction,
    ) -> Result<Option<Run>, StoreError>;

    async fn delete_run(&self, run_id: RunId) -> Result<bool, StoreError>;

    /// Runs of a thread, newest first.
    async fn search_runs(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError>;

    async fn find_by_status(&self, filter: StatusFilter) -> Result<Vec<Run>, StoreError>;

    async fn put_cron(&self, cron: Cron) -> Result<(), StoreError>;

    async fn delete_cron(&self, cron_id: CronId) -> Result<bool, StoreError>;

    async fn search_crons(&self, query: &CronQuery) -> Result<Vec<Cron>, StoreError>;

    async fn count_crons(&self, query: &CronQuery) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    threads: HashMap<ThreadId, Thread>,
    runs: HashMap<RunId, Run>,
    crons: HashMap<CronId, Cron>,
}

/// Process-local [`RunStore`] used by tests and embedded deployments.
#[derive(Default)]
pub struct InMemoryRunStore {
    state: RwLock<MemoryState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.state.read().runs.len()
    }

    pub fn thread_count(&self) -> usize {
        self.state.read().threads.len()
    }
}

fn newest_first(a: &Run, b: &Run) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.run_id.cmp(&a.run_id))
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get_thread(&self, thread_id: ThreadId) -> Result<Option<Thread>, StoreError> {
        Ok(self.state.read().threads.get(&thread_id).cloned())
    }

    async fn put_thread(&self, thread: Thread) -> Result<(), StoreError> {
        self.state.write().threads.insert(thread.thread_id, thread);
        Ok(())
    }

    async fn delete_thread(&self, thread_id: ThreadId) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let existed = state.threads.remove(&thread_id).is_some();
        state.runs.retain(|_, run| run.thread_id != thread_id);
        Ok(existed)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.state.read().runs.get(&run_id).cloned())
    }

    async fn insert_run(&self, run: Run) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.runs.contains_key(&run.run_id) {
            return Err(StoreError::Conflict(format!("run {}", run.run_id)));
        }
        state.runs.insert(run.run_id, run);
        Ok(())
    }

    async fn transition_run(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<Option<Run>, StoreError> {
        let mut state = self.state.write();
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == from => {
                run.status = to;
                run.updated_at = Utc::now();
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_cancel_requested(
        &self,
        run_id: RunId,
        action: CancelAction,
    ) -> Result<Option<Run>, StoreError> {
        let mut state = self.state.write();
        Ok(state
            .runs
            .get_mut(&run_id)
            .filter(|run| !run.status.is_terminal())
            .map(|run| {
                run.cancel_requested = Some(action);
                run.updated_at = Utc::now();
                run.clone()
            }))
    }

    async fn delete_run(&self, run_id: RunId) -> Result<bool, StoreError> {
        Ok(self.state.write().runs.remove(&run_id).is_some())
    }

    async fn search_runs(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError> {
        let state = self.state.read();
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run.thread_id == query.thread_id)
            .filter(|run| query.status.map_or(true, |status| run.status == status))
            .cloned()
            .collect();
        runs.sort_by(newest_first);
        Ok(runs
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn find_by_status(&self, filter: StatusFilter) -> Result<Vec<Run>, StoreError> {
        let state = self.state.read();
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|run| filter.matches(run.status))
            .cloned()
            .collect();
        runs.sort_by(newest_first);
        Ok(runs)
    }

    async fn put_cron(&self, cron: Cron) -> Result<(), StoreError> {
        self.state.write().crons.insert(cron.cron_id, cron);
        Ok(())
    }

    async fn delete_cron(&self, cron_id: CronId) -> Result<bool, StoreError> {
        Ok(self.state.write().crons.remove(&cron_id).is_some())
    }

    async fn search_crons(&self, query: &CronQuery) -> Result<Vec<Cron>, StoreError> {
        let state = self.state.read();
        let mut crons: Vec<Cron> = state
            .crons
            .values()
            .filter(|cron| query.matches(cron))
            .cloned()
            .collect();
        crons.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.cron_id.cmp(&a.cron_id))
        });
        Ok(crons
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn count_crons(&self, query: &CronQuery) -> Result<usize, StoreError> {
        let state = self.state.read();
        Ok(state.crons.values().filter(|cron| query.matches(cron)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunCreate;
    use serde_json::json;

    fn pending_run(thread_id: ThreadId) -> Run {
        Run::pending(
            RunId::new(),
            thread_id,
            &RunCreate::new("agent"),
            false,
            None,
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryRunStore::new();
        let run = pending_run(ThreadId::new());
        store.insert_run(run.clone()).await.unwrap();
        let err = store.insert_run(run).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryRunStore::new();
        let run = pending_run(ThreadId::new());
        store.insert_run(run.clone()).await.unwrap();

        let running = store
            .transition_run(run.run_id, RunStatus::Pending, RunStatus::Running)
            .await
            .unwrap()
            .expect("pending run should transition");
        assert_eq!(running.status, RunStatus::Running);

        let stale = store
            .transition_run(run.run_id, RunStatus::Pending, RunStatus::Interrupted)
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(
            store.get_run(run.run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn cancel_mark_skips_finished_runs() {
        let store = InMemoryRunStore::new();
        let run = pending_run(ThreadId::new());
        store.insert_run(run.clone()).await.unwrap();

        let marked = store
            .mark_cancel_requested(run.run_id, CancelAction::Interrupt)
            .await
            .unwrap()
            .expect("pending run should be marked");
        assert_eq!(marked.cancel_requested, Some(CancelAction::Interrupt));

        store
            .transition_run(run.run_id, RunStatus::Pending, RunStatus::Interrupted)
            .await
            .unwrap();
        let late = store
            .mark_cancel_requested(run.run_id, CancelAction::Rollback)
            .await
            .unwrap();
        assert!(late.is_none());
        assert_eq!(
            store.get_run(run.run_id).await.unwrap().unwrap().cancel_requested,
            Some(CancelAction::Interrupt)
        );
    }

    #[tokio::test]
    async fn search_orders_newest_first_and_windows() {
        let store = InMemoryRunStore::new();
        let thread_id = ThreadId::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let run = pending_run(thread_id);
            ids.push(run.run_id);
            store.insert_run(run).await.unwrap();
        }
        store.insert_run(pending_run(ThreadId::new())).await.unwrap();

        let page = store
            .search_runs(&RunQuery::for_thread(thread_id).with_window(2, 1))
            .await
            .unwrap();
        let got: Vec<RunId> = page.iter().map(|run| run.run_id).collect();
        assert_eq!(got, vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn deleting_a_thread_removes_its_runs() {
        let store = InMemoryRunStore::new();
        let thread = Thread::temporary(ThreadId::new());
        let thread_id = thread.thread_id;
        store.put_thread(thread).await.unwrap();
        let run = pending_run(thread_id);
        store.insert_run(run.clone()).await.unwrap();

        assert!(store.delete_thread(thread_id).await.unwrap());
        assert!(store.get_run(run.run_id).await.unwrap().is_none());
        assert!(!store.delete_thread(thread_id).await.unwrap());
    }

    #[tokio::test]
    async fn cron_search_and_count_share_filters() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        for assistant in ["a", "a", "b"] {
            store
                .put_cron(Cron {
                    cron_id: CronId::new(),
                    thread_id: None,
                    assistant_id: assistant.to_string(),
                    schedule: "*/5 * * * *".to_string(),
                    end_time: None,
                    payload: json!({}),
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let query = CronQuery {
            assistant_id: Some("a".to_string()),
            ..CronQuery::default()
        };
        assert_eq!(store.count_crons(&query).await.unwrap(), 2);
        assert_eq!(store.search_crons(&query).await.unwrap().len(), 2);
        assert_eq!(store.count_crons(&CronQuery::default()).await.unwrap(), 3);
    }
}
