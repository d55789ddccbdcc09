use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::RunError;
use crate::run::{CronId, RunCreate, ThreadId};
use crate::store::{Cron, CronQuery, RunStore};

/// Client payload for a cron: a run template plus its schedule.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CronCreate {
    /// Standard five-field cron expression, optionally with a seconds field.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub run: RunCreate,
}

impl CronCreate {
    pub fn new(schedule: impl Into<String>, run: RunCreate) -> Self {
        Self {
            schedule: schedule.into(),
            end_time: None,
            run,
        }
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn validate(&self) -> Result<(), RunError> {
        let fields = self.schedule.split_whitespace().count();
        if !(5..=6).contains(&fields) {
            return Err(RunError::InvalidArgument(format!(
                "schedule must have 5 or 6 fields, got {fields}"
            )));
        }
        if let Some(end_time) = self.end_time {
            if end_time <= Utc::now() {
                return Err(RunError::InvalidArgument(
                    "end_time must be in the future".into(),
                ));
            }
        }
        self.run.validate()
    }
}

/// Stores and queries cron records. Nothing here fires them.
pub struct CronRegistry {
    store: Arc<dyn RunStore>,
}

impl CronRegistry {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Persist a cron, optionally bound to an existing thread.
    pub async fn create(&self, thread_id: Option<ThreadId>, request: CronCreate) -> Result<Cron, RunError> {
        request.validate()?;
        if let Some(thread_id) = thread_id {
            if self.store.get_thread(thread_id).await?.is_none() {
                return Err(RunError::thread_not_found(thread_id));
            }
        }

        let payload = serde_json::to_value(&request.run)
            .map_err(|err| RunError::Internal(format!("failed to encode cron payload: {err}")))?;
        let now = Utc::now();
        let cron = Cron {
            cron_id: CronId::new(),
            thread_id,
            assistant_id: request.run.assistant_id,
            schedule: request.schedule,
            end_time: request.end_time,
            payload,
            created_at: now,
            updated_at: now,
        };
        self.store.put_cron(cron.clone()).await?;
        info!(
            cron_id = %cron.cron_id,
            assistant_id = %cron.assistant_id,
            schedule = %cron.schedule,
            "Created cron"
        );
        Ok(cron)
    }

    pub async fn search(&self, query: &CronQuery) -> Result<Vec<Cron>, RunError> {
        Ok(self.store.search_crons(query).await?)
    }

    pub async fn count(&self, query: &CronQuery) -> Result<usize, RunError> {
        Ok(self.store.count_crons(query).await?)
    }

    pub async fn delete(&self, cron_id: CronId) -> Result<(), RunError> {
        if self.store.delete_cron(cron_id).await? {
            info!(cron_id = %cron_id, "Deleted cron");
            Ok(())
        } else {
            Err(RunError::NotFound(format!("cron {cron_id} not found")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRunStore;
    use crate::thread::Thread;

    fn registry() -> (CronRegistry, Arc<InMemoryRunStore>) {
        let store = Arc::new(InMemoryRunStore::new());
        (CronRegistry::new(store.clone()), store)
    }

    #[test]
    fn schedule_field_count_is_checked() {
        assert!(CronCreate::new("*/5 * * * *", RunCreate::new("agent")).validate().is_ok());
        assert!(CronCreate::new("0 */5 * * * *", RunCreate::new("agent")).validate().is_ok());
        let err = CronCreate::new("hourly", RunCreate::new("agent"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument(_)));
    }

    #[test]
    fn past_end_time_is_rejected() {
        let request = CronCreate::new("* * * * *", RunCreate::new("agent"))
            .with_end_time(Utc::now() - chrono::Duration::hours(1));
        assert!(request.validate().is_err());
    }

    #[tokio::test]
    async fn create_search_count_delete() {
        let (crons, store) = registry();
        let thread = Thread::new(ThreadId::new());
        store.put_thread(thread.clone()).await.unwrap();

        let bound = crons
            .create(
                Some(thread.thread_id),
                CronCreate::new("0 9 * * 1", RunCreate::new("agent")),
            )
            .await
            .unwrap();
        crons
            .create(None, CronCreate::new("0 9 * * 1", RunCreate::new("other")))
            .await
            .unwrap();

        let query = CronQuery {
            thread_id: Some(thread.thread_id),
            ..CronQuery::default()
        };
        assert_eq!(crons.count(&query).await.unwrap(), 1);
        assert_eq!(crons.search(&query).await.unwrap()[0].cron_id, bound.cron_id);
        assert_eq!(crons.count(&CronQuery::default()).await.unwrap(), 2);

        crons.delete(bound.cron_id).await.unwrap();
        assert!(matches!(
            crons.delete(bound.cron_id).await,
            Err(RunError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_thread_is_not_found() {
        let (crons, _) = registry();
        let err = crons
            .create(
                Some(ThreadId::new()),
                CronCreate::new("* * * * *", RunCreate::new("agent")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));
    }
}
