use serde::{Deserialize, Serialize};

/// Configuration for the supervisor's worker pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Prefix for worker ids; the process id and worker index are appended.
    pub worker_group: String,
    /// Number of runs executed concurrently.
    pub parallelism: usize,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given group name.
    pub fn new(worker_group: impl Into<String>) -> Self {
        Self {
            worker_group: worker_group.into(),
            ..Self::default()
        }
    }

    /// Set the number of concurrent workers.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_group: "runstream".to_string(),
            parallelism: 4,
        }
    }
}
