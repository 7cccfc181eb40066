//! Controller settings read from `KEEL_*` environment variables.

use std::time::Duration;

use keel_core::Backoff;
use keel_rollout::Deadlines;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).filter(|s| *s > 0).map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers.
    pub workers: usize,
    /// Requeue delay while workloads are not healthy yet.
    pub health_requeue: Duration,
    /// Requeue delay while a rollout batch waits on the cluster.
    pub rollout_poll: Duration,
    pub rollout_stuck_after: Option<Duration>,
    pub rollout_batch_timeout: Option<Duration>,
    /// Revisions kept per application when pruning.
    pub revision_history: usize,
    /// Attempts for optimistic read-modify-write cycles.
    pub retry_steps: u32,
    /// Work queue capacity; the oldest pending key is dropped beyond it.
    pub queue_cap: usize,
    /// Namespace holding definitions shared by every application.
    pub definition_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            health_requeue: Duration::from_secs(10),
            rollout_poll: Duration::from_secs(5),
            rollout_stuck_after: None,
            rollout_batch_timeout: None,
            revision_history: 10,
            retry_steps: 5,
            queue_cap: 2048,
            definition_namespace: "keel-system".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse("KEEL_WORKERS", d.workers).max(1),
            health_requeue: Duration::from_secs(env_parse("KEEL_HEALTH_REQUEUE_SECS", d.health_requeue.as_secs())),
            rollout_poll: Duration::from_secs(env_parse("KEEL_ROLLOUT_POLL_SECS", d.rollout_poll.as_secs())),
            rollout_stuck_after: env_secs("KEEL_ROLLOUT_STUCK_AFTER_SECS"),
            rollout_batch_timeout: env_secs("KEEL_ROLLOUT_BATCH_TIMEOUT_SECS"),
            revision_history: env_parse("KEEL_REVISION_HISTORY", d.revision_history).max(1),
            retry_steps: env_parse("KEEL_RETRY_STEPS", d.retry_steps).max(1),
            queue_cap: env_parse("KEEL_QUEUE_CAP", d.queue_cap).max(1),
            definition_namespace: std::env::var("KEEL_DEFINITION_NAMESPACE").unwrap_or(d.definition_namespace),
        }
    }

    pub fn backoff(&self) -> Backoff { Backoff::with_steps(self.retry_steps) }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines { stuck_after: self.rollout_stuck_after, batch_timeout: self.rollout_batch_timeout }
    }
}
