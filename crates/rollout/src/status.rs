//! Rollout status as persisted on the AppRollout object.

use chrono::{DateTime, Utc};
use keel_core::Condition;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RollingState {
    #[default]
    Initializing,
    RollingInBatches,
    Finalising,
    RolloutSucceeded,
    RolloutFailed,
}

impl RollingState {
    pub fn is_terminal(self) -> bool { matches!(self, RollingState::RolloutSucceeded | RollingState::RolloutFailed) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BatchRollingState {
    #[default]
    BatchInitializing,
    BatchInRollout,
    BatchVerifying,
    BatchReady,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    #[serde(default)]
    pub rolling_state: RollingState,
    #[serde(default)]
    pub batch_rolling_state: BatchRollingState,
    #[serde(default)]
    pub current_batch: i32,
    #[serde(default)]
    pub upgraded_replicas: i32,
    #[serde(default)]
    pub upgraded_ready_replicas: i32,
    #[serde(default)]
    pub rollout_original_size: i32,
    #[serde(default)]
    pub rollout_target_size: i32,
    #[serde(default)]
    pub last_source_revision: String,
    #[serde(default)]
    pub last_target_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RolloutStatus {
    /// Start over when the revision pair differs from the one recorded, which
    /// is how a rollback (swapped names) restarts the machine. Returns `true`
    /// when the status was reset.
    pub fn retarget(&mut self, source: &str, target: &str) -> bool {
        if self.last_source_revision == source && self.last_target_revision == target {
            return false;
        }
        *self = RolloutStatus {
            last_source_revision: source.to_string(),
            last_target_revision: target.to_string(),
            ..Default::default()
        };
        true
    }
}
