//! The rollout state machine. Each [`Rollout::step`] performs at most one
//! transition against the current cluster state and never sleeps; callers
//! persist the status and call again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::meta::{get_condition, set_condition};
use keel_core::{Condition, ConditionStatus};
use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::plan::{source_remaining, RolloutPlan};
use crate::status::{BatchRollingState, RollingState, RolloutStatus};
use crate::workload::WorkloadHandle;
use crate::RolloutError;

pub const CONDITION_ROLLOUT: &str = "Rollout";
pub const CONDITION_STUCK: &str = "RolloutStuck";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// State moved; step again right away.
    Progressed,
    /// Blocked on the cluster (readiness, pause, partition); poll later.
    Waiting,
    /// Succeeded or failed; nothing left to do.
    Terminal,
}

/// Slowness thresholds for a verifying batch. Neither is set by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadlines {
    /// Raise the `RolloutStuck` condition after this long.
    pub stuck_after: Option<Duration>,
    /// Fail the rollout after this long.
    pub batch_timeout: Option<Duration>,
}

pub struct Rollout<'a> {
    pub plan: &'a RolloutPlan,
    /// Absent when the rollout has no source revision.
    pub source: Option<&'a dyn WorkloadHandle>,
    pub target: &'a dyn WorkloadHandle,
    /// Controller reference of the rollout object; it owns the target while
    /// batches are in flight.
    pub owner: OwnerReference,
    /// Controller handed the target back to once the rollout completes.
    pub release_to: Option<OwnerReference>,
    pub deadlines: Deadlines,
}

impl Rollout<'_> {
    pub async fn step(&self, status: &mut RolloutStatus, now: DateTime<Utc>) -> Result<StepOutcome, RolloutError> {
        match status.rolling_state {
            RollingState::RolloutSucceeded | RollingState::RolloutFailed => Ok(StepOutcome::Terminal),
            RollingState::Initializing => self.initialize(status).await,
            RollingState::RollingInBatches => self.roll(status, now).await,
            RollingState::Finalising => self.finalise(status).await,
        }
    }

    async fn initialize(&self, status: &mut RolloutStatus) -> Result<StepOutcome, RolloutError> {
        let Some(target) = self.target.size().await? else {
            return Ok(fail(status, "TargetMissing", format!("target workload {} not found", self.target.resource())));
        };
        let source = match self.source {
            Some(s) => match s.size().await? {
                Some(sz) => Some(sz),
                None => return Ok(fail(status, "SourceMissing", format!("source workload {} not found", s.resource()))),
            },
            None => None,
        };
        let fallback = source.map_or(target.desired, |s| s.desired);
        let plan = self.plan.finalized(fallback);
        if let Err(e) = plan.validate() {
            return Ok(fail(status, "PlanInvalid", e.to_string()));
        }
        self.target.claim(self.owner.clone()).await?;
        status.rollout_original_size = source.map_or(0, |s| s.desired);
        status.rollout_target_size = plan.target_size.unwrap_or(0);
        status.current_batch = 0;
        status.upgraded_replicas = target.desired;
        status.upgraded_ready_replicas = target.ready;
        status.rolling_state = RollingState::RollingInBatches;
        status.batch_rolling_state = BatchRollingState::BatchInitializing;
        info!(target = %self.target.resource(), size = status.rollout_target_size, batches = plan.batches.len(), "rollout initialized");
        Ok(StepOutcome::Progressed)
    }

    async fn roll(&self, status: &mut RolloutStatus, now: DateTime<Utc>) -> Result<StepOutcome, RolloutError> {
        let Some(target) = self.target.size().await? else {
            return Ok(fail(status, "TargetDeleted", format!("target workload {} disappeared", self.target.resource())));
        };
        let plan = self.plan.finalized(status.rollout_target_size);
        if let Err(e) = plan.validate() {
            return Ok(fail(status, "PlanInvalid", e.to_string()));
        }
        let batch = (status.current_batch.max(0) as usize).min(plan.batches.len() - 1);
        let cumulative = plan.cumulative(batch);
        let last = batch + 1 == plan.batches.len();
        match status.batch_rolling_state {
            BatchRollingState::BatchInitializing => {
                if plan.paused {
                    return Ok(StepOutcome::Waiting);
                }
                status.batch_rolling_state = BatchRollingState::BatchInRollout;
                status.batch_started_at = Some(now);
                Ok(StepOutcome::Progressed)
            }
            BatchRollingState::BatchInRollout => {
                self.target.scale(cumulative).await?;
                if let Some(source) = self.source {
                    let keep = source_remaining(status.rollout_original_size, cumulative, status.rollout_target_size, last);
                    source.scale(keep).await?;
                }
                status.upgraded_replicas = cumulative;
                status.batch_rolling_state = BatchRollingState::BatchVerifying;
                counter!("rollout_batches_total", 1u64);
                info!(target = %self.target.resource(), batch, cumulative, "batch scaled");
                Ok(StepOutcome::Progressed)
            }
            BatchRollingState::BatchVerifying => {
                status.upgraded_ready_replicas = target.ready;
                let waited = status.batch_started_at.map(|t| (now - t).to_std().unwrap_or_default()).unwrap_or_default();
                if target.ready >= cumulative {
                    histogram!("rollout_batch_wait_seconds", waited.as_secs_f64());
                    if get_condition(&status.conditions, CONDITION_STUCK).is_some() {
                        set_condition(&mut status.conditions, Condition::error(CONDITION_STUCK, "BatchReady", ""));
                    }
                    status.batch_rolling_state = BatchRollingState::BatchReady;
                    return Ok(StepOutcome::Progressed);
                }
                if let Some(limit) = self.deadlines.batch_timeout {
                    if waited >= limit {
                        return Ok(fail(status, "BatchTimeout", format!("batch {} not ready after {}s", batch, waited.as_secs())));
                    }
                }
                if let Some(limit) = self.deadlines.stuck_after {
                    if waited >= limit {
                        let stuck = get_condition(&status.conditions, CONDITION_STUCK).map_or(false, Condition::is_true);
                        if !stuck {
                            warn!(target = %self.target.resource(), batch, waited_s = waited.as_secs(), "rollout batch is stuck");
                            histogram!("rollout_batch_wait_seconds", waited.as_secs_f64());
                        }
                        set_condition(
                            &mut status.conditions,
                            Condition {
                                type_: CONDITION_STUCK.to_string(),
                                status: ConditionStatus::True,
                                reason: "BatchNotReady".into(),
                                message: format!("{}/{} replicas ready", target.ready, cumulative),
                                last_transition_time: now,
                            },
                        );
                    }
                }
                Ok(StepOutcome::Waiting)
            }
            BatchRollingState::BatchReady => {
                if let Some(p) = plan.batch_partition {
                    if status.current_batch >= p {
                        return Ok(StepOutcome::Waiting);
                    }
                }
                if plan.paused {
                    return Ok(StepOutcome::Waiting);
                }
                if last {
                    status.rolling_state = RollingState::Finalising;
                } else {
                    status.current_batch += 1;
                    status.batch_rolling_state = BatchRollingState::BatchInitializing;
                }
                Ok(StepOutcome::Progressed)
            }
        }
    }

    async fn finalise(&self, status: &mut RolloutStatus) -> Result<StepOutcome, RolloutError> {
        if let Some(source) = self.source {
            match source.size().await? {
                Some(s) if s.desired != 0 => {
                    source.scale(0).await?;
                    return Ok(StepOutcome::Progressed);
                }
                _ => {}
            }
        }
        if let Some(owner) = &self.release_to {
            self.target.claim(owner.clone()).await?;
        }
        status.rolling_state = RollingState::RolloutSucceeded;
        status.batch_started_at = None;
        let mut done = Condition::ready(CONDITION_ROLLOUT);
        done.reason = "RolloutSucceeded".into();
        set_condition(&mut status.conditions, done);
        counter!("rollout_succeeded_total", 1u64);
        info!(target = %self.target.resource(), "rollout succeeded");
        Ok(StepOutcome::Terminal)
    }
}

fn fail(status: &mut RolloutStatus, reason: &str, message: String) -> StepOutcome {
    warn!(reason, %message, "rollout failed");
    counter!("rollout_failed_total", 1u64);
    status.rolling_state = RollingState::RolloutFailed;
    set_condition(&mut status.conditions, Condition::error(CONDITION_ROLLOUT, reason, message));
    StepOutcome::Terminal
}
