//! Keel rollout: progressive migration of replicas from a source revision's
//! workload to a target revision's workload in batches.
//!
//! [`Rollout::step`] is level triggered. It reads the workloads, performs at
//! most one transition and reports whether to step again now, later, or never.
//! Rollback is a rollout with source and target swapped.

#![forbid(unsafe_code)]

use keel_core::ResourceRef;
use keel_kubehub::ClusterError;

mod machine;
pub mod plan;
pub mod status;
mod workload;

pub use machine::{Deadlines, Rollout, StepOutcome, CONDITION_ROLLOUT, CONDITION_STUCK};
pub use plan::{default_rollout_plan, source_remaining, BatchSpec, PlanError, RolloutPlan};
pub use status::{BatchRollingState, RollingState, RolloutStatus};
pub use workload::{ClusterWorkload, WorkloadHandle, WorkloadSize};

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("{0} has no scale subresource")]
    NotScalable(ResourceRef),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

impl keel_core::Retryable for RolloutError {
    fn is_conflict(&self) -> bool { matches!(self, RolloutError::Cluster(e) if e.is_conflict()) }
}
