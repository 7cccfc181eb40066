//! Keel controller: the reconciliation loops that drive Applications and
//! AppRollouts, plus the work queue and manager feeding them.
//!
//! One Application pass renders the spec, mints or reuses a revision,
//! dispatches it, checks workload health and records status. One AppRollout
//! pass steps the rollout state machine until it has to wait on the cluster.
//! Both are level triggered and safe to repeat.

#![forbid(unsafe_code)]

use std::time::Duration;

use keel_appfile::{ParseError, RenderErrors};
use keel_core::Retryable;
use keel_dispatch::DispatchError;
use keel_kubehub::{ClusterError, ObjectKey};
use keel_revision::RevisionError;
use keel_rollout::{RolloutError, RolloutStatus};
use keel_template::TemplateError;
use tokio_util::sync::CancellationToken;

mod config;
mod definitions;
mod health;
pub mod manager;
pub mod model;
mod queue;
mod reconciler;
mod rollout;

pub use config::ControllerConfig;
pub use definitions::Definitions;
pub use health::check_health;
pub use manager::{supervise_watch, Manager, WorkItem};
pub use queue::WorkQueue;
pub use reconciler::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Done,
    After(Duration),
}

impl Requeue {
    pub const NOW: Requeue = Requeue::After(Duration::ZERO);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The spec itself is wrong; retrying cannot help until it changes.
    UserSpec,
    /// Conflicts and transport failures.
    Transient,
    /// A manifest could not be applied or collected.
    Apply,
    /// Only the status write failed.
    StatusPersist,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::UserSpec => "user_spec",
            ErrorClass::Transient => "transient",
            ErrorClass::Apply => "apply",
            ErrorClass::StatusPersist => "status_persist",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Render(#[from] RenderErrors),
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Rollout(#[from] RolloutError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("{key}: {message}")]
    Decode { key: ObjectKey, message: String },
    #[error("{key}: {message}")]
    InvalidSpec { key: ObjectKey, message: String },
    #[error("persist status of {key}: {source}")]
    StatusPersist { key: ObjectKey, source: ClusterError },
    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Template(_)
            | ReconcileError::Parse(_)
            | ReconcileError::Render(_)
            | ReconcileError::Decode { .. }
            | ReconcileError::InvalidSpec { .. } => ErrorClass::UserSpec,
            ReconcileError::Rollout(RolloutError::NotScalable(_) | RolloutError::Plan(_)) => ErrorClass::UserSpec,
            ReconcileError::Dispatch(DispatchError::Apply { .. } | DispatchError::Gc { .. }) => ErrorClass::Apply,
            ReconcileError::Dispatch(DispatchError::InvalidRevision(_)) => ErrorClass::UserSpec,
            ReconcileError::StatusPersist { .. } => ErrorClass::StatusPersist,
            ReconcileError::Revision(_)
            | ReconcileError::Dispatch(_)
            | ReconcileError::Rollout(_)
            | ReconcileError::Cluster(_)
            | ReconcileError::Cancelled => ErrorClass::Transient,
        }
    }
}

impl Retryable for ReconcileError {
    fn is_conflict(&self) -> bool {
        match self {
            ReconcileError::Revision(e) => e.is_conflict(),
            ReconcileError::Dispatch(e) => e.is_conflict(),
            ReconcileError::Rollout(e) => e.is_conflict(),
            ReconcileError::Cluster(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Inward surface of the controller.
#[async_trait::async_trait]
pub trait ControllerApi: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Requeue, ReconcileError>;
    async fn reconcile_rollout(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Requeue, ReconcileError>;
    /// `None` when the AppRollout does not exist.
    async fn rollout_status(&self, key: &ObjectKey) -> Result<Option<RolloutStatus>, ReconcileError>;
}
