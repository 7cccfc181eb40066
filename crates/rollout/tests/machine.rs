#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::meta::get_condition;
use keel_core::{ConditionStatus, ResourceRef};
use keel_kubehub::ClusterError;
use keel_rollout::{
    BatchRollingState, BatchSpec, Deadlines, RollingState, Rollout, RolloutError, RolloutPlan, RolloutStatus, StepOutcome,
    WorkloadHandle, WorkloadSize, CONDITION_ROLLOUT, CONDITION_STUCK,
};

struct Fake {
    r: ResourceRef,
    size: Mutex<Option<WorkloadSize>>,
    auto_ready: Mutex<bool>,
    owner: Mutex<Option<String>>,
    history: Mutex<Vec<i32>>,
}

impl Fake {
    fn new(name: &str, replicas: i32) -> Self {
        Self {
            r: ResourceRef::new("apps/v1", "Deployment", "ns", name),
            size: Mutex::new(Some(WorkloadSize { desired: replicas, ready: replicas })),
            auto_ready: Mutex::new(true),
            owner: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    fn desired(&self) -> i32 { self.size.lock().unwrap().map_or(-1, |s| s.desired) }
    fn set_ready(&self, ready: i32) { if let Some(s) = self.size.lock().unwrap().as_mut() { s.ready = ready; } }
    fn owner(&self) -> Option<String> { self.owner.lock().unwrap().clone() }
    fn history(&self) -> Vec<i32> { self.history.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl WorkloadHandle for Fake {
    fn resource(&self) -> &ResourceRef { &self.r }

    async fn size(&self) -> Result<Option<WorkloadSize>, RolloutError> { Ok(*self.size.lock().unwrap()) }

    async fn scale(&self, replicas: i32) -> Result<(), RolloutError> {
        let auto = *self.auto_ready.lock().unwrap();
        let mut s = self.size.lock().unwrap();
        let Some(s) = s.as_mut() else { return Err(ClusterError::NotFound(self.r.to_string()).into()) };
        s.desired = replicas;
        if auto { s.ready = replicas; }
        self.history.lock().unwrap().push(replicas);
        Ok(())
    }

    async fn claim(&self, owner: OwnerReference) -> Result<(), RolloutError> {
        *self.owner.lock().unwrap() = Some(owner.name);
        Ok(())
    }
}

fn owner(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "core.oam.dev/v1beta1".into(),
        kind: kind.into(),
        name: name.into(),
        uid: format!("uid-{}", name),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn rollout<'a>(plan: &'a RolloutPlan, source: Option<&'a Fake>, target: &'a Fake) -> Rollout<'a> {
    Rollout {
        plan,
        source: source.map(|s| s as &dyn WorkloadHandle),
        target,
        owner: owner("AppRollout", "ro"),
        release_to: Some(owner("ResourceTracker", "app-v2-ns")),
        deadlines: Deadlines::default(),
    }
}

/// Step until the machine stops progressing.
async fn drive(ro: &Rollout<'_>, status: &mut RolloutStatus) -> StepOutcome {
    for _ in 0..200 {
        match ro.step(status, Utc::now()).await.unwrap() {
            StepOutcome::Progressed => continue,
            other => return other,
        }
    }
    panic!("rollout did not settle");
}

#[tokio::test]
async fn five_replicas_in_five_batches() {
    let source = Fake::new("web-v1", 5);
    let target = Fake::new("web-v2", 0);
    let plan = RolloutPlan { num_batches: Some(5), ..Default::default() };
    let ro = rollout(&plan, Some(&source), &target);
    let mut status = RolloutStatus::default();
    status.retarget("app-v1", "app-v2");

    assert_eq!(drive(&ro, &mut status).await, StepOutcome::Terminal);
    assert_eq!(status.rolling_state, RollingState::RolloutSucceeded);
    assert_eq!(target.history(), vec![1, 2, 3, 4, 5]);
    assert_eq!(source.history(), vec![4, 3, 2, 1, 0]);
    assert_eq!(status.rollout_original_size, 5);
    assert_eq!(status.rollout_target_size, 5);
    assert_eq!(status.upgraded_replicas, 5);
    assert_eq!(target.owner().as_deref(), Some("app-v2-ns"));
    assert!(get_condition(&status.conditions, CONDITION_ROLLOUT).unwrap().is_true());
    assert_eq!(drive(&ro, &mut status).await, StepOutcome::Terminal);
}

#[tokio::test]
async fn remainder_goes_to_the_last_batches() {
    let source = Fake::new("web-v1", 8);
    let target = Fake::new("web-v2", 0);
    let plan = RolloutPlan { target_size: Some(8), num_batches: Some(5), ..Default::default() };
    let mut status = RolloutStatus::default();
    drive(&rollout(&plan, Some(&source), &target), &mut status).await;
    assert_eq!(target.history(), vec![1, 2, 4, 6, 8]);
    assert_eq!(source.history(), vec![7, 6, 4, 2, 0]);
}

#[tokio::test]
async fn waits_for_readiness_and_flags_stuck_batches() {
    let target = Fake::new("web-v2", 0);
    *target.auto_ready.lock().unwrap() = false;
    let plan = RolloutPlan { target_size: Some(4), num_batches: Some(2), ..Default::default() };
    let mut ro = rollout(&plan, None, &target);
    ro.deadlines = Deadlines { stuck_after: Some(Duration::from_secs(60)), batch_timeout: Some(Duration::from_secs(600)) };
    let mut status = RolloutStatus::default();

    assert_eq!(drive(&ro, &mut status).await, StepOutcome::Waiting);
    assert_eq!(status.batch_rolling_state, BatchRollingState::BatchVerifying);
    assert_eq!(target.desired(), 2);

    let later = Utc::now() + chrono::Duration::seconds(120);
    assert_eq!(ro.step(&mut status, later).await.unwrap(), StepOutcome::Waiting);
    assert_eq!(get_condition(&status.conditions, CONDITION_STUCK).unwrap().status, ConditionStatus::True);

    target.set_ready(2);
    assert_eq!(ro.step(&mut status, later).await.unwrap(), StepOutcome::Progressed);
    assert_eq!(get_condition(&status.conditions, CONDITION_STUCK).unwrap().status, ConditionStatus::False);
    assert_eq!(status.batch_rolling_state, BatchRollingState::BatchReady);

    drive(&ro, &mut status).await;
    let much_later = Utc::now() + chrono::Duration::seconds(3600);
    assert_eq!(ro.step(&mut status, much_later).await.unwrap(), StepOutcome::Terminal);
    assert_eq!(status.rolling_state, RollingState::RolloutFailed);
    assert_eq!(get_condition(&status.conditions, CONDITION_ROLLOUT).unwrap().reason, "BatchTimeout");
}

#[tokio::test]
async fn partition_halts_until_raised() {
    let source = Fake::new("web-v1", 4);
    let target = Fake::new("web-v2", 0);
    let mut plan = RolloutPlan { num_batches: Some(4), batch_partition: Some(1), ..Default::default() };
    let mut status = RolloutStatus::default();
    assert_eq!(drive(&rollout(&plan, Some(&source), &target), &mut status).await, StepOutcome::Waiting);
    assert_eq!(status.current_batch, 1);
    assert_eq!(status.batch_rolling_state, BatchRollingState::BatchReady);
    assert_eq!((target.desired(), source.desired()), (2, 2));
    // stays halted
    assert_eq!(drive(&rollout(&plan, Some(&source), &target), &mut status).await, StepOutcome::Waiting);

    plan.batch_partition = None;
    assert_eq!(drive(&rollout(&plan, Some(&source), &target), &mut status).await, StepOutcome::Terminal);
    assert_eq!((target.desired(), source.desired()), (4, 0));
}

#[tokio::test]
async fn pause_blocks_batch_boundaries_only() {
    let target = Fake::new("web-v2", 0);
    *target.auto_ready.lock().unwrap() = false;
    let mut plan = RolloutPlan { target_size: Some(2), num_batches: Some(2), ..Default::default() };
    let mut status = RolloutStatus::default();

    drive(&rollout(&plan, None, &target), &mut status).await;
    assert_eq!(status.batch_rolling_state, BatchRollingState::BatchVerifying);

    plan.paused = true;
    target.set_ready(1);
    let ro = rollout(&plan, None, &target);
    assert_eq!(drive(&ro, &mut status).await, StepOutcome::Waiting);
    // verification finished, but the next batch does not start
    assert_eq!(status.batch_rolling_state, BatchRollingState::BatchReady);
    assert_eq!(status.current_batch, 0);

    plan.paused = false;
    *target.auto_ready.lock().unwrap() = true;
    assert_eq!(drive(&rollout(&plan, None, &target), &mut status).await, StepOutcome::Terminal);
    assert_eq!(target.desired(), 2);
}

#[tokio::test]
async fn failures_are_terminal() {
    let target = Fake::new("web-v2", 0);
    *target.auto_ready.lock().unwrap() = false;
    let plan = RolloutPlan { target_size: Some(3), num_batches: Some(3), ..Default::default() };
    let mut status = RolloutStatus::default();
    drive(&rollout(&plan, None, &target), &mut status).await;
    *target.size.lock().unwrap() = None;
    assert_eq!(drive(&rollout(&plan, None, &target), &mut status).await, StepOutcome::Terminal);
    assert_eq!(status.rolling_state, RollingState::RolloutFailed);
    assert_eq!(get_condition(&status.conditions, CONDITION_ROLLOUT).unwrap().reason, "TargetDeleted");

    let bad = RolloutPlan {
        target_size: Some(3),
        num_batches: Some(2),
        batches: vec![BatchSpec { replicas: 3 }],
        ..Default::default()
    };
    let target = Fake::new("web-v3", 0);
    let mut status = RolloutStatus::default();
    drive(&rollout(&bad, None, &target), &mut status).await;
    assert_eq!(get_condition(&status.conditions, CONDITION_ROLLOUT).unwrap().reason, "PlanInvalid");
    assert_eq!(target.owner(), None);

    let source = Fake::new("web-v1", 2);
    *source.size.lock().unwrap() = None;
    let mut status = RolloutStatus::default();
    drive(&rollout(&plan, Some(&source), &target), &mut status).await;
    assert_eq!(get_condition(&status.conditions, CONDITION_ROLLOUT).unwrap().reason, "SourceMissing");
}

#[tokio::test]
async fn rollback_is_a_swapped_rollout() {
    let v1 = Fake::new("web-v1", 3);
    let v2 = Fake::new("web-v2", 0);
    let plan = RolloutPlan { num_batches: Some(3), ..Default::default() };
    let mut status = RolloutStatus::default();
    status.retarget("app-v1", "app-v2");
    drive(&rollout(&plan, Some(&v1), &v2), &mut status).await;
    assert_eq!((v1.desired(), v2.desired()), (0, 3));

    assert!(status.retarget("app-v2", "app-v1"));
    assert_eq!(status.rolling_state, RollingState::Initializing);
    let plan = RolloutPlan { num_batches: Some(3), ..Default::default() };
    assert_eq!(drive(&rollout(&plan, Some(&v2), &v1), &mut status).await, StepOutcome::Terminal);
    assert_eq!(status.rolling_state, RollingState::RolloutSucceeded);
    assert_eq!((v1.desired(), v2.desired()), (3, 0));
}
