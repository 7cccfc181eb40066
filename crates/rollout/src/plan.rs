//! Rollout plans: how many replicas each batch moves.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("numBatches is {num_batches} but {batches} batches are listed")]
    BatchCountMismatch { num_batches: i32, batches: usize },
    #[error("batches add up to {sum} replicas, target size is {target}")]
    SumMismatch { sum: i64, target: i32 },
    #[error("batchPartition {partition} is out of range for {batches} batches")]
    PartitionOutOfRange { partition: i32, batches: usize },
    #[error("{0} must not be negative")]
    Negative(&'static str),
    #[error("plan has no batches")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchSpec {
    pub replicas: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_batches: Option<i32>,
    #[serde(default, rename = "rolloutBatches", skip_serializing_if = "Vec::is_empty")]
    pub batches: Vec<BatchSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_partition: Option<i32>,
    #[serde(default)]
    pub paused: bool,
}

/// Split `target` replicas into `num_batches` batches of `target / n`, giving
/// the remainder one each to the last batches.
pub fn default_rollout_plan(target: i32, num_batches: i32) -> Vec<BatchSpec> {
    if num_batches <= 0 {
        return Vec::new();
    }
    let avg = target / num_batches;
    let rem = target % num_batches;
    (0..num_batches)
        .map(|i| BatchSpec { replicas: if i >= num_batches - rem { avg + 1 } else { avg } })
        .collect()
}

impl RolloutPlan {
    /// Fill in the target size (from `fallback_size` when unset) and the
    /// batches (from `numBatches`, default 1, when none are listed).
    pub fn finalized(&self, fallback_size: i32) -> RolloutPlan {
        let mut p = self.clone();
        let target = p.target_size.unwrap_or(fallback_size);
        p.target_size = Some(target);
        if p.batches.is_empty() {
            p.batches = default_rollout_plan(target, p.num_batches.unwrap_or(1));
        }
        p
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let target = self.target_size.unwrap_or(0);
        if target < 0 { return Err(PlanError::Negative("targetSize")); }
        if self.batches.iter().any(|b| b.replicas < 0) { return Err(PlanError::Negative("batch replicas")); }
        if self.batches.is_empty() { return Err(PlanError::Empty); }
        if let Some(n) = self.num_batches {
            if n as i64 != self.batches.len() as i64 {
                return Err(PlanError::BatchCountMismatch { num_batches: n, batches: self.batches.len() });
            }
        }
        let sum: i64 = self.batches.iter().map(|b| b.replicas as i64).sum();
        if self.target_size.is_some() && sum != target as i64 {
            return Err(PlanError::SumMismatch { sum, target });
        }
        if let Some(p) = self.batch_partition {
            if p < 0 || p as usize >= self.batches.len() {
                return Err(PlanError::PartitionOutOfRange { partition: p, batches: self.batches.len() });
            }
        }
        Ok(())
    }

    /// Replicas of the target after batch `i` (inclusive), saturating at
    /// `i32::MAX` for plans that did not validate.
    pub fn cumulative(&self, i: usize) -> i32 {
        let sum: i64 = self.batches.iter().take(i + 1).map(|b| b.replicas as i64).sum();
        sum.min(i32::MAX as i64) as i32
    }
}

/// Replicas the source keeps once the target holds `cumulative` of `target`.
pub fn source_remaining(source: i32, cumulative: i32, target: i32, last_batch: bool) -> i32 {
    if target <= 0 || last_batch {
        return 0;
    }
    let moved = (source as i64 * cumulative as i64) / target as i64;
    (source as i64 - moved).max(0) as i32
}
