pub mod memory_store;
pub mod sql;
pub mod sql_store;

use std::collections::HashMap;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use uuid::Uuid;

use crate::engine::planner::QueryPlan;
use crate::engine::types::*;

/// One branch row produced by a filter scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Row {
    pub workflow_id: WorkflowId,
    /// Instance state from the store's index, as a precedence code.
    pub state_code: i32,
}

pub type RowStream<'a> = Pin<Box<dyn Stream<Item = Result<Row>> + Send + 'a>>;

/// A branch left behind by a system shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShutdownCandidate {
    pub workflow_id: WorkflowId,
    pub branch_id: String,
    pub step: i64,
}

/// Trait for the append-only step log and its derived index.
///
/// Implementations keep an instance-level index (state precedence code and
/// worst status) in step with every write, so filter scans never classify.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Append a record. Returns its id.
    async fn insert_step(&self, record: &StepRecord) -> Result<Uuid>;

    /// Latest record of a branch by step sequence.
    async fn latest_step(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<StepRecord>>;

    /// Branch ids of an instance, in first-seen order.
    async fn branch_ids(&self, workflow_id: WorkflowId) -> Result<Vec<String>>;

    /// Every record of one branch, oldest first.
    async fn branch_history(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Vec<StepRecord>>;

    /// Basic status of every record of an instance.
    async fn basic_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<BasicStatus>>;

    /// Worst status per id for a batch of instances. Ids without records are absent.
    async fn worst_statuses(&self, ids: &[WorkflowId]) -> Result<HashMap<WorkflowId, Status>>;

    /// Stream the branch rows matching a plan, ordered by workflow id when the
    /// plan asks for it.
    fn query_by_filter<'a>(&'a self, plan: &'a QueryPlan) -> RowStream<'a>;

    /// Overwrite the basic status of a record in place. Returns rows affected.
    async fn overwrite_latest_status(&self, record_id: Uuid, status: BasicStatus, note: &str) -> Result<u64>;

    async fn mark_inactive(&self, workflow_id: WorkflowId, reason: &str) -> Result<()>;

    async fn is_marked_inactive(&self, workflow_id: WorkflowId) -> Result<bool>;

    /// Records carrying the system-shutdown engine status that have not been indexed.
    async fn shutdown_candidates(&self) -> Result<Vec<ShutdownCandidate>>;

    /// Current (highest) step sequence of a branch.
    async fn current_step(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<i64>>;

    async fn save_hint(&self, hint: &Hint) -> Result<()>;

    async fn hint(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<Hint>>;

    async fn invalidate_hints(&self, workflow_id: WorkflowId) -> Result<()>;
}
