use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures_util::{StreamExt, TryStreamExt, stream};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Row, RowStream, ShutdownCandidate, StepStore};
use crate::engine::aggregate::derive_instance_state;
use crate::engine::planner::{Clause, QueryPlan};
use crate::engine::precedence;
use crate::engine::status::{status_of, worst_status};
use crate::engine::types::*;

/// In-process step store. Each branch keeps its records as an ordered log.
pub struct MemoryStepStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<WorkflowId, Vec<BranchLog>>,
    inactive: HashMap<WorkflowId, (String, DateTime<Utc>)>,
    hints: HashMap<(WorkflowId, String), Hint>,
}

struct BranchLog {
    branch_id: String,
    records: Vec<StepRecord>,
}

impl BranchLog {
    fn latest(&self) -> Option<&StepRecord> {
        self.records.last()
    }
}

/// Index entry derived for one instance at scan time.
struct IndexEntry {
    state_code: i32,
    status: Status,
    definition_id: i64,
    start_time: DateTime<Utc>,
    has_error: bool,
}

impl MemoryStepStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Reason recorded by the last administrative stop, if any.
    pub async fn inactive_reason(&self, workflow_id: WorkflowId) -> Option<String> {
        let inner = self.inner.read().await;
        inner.inactive.get(&workflow_id).map(|(reason, _)| reason.clone())
    }

    /// Total number of records held, across all instances.
    pub async fn record_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .instances
            .values()
            .flat_map(|branches| branches.iter())
            .map(|b| b.records.len())
            .sum()
    }

    async fn scan(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let inner = self.inner.read().await;
        let mut rows = Vec::new();

        for (workflow_id, branches) in &inner.instances {
            let Some(index) = index_entry(branches, inner.inactive.contains_key(workflow_id)) else {
                continue;
            };
            for branch in branches {
                let Some(latest) = branch.latest() else {
                    continue;
                };
                if plan.clauses.iter().all(|c| clause_matches(c, latest, &index)) {
                    rows.push(Row {
                        workflow_id: *workflow_id,
                        state_code: index.state_code,
                    });
                }
            }
        }

        Ok(rows)
    }
}

impl Default for MemoryStepStore {
    fn default() -> Self {
        Self::new()
    }
}

fn index_entry(branches: &[BranchLog], inactive: bool) -> Option<IndexEntry> {
    let first = branches.iter().flat_map(|b| b.records.iter()).min_by_key(|r| r.start_time)?;
    let state = derive_instance_state(branches.iter().filter_map(BranchLog::latest), inactive);
    let all = || branches.iter().flat_map(|b| b.records.iter()).map(|r| r.basic_status);
    Some(IndexEntry {
        state_code: precedence::encode(state),
        status: worst_status(all()),
        definition_id: first.definition_id,
        start_time: first.start_time.trunc_subsecs(0),
        has_error: all().any(|b| status_of(b) == Status::Error),
    })
}

fn clause_matches(clause: &Clause, latest: &StepRecord, index: &IndexEntry) -> bool {
    match clause {
        Clause::BasicStatusIn(codes) => codes.contains(&latest.basic_status.code()),
        Clause::NextActivityDone => latest.next_activity == NextActivity::Done,
        Clause::NextActivityNotDone => latest.next_activity != NextActivity::Done,
        Clause::ErrorExists => index.has_error,
        Clause::NotIndexed => !latest.indexed,
        Clause::AnyOf(alternatives) => alternatives.iter().any(|c| clause_matches(c, latest, index)),
        Clause::DefinitionIn(ids) => ids.contains(&index.definition_id),
        Clause::WorkflowIn(ids) => ids.contains(&latest.workflow_id),
        Clause::StartedWithin(window) => {
            let from_ok = window.from.is_none_or(|from| index.start_time >= from.trunc_subsecs(0));
            let to_ok = window.to.is_none_or(|to| index.start_time <= to.trunc_subsecs(0));
            from_ok && to_ok
        }
        Clause::StateIn(codes) => codes.contains(&index.state_code),
        Clause::StatusIn(codes) => codes.contains(&index.status.code()),
    }
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn insert_step(&self, record: &StepRecord) -> Result<Uuid> {
        let mut inner = self.inner.write().await;
        let branches = inner.instances.entry(record.workflow_id).or_default();

        let idx = match branches.iter().position(|b| b.branch_id == record.branch_id) {
            Some(idx) => idx,
            None => {
                branches.push(BranchLog {
                    branch_id: record.branch_id.clone(),
                    records: Vec::new(),
                });
                branches.len() - 1
            }
        };
        let log = &mut branches[idx].records;

        if log.iter().any(|r| r.step == record.step) {
            bail!(
                "Step {} already recorded for workflow {} branch '{}'",
                record.step,
                record.workflow_id,
                record.branch_id
            );
        }
        let pos = log.partition_point(|r| r.step < record.step);
        log.insert(pos, record.clone());

        Ok(record.id)
    }

    async fn latest_step(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<StepRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .instances
            .get(&workflow_id)
            .and_then(|branches| branches.iter().find(|b| b.branch_id == branch_id))
            .and_then(BranchLog::latest)
            .cloned())
    }

    async fn branch_ids(&self, workflow_id: WorkflowId) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .instances
            .get(&workflow_id)
            .map(|branches| branches.iter().map(|b| b.branch_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn branch_history(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Vec<StepRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .instances
            .get(&workflow_id)
            .and_then(|branches| branches.iter().find(|b| b.branch_id == branch_id))
            .map(|b| b.records.clone())
            .unwrap_or_default())
    }

    async fn basic_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<BasicStatus>> {
        let inner = self.inner.read().await;
        Ok(inner
            .instances
            .get(&workflow_id)
            .map(|branches| {
                branches
                    .iter()
                    .flat_map(|b| b.records.iter())
                    .map(|r| r.basic_status)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn worst_statuses(&self, ids: &[WorkflowId]) -> Result<HashMap<WorkflowId, Status>> {
        let inner = self.inner.read().await;
        let mut out = HashMap::new();
        for id in ids {
            if let Some(branches) = inner.instances.get(id) {
                let status = worst_status(branches.iter().flat_map(|b| b.records.iter()).map(|r| r.basic_status));
                out.insert(*id, status);
            }
        }
        Ok(out)
    }

    fn query_by_filter<'a>(&'a self, plan: &'a QueryPlan) -> RowStream<'a> {
        stream::once(self.scan(plan))
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    async fn overwrite_latest_status(&self, record_id: Uuid, status: BasicStatus, note: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let record = inner
            .instances
            .values_mut()
            .flat_map(|branches| branches.iter_mut())
            .flat_map(|b| b.records.iter_mut())
            .find(|r| r.id == record_id);

        match record {
            Some(record) => {
                record.basic_status = status;
                record.status_report = Some(note.to_string());
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn mark_inactive(&self, workflow_id: WorkflowId, reason: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.inactive.insert(workflow_id, (reason.to_string(), Utc::now()));
        Ok(())
    }

    async fn is_marked_inactive(&self, workflow_id: WorkflowId) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.inactive.contains_key(&workflow_id))
    }

    async fn shutdown_candidates(&self) -> Result<Vec<ShutdownCandidate>> {
        let inner = self.inner.read().await;
        Ok(inner
            .instances
            .values()
            .flat_map(|branches| branches.iter())
            .flat_map(|b| b.records.iter())
            .filter(|r| r.engine_status == EngineStatus::SystemShutdown && !r.indexed)
            .map(|r| ShutdownCandidate {
                workflow_id: r.workflow_id,
                branch_id: r.branch_id.clone(),
                step: r.step,
            })
            .collect())
    }

    async fn current_step(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<i64>> {
        Ok(self.latest_step(workflow_id, branch_id).await?.map(|r| r.step))
    }

    async fn save_hint(&self, hint: &Hint) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .hints
            .insert((hint.workflow_id, hint.branch_id.clone()), hint.clone());
        Ok(())
    }

    async fn hint(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<Hint>> {
        let inner = self.inner.read().await;
        Ok(inner.hints.get(&(workflow_id, branch_id.to_string())).cloned())
    }

    async fn invalidate_hints(&self, workflow_id: WorkflowId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.hints.retain(|(id, _), _| *id != workflow_id);
        Ok(())
    }
}
