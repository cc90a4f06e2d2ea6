pub mod aggregate;
pub mod classifier;
pub mod error;
pub mod planner;
pub mod precedence;
pub mod shutdown;
pub mod status;
pub mod transition;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::lock::{LockPolicy, LockService};
use crate::notify::{ConsumerRegistry, EventBus, LogEventBus, NoopConsumerRegistry};
use crate::storage::StepStore;
use crate::storage::sql::Dialect;

use self::aggregate::StateMerge;
use self::classifier::{ClassifyMode, Rule, classify};
use self::error::MonitorError;
use self::planner::{FilterRequest, PlannerOptions, QueryPlan, distinct_rows};
use self::types::*;

/// Runtime settings for a [`WorkflowMonitor`], resolved once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub dialect: Dialect,
    /// Take the per-instance lock while terminating waiting instances.
    pub locking_enabled: bool,
    /// Write a hint for every branch classification.
    pub hints_enabled: bool,
    pub lock_hold_timeout_ms: u64,
    pub lock_wait_timeout_ms: u64,
    /// Stop retrying lock acquisition after this long. Unset retries forever.
    pub lock_acquire_deadline_ms: Option<u64>,
    pub order_by_workflow_id: bool,
    pub optimizer_hints: bool,
    /// Default cap for listings issued by operators.
    pub max_to_display: usize,
    pub status_batch_size: usize,
    pub fetch_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sqlite,
            locking_enabled: true,
            hints_enabled: false,
            lock_hold_timeout_ms: 120_000,
            lock_wait_timeout_ms: 100_000,
            lock_acquire_deadline_ms: None,
            order_by_workflow_id: true,
            optimizer_hints: true,
            max_to_display: 10_000,
            status_batch_size: 250,
            fetch_size: 10,
        }
    }
}

impl MonitorConfig {
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            hold: Duration::from_millis(self.lock_hold_timeout_ms),
            wait: Duration::from_millis(self.lock_wait_timeout_ms),
            deadline: self.lock_acquire_deadline_ms.map(Duration::from_millis),
        }
    }

    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            order_by_workflow_id: self.order_by_workflow_id,
            optimizer_hints: self.optimizer_hints,
        }
    }
}

/// Instances grouped by their current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub by_state: BTreeMap<LifecycleState, Vec<WorkflowId>>,
}

impl UsageSummary {
    pub fn count(&self, state: LifecycleState) -> usize {
        self.by_state.get(&state).map_or(0, Vec::len)
    }

    pub fn ids(&self, state: LifecycleState) -> &[WorkflowId] {
        self.by_state.get(&state).map_or(&[], Vec::as_slice)
    }
}

/// States reported by [`WorkflowMonitor::usage_by_state`].
pub const USAGE_STATES: [LifecycleState; 7] = [
    LifecycleState::Active,
    LifecycleState::Halted,
    LifecycleState::Halting,
    LifecycleState::Waiting,
    LifecycleState::WaitingOnIo,
    LifecycleState::InterruptedMan,
    LifecycleState::InterruptedAuto,
];

/// Derives lifecycle state and status of workflow instances and drives their
/// terminate/interrupt transitions.
pub struct WorkflowMonitor {
    store: Arc<dyn StepStore>,
    locks: Arc<dyn LockService>,
    events: Arc<dyn EventBus>,
    consumers: Arc<dyn ConsumerRegistry>,
    config: MonitorConfig,
}

impl WorkflowMonitor {
    pub fn new(store: Arc<dyn StepStore>, locks: Arc<dyn LockService>, config: MonitorConfig) -> Self {
        Self {
            store,
            locks,
            events: Arc::new(LogEventBus),
            consumers: Arc::new(NoopConsumerRegistry),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_consumers(mut self, consumers: Arc<dyn ConsumerRegistry>) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StepStore> {
        &self.store
    }

    // --- State ---

    /// Merged state of an instance. Store failures are logged and reported
    /// as `Unknown`.
    pub async fn instance_state(&self, workflow_id: WorkflowId) -> LifecycleState {
        match self.try_instance_state(workflow_id).await {
            Ok(state) => state,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Failed to read instance state");
                LifecycleState::Unknown
            }
        }
    }

    async fn try_instance_state(&self, workflow_id: WorkflowId) -> Result<LifecycleState> {
        let mut merge = StateMerge::new();
        let mut inactive = None;

        for branch_id in self.store.branch_ids(workflow_id).await? {
            let Some(record) = self.store.latest_step(workflow_id, &branch_id).await? else {
                continue;
            };
            let state = self
                .classify_record(&record, ClassifyMode::Instance, &mut inactive)
                .await?;
            merge.add(state);
        }

        let state = merge.finish();
        if state == LifecycleState::Unknown {
            error!(workflow_id = %workflow_id, "No branch of the instance could be classified");
        } else if merge.unclassified() > 0 {
            warn!(
                workflow_id = %workflow_id,
                unclassified = merge.unclassified(),
                "Some branches could not be classified"
            );
        }
        Ok(state)
    }

    /// State of a single branch, as seen by the transition protocol.
    pub async fn branch_state(&self, workflow_id: WorkflowId, branch_id: &str) -> LifecycleState {
        let mut inactive = None;
        let result = match self.store.latest_step(workflow_id, branch_id).await {
            Ok(Some(record)) => {
                self.classify_record(&record, ClassifyMode::Branch, &mut inactive)
                    .await
            }
            Ok(None) => Ok(LifecycleState::Unknown),
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to read branch state");
            LifecycleState::Unknown
        })
    }

    /// Classify one record, looking up the inactivity flag at most once per
    /// call site via `inactive`.
    pub(crate) async fn classify_record(
        &self,
        record: &StepRecord,
        mode: ClassifyMode,
        inactive: &mut Option<bool>,
    ) -> Result<LifecycleState> {
        let verdict = classify(record, mode);
        let flag = match (verdict.needs_inactive_check(), *inactive) {
            (false, _) => false,
            (true, Some(flag)) => flag,
            (true, None) => {
                let flag = self.store.is_marked_inactive(record.workflow_id).await?;
                *inactive = Some(flag);
                flag
            }
        };
        let (state, rule) = verdict.resolve(flag);

        match rule {
            Rule::NoMatch => error!(
                workflow_id = %record.workflow_id,
                branch_id = %record.branch_id,
                basic_status = record.basic_status.code(),
                engine_status = record.engine_status.code(),
                "Cannot find state for this branch"
            ),
            Rule::ErrorFallthrough => debug!(
                workflow_id = %record.workflow_id,
                branch_id = %record.branch_id,
                basic_status = record.basic_status.code(),
                engine_status = record.engine_status.code(),
                "Errored branch inferred active"
            ),
            _ => {}
        }

        if self.config.hints_enabled {
            let hint = Hint {
                workflow_id: record.workflow_id,
                branch_id: record.branch_id.clone(),
                state,
                engine_status: record.engine_status,
                basic_status: record.basic_status,
                adv_status: record.adv_status.clone(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.store.save_hint(&hint).await {
                warn!(workflow_id = %record.workflow_id, branch_id = %record.branch_id, error = %e, "Failed to save hint");
            }
        }

        Ok(state)
    }

    // --- Status ---

    /// Worst status over every record of the instance. An instance with no
    /// records is `Unknown`, matching [`Self::instance_state`].
    pub async fn instance_status(&self, workflow_id: WorkflowId) -> Status {
        match self.store.basic_statuses(workflow_id).await {
            Ok(statuses) if statuses.is_empty() => Status::Unknown,
            Ok(statuses) => status::worst_status(statuses),
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Failed to read instance status");
                Status::Unknown
            }
        }
    }

    /// Status of many instances, queried in batches. Ids in a batch that fails
    /// are reported as `Unknown`; ids with no records are omitted.
    pub async fn instance_statuses(&self, ids: &[WorkflowId]) -> HashMap<WorkflowId, Status> {
        let mut out = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.status_batch_size.max(1)) {
            match self.store.worst_statuses(chunk).await {
                Ok(statuses) => out.extend(statuses),
                Err(e) => {
                    error!(batch = chunk.len(), error = %e, "Failed to read batch status");
                    out.extend(chunk.iter().map(|id| (*id, Status::Unknown)));
                }
            }
        }
        out
    }

    // --- Listing ---

    /// The plan a listing would run, for inspection.
    pub fn explain(&self, request: &FilterRequest) -> Result<QueryPlan, MonitorError> {
        planner::plan(request, self.config.planner_options())
    }

    /// Distinct instance ids matching the request, in scan order. An absent
    /// cap scans to the end.
    pub async fn list_ids(&self, request: &FilterRequest) -> Result<Vec<WorkflowId>, MonitorError> {
        let plan = self.explain(request)?;
        debug!(shape = ?plan.shape, clauses = plan.clauses.len(), cap = ?plan.cap, "Listing instances");
        let rows = distinct_rows(self.store.query_by_filter(&plan), plan.cap).await?;
        Ok(rows.into_iter().map(|row| row.workflow_id).collect())
    }

    /// Instances in each non-final state.
    pub async fn usage_by_state(&self, cap: Option<usize>) -> Result<UsageSummary, MonitorError> {
        let request = FilterRequest {
            states: USAGE_STATES.to_vec(),
            cap,
            ..Default::default()
        };
        let plan = self.explain(&request)?;
        let rows = distinct_rows(self.store.query_by_filter(&plan), plan.cap).await?;

        let mut summary = UsageSummary::default();
        for row in rows {
            let state = precedence::decode(row.state_code);
            summary.by_state.entry(state).or_default().push(row.workflow_id);
        }
        Ok(summary)
    }

    /// Instances that have finished and may be moved to the archive.
    pub async fn movable_ids(
        &self,
        selection: MovableSelection,
        max_rows: Option<usize>,
    ) -> Result<Vec<WorkflowId>, MonitorError> {
        let request = FilterRequest {
            states: selection.states(),
            cap: max_rows,
            ..Default::default()
        };
        self.list_ids(&request).await
    }

    /// Replay of one branch's log, oldest first.
    pub async fn branch_history(
        &self,
        workflow_id: WorkflowId,
        branch_id: &str,
    ) -> Result<Vec<StepRecord>, MonitorError> {
        Ok(self.store.branch_history(workflow_id, branch_id).await?)
    }
}
