//! Bulk filter planning.
//!
//! A [`FilterRequest`] is reduced to three flags (active-or-halting, bad state,
//! bad status) which pick one of a closed set of [`PlanShape`]s. Each shape
//! yields a base predicate; the inclusion filters and the trailing
//! state/status filter are appended in a fixed order. Stores evaluate the
//! resulting [`QueryPlan`] and stream one row per branch, which
//! [`distinct_rows`] folds into distinct instance ids.

use std::collections::HashSet;

use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::error::MonitorError;
use super::precedence;
use super::types::{BasicStatus, LifecycleState, Status, TimeWindow, WorkflowId};
use crate::storage::{Row, RowStream};

/// What the caller is looking for. Empty collections mean "no filter".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterRequest {
    #[serde(default)]
    pub states: Vec<LifecycleState>,
    #[serde(default)]
    pub statuses: Vec<Status>,
    #[serde(default)]
    pub definition_ids: Vec<i64>,
    #[serde(default)]
    pub workflow_ids: Vec<WorkflowId>,
    #[serde(default)]
    pub window: TimeWindow,
    /// Maximum number of distinct ids to return.
    #[serde(default)]
    pub cap: Option<usize>,
}

impl FilterRequest {
    pub fn states(states: impl IntoIterator<Item = LifecycleState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_definitions(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.definition_ids = ids.into_iter().collect();
        self
    }

    pub fn with_workflows(mut self, ids: impl IntoIterator<Item = WorkflowId>) -> Self {
        self.workflow_ids = ids.into_iter().collect();
        self
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }
}

/// Scan strategy chosen from the request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanShape {
    ActiveBadStatus,
    ActiveBadState,
    ActiveOnly,
    CompleteBadStateBadStatus,
    CompleteBadStatus,
    CompleteBadState,
    CompleteOnly,
    BadStateBadStatus,
    BadStatusOnly,
    BadStateOnly,
    Default,
}

/// One conjunct of a plan's predicate, evaluated against a branch row.
///
/// A branch row is the latest step record of a branch joined with its
/// instance's index entry (state code, worst status, definition id and start
/// time).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "clause", content = "values", rename_all = "snake_case")]
pub enum Clause {
    /// Latest record's basic status is one of these codes.
    BasicStatusIn(Vec<i32>),
    NextActivityDone,
    NextActivityNotDone,
    /// Some record of the instance carries an error code.
    ErrorExists,
    /// Latest record has not been archive-indexed.
    NotIndexed,
    AnyOf(Vec<Clause>),
    DefinitionIn(Vec<i64>),
    WorkflowIn(Vec<WorkflowId>),
    StartedWithin(TimeWindow),
    /// Instance index state code is one of these.
    StateIn(Vec<i32>),
    /// Instance index worst status code is one of these.
    StatusIn(Vec<i32>),
}

/// Ask the optimizer to favour the first `rows` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OptimizerHint {
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub shape: PlanShape,
    pub clauses: Vec<Clause>,
    pub order_by_workflow_id: bool,
    pub hint: Option<OptimizerHint>,
    pub cap: Option<usize>,
}

impl QueryPlan {
    pub fn has(&self, pred: impl Fn(&Clause) -> bool) -> bool {
        self.clauses.iter().any(pred)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlannerOptions {
    pub order_by_workflow_id: bool,
    pub optimizer_hints: bool,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            order_by_workflow_id: true,
            optimizer_hints: true,
        }
    }
}

/// Flags derived from a request; they drive shape selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanFlags {
    pub active_or_halting: bool,
    pub complete: bool,
    pub bad_state: bool,
    pub bad_status: bool,
    pub timed: bool,
}

/// Status restriction after collapsing the requested set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusFilter {
    Error,
    Success,
}

fn status_filter(statuses: &[Status]) -> Result<Option<StatusFilter>, MonitorError> {
    let mut error = false;
    let mut success = false;
    for status in statuses {
        match status {
            Status::Error => error = true,
            Status::Success => success = true,
            other => {
                return Err(MonitorError::invalid(format!(
                    "status '{}' cannot be used as a filter. Use: error, success",
                    other
                )));
            }
        }
    }
    Ok(match (error, success) {
        (true, false) => Some(StatusFilter::Error),
        (false, true) => Some(StatusFilter::Success),
        _ => None,
    })
}

fn is_bad_state(state: LifecycleState) -> bool {
    matches!(
        state,
        LifecycleState::Terminated
            | LifecycleState::Halted
            | LifecycleState::InterruptedAuto
            | LifecycleState::InterruptedMan
            | LifecycleState::Waiting
            | LifecycleState::WaitingOnIo
    )
}

pub fn flags(request: &FilterRequest) -> Result<PlanFlags, MonitorError> {
    if request.states.contains(&LifecycleState::Unknown) {
        return Err(MonitorError::invalid("state 'unknown' cannot be used as a filter"));
    }
    let status = status_filter(&request.statuses)?;
    Ok(PlanFlags {
        active_or_halting: request.states.iter().any(|s| {
            matches!(
                s,
                LifecycleState::Active | LifecycleState::ActiveWaiting | LifecycleState::Halting
            )
        }),
        complete: request.states.contains(&LifecycleState::Complete),
        bad_state: request.states.iter().copied().any(is_bad_state),
        bad_status: status == Some(StatusFilter::Error),
        timed: !request.window.is_open(),
    })
}

pub fn select_shape(flags: &PlanFlags) -> PlanShape {
    if flags.active_or_halting {
        if flags.bad_status {
            PlanShape::ActiveBadStatus
        } else if flags.bad_state {
            PlanShape::ActiveBadState
        } else {
            PlanShape::ActiveOnly
        }
    } else if flags.complete {
        match (flags.bad_state, flags.bad_status) {
            (true, true) => PlanShape::CompleteBadStateBadStatus,
            (false, true) => PlanShape::CompleteBadStatus,
            (true, false) => PlanShape::CompleteBadState,
            (false, false) => PlanShape::CompleteOnly,
        }
    } else if flags.bad_state && flags.bad_status {
        PlanShape::BadStateBadStatus
    } else if flags.bad_status {
        PlanShape::BadStatusOnly
    } else if flags.bad_state {
        PlanShape::BadStateOnly
    } else {
        PlanShape::Default
    }
}

/// Basic status codes a branch must carry for an instance to be in `state`.
fn state_basic_codes(state: LifecycleState) -> Vec<i32> {
    let codes: &[BasicStatus] = match state {
        LifecycleState::Terminated => &[BasicStatus::Terminated],
        LifecycleState::Waiting => &[BasicStatus::Waiting],
        LifecycleState::WaitingOnIo => &[BasicStatus::WaitingOnIo],
        LifecycleState::InterruptedAuto => &[BasicStatus::InterruptAuto],
        LifecycleState::InterruptedMan => &[BasicStatus::InterruptMan],
        LifecycleState::Halted => &[
            BasicStatus::WfeSystemError,
            BasicStatus::SystemError,
            BasicStatus::ServiceConfigError,
            BasicStatus::Warning,
            BasicStatus::Error,
        ],
        _ => &[],
    };
    codes.iter().map(BasicStatus::code).collect()
}

/// Branch-level condition that at least one branch of every matching
/// instance satisfies.
fn state_predicate(states: &[LifecycleState]) -> Option<Clause> {
    let mut alternatives = Vec::new();
    let running = states.iter().any(|s| {
        matches!(
            s,
            LifecycleState::Active | LifecycleState::ActiveWaiting | LifecycleState::Halting
        )
    });
    if running {
        alternatives.push(Clause::NextActivityNotDone);
    }
    if states.contains(&LifecycleState::Complete) {
        alternatives.push(Clause::NextActivityDone);
    }

    let mut codes: Vec<i32> = states.iter().flat_map(|s| state_basic_codes(*s)).collect();
    codes.sort_unstable();
    codes.dedup();
    if !codes.is_empty() {
        alternatives.push(Clause::BasicStatusIn(codes));
    }

    match alternatives.len() {
        0 => None,
        1 => alternatives.pop(),
        _ => Some(Clause::AnyOf(alternatives)),
    }
}

fn base_predicate(shape: PlanShape, flags: &PlanFlags, states: &[LifecycleState]) -> Vec<Clause> {
    let mut clauses: Vec<Clause> = state_predicate(states).into_iter().collect();
    match shape {
        PlanShape::ActiveBadStatus | PlanShape::BadStateBadStatus => {
            clauses.push(Clause::ErrorExists);
        }
        PlanShape::ActiveOnly if !flags.complete => clauses.push(Clause::NotIndexed),
        // Without a time window the correlated error check is left to the
        // trailing status filter.
        PlanShape::CompleteBadStateBadStatus
        | PlanShape::CompleteBadStatus
        | PlanShape::BadStatusOnly
            if flags.timed =>
        {
            clauses.push(Clause::ErrorExists);
        }
        _ => {}
    }
    clauses
}

/// Build the plan for a request.
pub fn plan(request: &FilterRequest, options: PlannerOptions) -> Result<QueryPlan, MonitorError> {
    let flags = flags(request)?;
    let shape = select_shape(&flags);
    let mut clauses = base_predicate(shape, &flags, &request.states);

    if !request.definition_ids.is_empty() {
        clauses.push(Clause::DefinitionIn(request.definition_ids.clone()));
    }
    if !request.workflow_ids.is_empty() {
        clauses.push(Clause::WorkflowIn(request.workflow_ids.clone()));
    }
    if flags.timed {
        clauses.push(Clause::StartedWithin(request.window));
    }
    if !request.states.is_empty() {
        let mut codes: Vec<i32> = request
            .states
            .iter()
            .flat_map(|s| precedence::filter_codes(*s))
            .collect();
        codes.sort_unstable();
        codes.dedup();
        clauses.push(Clause::StateIn(codes));
    }
    match status_filter(&request.statuses)? {
        Some(StatusFilter::Error) => clauses.push(Clause::StatusIn(vec![Status::Error.code()])),
        Some(StatusFilter::Success) => clauses.push(Clause::StatusIn(vec![
            Status::Success.code(),
            Status::Warning.code(),
        ])),
        None => {}
    }

    let hint = match request.cap {
        Some(cap) if options.optimizer_hints => Some(OptimizerHint {
            rows: cap.saturating_mul(2),
        }),
        _ => None,
    };

    Ok(QueryPlan {
        shape,
        clauses,
        order_by_workflow_id: options.order_by_workflow_id,
        hint,
        cap: request.cap,
    })
}

/// Drain a branch-row stream into distinct instances, in first-seen order.
///
/// Stops once `cap` distinct ids have been collected; rows are not counted.
pub async fn distinct_rows(mut rows: RowStream<'_>, cap: Option<usize>) -> anyhow::Result<Vec<Row>> {
    let mut seen: HashSet<WorkflowId> = HashSet::new();
    let mut out = Vec::new();
    if cap == Some(0) {
        return Ok(out);
    }

    while let Some(row) = rows.try_next().await? {
        if !seen.insert(row.workflow_id) {
            continue;
        }
        out.push(row);
        if cap.is_some_and(|cap| out.len() >= cap) {
            break;
        }
    }
    Ok(out)
}
