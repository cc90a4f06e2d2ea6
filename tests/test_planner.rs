//! Tests for filter planning and SQL rendering.

use flowwatch::engine::planner::*;
use flowwatch::engine::types::*;
use flowwatch::storage::sql::{Dialect, render, render_status_query};

fn plan_for(request: &FilterRequest) -> QueryPlan {
    plan(request, PlannerOptions::default()).unwrap()
}

fn shape_of(states: &[LifecycleState], statuses: &[Status]) -> PlanShape {
    let request = FilterRequest::states(states.iter().copied()).with_statuses(statuses.iter().copied());
    plan_for(&request).shape
}

// --- Shapes ---

#[test]
fn active_shapes() {
    use LifecycleState as S;
    assert_eq!(shape_of(&[S::Active], &[Status::Error]), PlanShape::ActiveBadStatus);
    assert_eq!(shape_of(&[S::Halting, S::Halted], &[]), PlanShape::ActiveBadState);
    assert_eq!(shape_of(&[S::Active], &[]), PlanShape::ActiveOnly);
    assert_eq!(shape_of(&[S::ActiveWaiting], &[Status::Success]), PlanShape::ActiveOnly);
}

#[test]
fn complete_shapes() {
    use LifecycleState as S;
    assert_eq!(
        shape_of(&[S::Complete, S::Terminated], &[Status::Error]),
        PlanShape::CompleteBadStateBadStatus
    );
    assert_eq!(shape_of(&[S::Complete], &[Status::Error]), PlanShape::CompleteBadStatus);
    assert_eq!(shape_of(&[S::Complete, S::Waiting], &[]), PlanShape::CompleteBadState);
    assert_eq!(shape_of(&[S::Complete], &[]), PlanShape::CompleteOnly);
}

#[test]
fn remaining_shapes() {
    use LifecycleState as S;
    assert_eq!(shape_of(&[S::Halted], &[Status::Error]), PlanShape::BadStateBadStatus);
    assert_eq!(shape_of(&[], &[Status::Error]), PlanShape::BadStatusOnly);
    assert_eq!(shape_of(&[S::InterruptedMan], &[]), PlanShape::BadStateOnly);
    assert_eq!(shape_of(&[], &[]), PlanShape::Default);
}

#[test]
fn error_and_success_together_is_not_bad_status() {
    let request = FilterRequest::default().with_statuses([Status::Error, Status::Success]);
    let plan = plan_for(&request);
    assert_eq!(plan.shape, PlanShape::Default);
    assert!(!plan.has(|c| matches!(c, Clause::StatusIn(_))));
}

// --- Validation ---

#[test]
fn unknown_state_is_rejected() {
    let request = FilterRequest::states([LifecycleState::Unknown]);
    let err = plan(&request, PlannerOptions::default()).unwrap_err();
    assert!(err.is_invalid_argument());
}

#[test]
fn warning_and_unknown_status_are_rejected() {
    for status in [Status::Warning, Status::Unknown] {
        let request = FilterRequest::default().with_statuses([status]);
        assert!(plan(&request, PlannerOptions::default()).unwrap_err().is_invalid_argument());
    }
}

// --- Clauses ---

#[test]
fn clause_order_is_fixed() {
    let window = TimeWindow {
        from: Some(parse_timestamp("2024-01-01 00:00:00").unwrap()),
        to: Some(parse_timestamp("2024-02-01 00:00:00").unwrap()),
    };
    let request = FilterRequest::states([LifecycleState::Halted])
        .with_statuses([Status::Error])
        .with_definitions([5, 6])
        .with_workflows([100])
        .with_window(window);
    let plan = plan_for(&request);

    let kinds: Vec<&str> = plan
        .clauses
        .iter()
        .map(|c| match c {
            Clause::BasicStatusIn(_) => "basic",
            Clause::ErrorExists => "error",
            Clause::DefinitionIn(_) => "definition",
            Clause::WorkflowIn(_) => "workflow",
            Clause::StartedWithin(_) => "window",
            Clause::StateIn(_) => "state",
            Clause::StatusIn(_) => "status",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["basic", "error", "definition", "workflow", "window", "state", "status"]
    );
}

#[test]
fn halted_predicate_lists_error_codes() {
    let plan = plan_for(&FilterRequest::states([LifecycleState::Halted]));
    assert_eq!(plan.clauses[0], Clause::BasicStatusIn(vec![1, 2, 3, 4, 10]));
    assert_eq!(plan.clauses.last(), Some(&Clause::StateIn(vec![7])));
}

#[test]
fn active_only_skips_indexed_records_unless_complete_requested() {
    let plan = plan_for(&FilterRequest::states([LifecycleState::Active]));
    assert!(plan.has(|c| *c == Clause::NotIndexed));
    assert_eq!(plan.clauses.last(), Some(&Clause::StateIn(vec![0, 9])));

    let plan = plan_for(&FilterRequest::states([LifecycleState::Active, LifecycleState::Complete]));
    assert!(!plan.has(|c| *c == Clause::NotIndexed));
    assert!(plan.has(|c| matches!(c, Clause::AnyOf(alts) if alts.len() == 2)));
}

#[test]
fn error_correlation_only_with_time_window_for_complete() {
    let untimed = plan_for(&FilterRequest::states([LifecycleState::Complete]).with_statuses([Status::Error]));
    assert!(!untimed.has(|c| *c == Clause::ErrorExists));

    let window = TimeWindow {
        from: Some(parse_timestamp("2024-01-01 00:00:00").unwrap()),
        to: None,
    };
    let timed = plan_for(
        &FilterRequest::states([LifecycleState::Complete])
            .with_statuses([Status::Error])
            .with_window(window),
    );
    assert!(timed.has(|c| *c == Clause::ErrorExists));
}

#[test]
fn success_filter_matches_warning() {
    let plan = plan_for(&FilterRequest::default().with_statuses([Status::Success]));
    assert_eq!(plan.clauses, vec![Clause::StatusIn(vec![0, 1])]);
}

#[test]
fn empty_inclusion_lists_are_ignored() {
    let request = FilterRequest::states([LifecycleState::Waiting])
        .with_definitions(Vec::new())
        .with_workflows(Vec::new());
    let plan = plan_for(&request);
    assert!(!plan.has(|c| matches!(c, Clause::DefinitionIn(_) | Clause::WorkflowIn(_))));
}

#[test]
fn optimizer_hint_doubles_cap() {
    let hinted = plan_for(&FilterRequest::states([LifecycleState::Waiting]).with_cap(50));
    assert_eq!(hinted.hint, Some(OptimizerHint { rows: 100 }));
    assert_eq!(hinted.cap, Some(50));

    let options = PlannerOptions {
        optimizer_hints: false,
        ..Default::default()
    };
    let unhinted = plan(&FilterRequest::states([LifecycleState::Waiting]).with_cap(50), options).unwrap();
    assert_eq!(unhinted.hint, None);

    let uncapped = plan_for(&FilterRequest::states([LifecycleState::Waiting]));
    assert_eq!(uncapped.hint, None);
}

// --- SQL rendering ---

#[test]
fn render_sqlite_query() {
    let plan = plan_for(&FilterRequest::states([LifecycleState::Waiting]).with_cap(10));
    let sql = render(&plan, Dialect::Sqlite);
    assert!(sql.starts_with("SELECT r.workflow_id, x.state FROM step_record r"));
    assert!(sql.contains("r.basic_status IN (20)"));
    assert!(sql.contains("x.state IN (2)"));
    assert!(sql.ends_with("ORDER BY r.workflow_id, r.branch_id"));
}

#[test]
fn render_hints_per_dialect() {
    let plan = plan_for(&FilterRequest::states([LifecycleState::Waiting]).with_cap(10));
    assert!(render(&plan, Dialect::Oracle).starts_with("SELECT /*+ FIRST_ROWS(20) */ "));
    assert!(render(&plan, Dialect::Informix).starts_with("SELECT {+FIRST_ROWS} "));
    assert!(render(&plan, Dialect::Mssql).ends_with(" OPTION (FAST 20)"));
    assert!(render(&plan, Dialect::Db2).ends_with(" OPTIMIZE FOR 20 ROWS"));
    assert!(!render(&plan, Dialect::Postgres).contains("FIRST_ROWS"));
}

#[test]
fn render_without_ordering() {
    let options = PlannerOptions {
        order_by_workflow_id: false,
        optimizer_hints: true,
    };
    let plan = plan(&FilterRequest::states([LifecycleState::Waiting]), options).unwrap();
    assert!(!render(&plan, Dialect::Sqlite).contains("ORDER BY"));
}

#[test]
fn date_literals_per_dialect() {
    let ts = parse_timestamp("2024-05-06 07:08:09").unwrap();
    assert_eq!(Dialect::Sqlite.date_literal(&ts), "'2024-05-06 07:08:09'");
    assert_eq!(Dialect::Mssql.date_literal(&ts), "CONVERT(DATETIME,'2024-05-06 07:08:09',120)");
    assert_eq!(
        Dialect::Oracle.date_literal(&ts),
        "TO_DATE('2024-05-06 07:08:09','YYYY-MM-DD HH24:MI:SS')"
    );
    assert_eq!(
        Dialect::Informix.date_literal(&ts),
        "TO_DATE('2024-05-06 07:08:09','%Y-%m-%d %H:%M:%S')"
    );
}

#[test]
fn render_time_window() {
    let window = TimeWindow {
        from: Some(parse_timestamp("2024-01-01 00:00:00").unwrap()),
        to: Some(parse_timestamp("2024-01-31 23:59:59").unwrap()),
    };
    let plan = plan_for(&FilterRequest::default().with_window(window));
    let sql = render(&plan, Dialect::Db2);
    assert!(sql.contains(
        "x.start_time BETWEEN TO_DATE('2024-01-01 00:00:00','YYYY-MM-DD HH24:MI:SS') \
         AND TO_DATE('2024-01-31 23:59:59','YYYY-MM-DD HH24:MI:SS')"
    ));
}

#[test]
fn postgres_placeholders_are_numbered() {
    assert_eq!(
        Dialect::Postgres.placeholders("a = ? AND b = ?"),
        "a = $1 AND b = $2"
    );
    assert_eq!(Dialect::Sqlite.placeholders("a = ?"), "a = ?");
}

#[test]
fn status_query_lists_ids() {
    let sql = render_status_query(&[3, 4]);
    assert!(sql.contains("workflow_id IN (3, 4)"));
    assert!(sql.contains("ORDER BY workflow_id, status DESC"));
}

#[test]
fn dialect_from_url() {
    assert_eq!(Dialect::from_url("postgres://localhost/db"), Dialect::Postgres);
    assert_eq!(Dialect::from_url("sqlite://flow.db"), Dialect::Sqlite);
}
