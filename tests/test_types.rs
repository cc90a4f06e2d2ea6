//! Tests for core types: status codes, lifecycle names and record chaining.

use flowwatch::engine::types::*;

// --- Codes ---

#[test]
fn basic_status_codes_match_engine_values() {
    assert_eq!(BasicStatus::None.code(), -1);
    assert_eq!(BasicStatus::Success.code(), 0);
    assert_eq!(BasicStatus::Error.code(), 1);
    assert_eq!(BasicStatus::Warning.code(), 10);
    assert_eq!(BasicStatus::Waiting.code(), 20);
    assert_eq!(BasicStatus::WaitingOnIo.code(), 21);
    assert_eq!(BasicStatus::Terminated.code(), 30);
    assert_eq!(BasicStatus::InterruptAuto.code(), 40);
    assert_eq!(BasicStatus::InterruptMan.code(), 41);
    assert_eq!(BasicStatus::ErrorOffset.code(), 101);
    assert_eq!(BasicStatus::InterruptManOffset.code(), 141);
}

#[test]
fn basic_status_unknown_code_is_preserved() {
    let status = BasicStatus::from_code(77);
    assert_eq!(status, BasicStatus::Other(77));
    assert_eq!(status.code(), 77);
}

#[test]
fn offset_codes_normalize_to_base() {
    assert!(BasicStatus::WaitingOffset.is_offset());
    assert_eq!(BasicStatus::WaitingOffset.normalized(), BasicStatus::Waiting);
    assert_eq!(BasicStatus::SystemErrorOffset.normalized(), BasicStatus::SystemError);
    assert!(!BasicStatus::Waiting.is_offset());
    assert!(!BasicStatus::Other(55).is_offset());
}

#[test]
fn error_like_excludes_offsets_and_interrupts() {
    assert!(BasicStatus::Error.is_error_like());
    assert!(BasicStatus::ServiceConfigError.is_error_like());
    assert!(!BasicStatus::ErrorOffset.is_error_like());
    assert!(!BasicStatus::InterruptMan.is_error_like());
    assert!(!BasicStatus::Warning.is_error_like());
}

#[test]
fn engine_status_codes() {
    assert_eq!(EngineStatus::Default.code(), 0);
    assert_eq!(EngineStatus::ChildDone.code(), 1);
    assert_eq!(EngineStatus::ServiceInterrupted.code(), 12);
    assert_eq!(EngineStatus::SystemShutdown.code(), 100);
    assert_eq!(EngineStatus::from_code(13), EngineStatus::WaitingOnIo);
}

#[test]
fn next_activity_sentinels() {
    assert_eq!(NextActivity::from_code(-2), NextActivity::Done);
    assert_eq!(NextActivity::from_code(-1), NextActivity::Noop);
    assert_eq!(NextActivity::from_code(4), NextActivity::Activity(4));
    assert_eq!(NextActivity::Done.code(), NextActivity::DONE_CODE);
}

#[test]
fn basic_status_serializes_as_code() {
    let json = serde_json::to_string(&BasicStatus::InterruptAuto).unwrap();
    assert_eq!(json, "40");
    let back: BasicStatus = serde_json::from_str("121").unwrap();
    assert_eq!(back, BasicStatus::WaitingOnIoOffset);
}

// --- Names ---

#[test]
fn lifecycle_state_display_and_parse() {
    for state in LifecycleState::ALL {
        let parsed: LifecycleState = state.to_string().parse().unwrap();
        assert_eq!(parsed, state);
    }
    assert_eq!(
        "waiting-on-io".parse::<LifecycleState>().unwrap(),
        LifecycleState::WaitingOnIo
    );
    assert_eq!(
        " HALTED ".parse::<LifecycleState>().unwrap(),
        LifecycleState::Halted
    );
}

#[test]
fn lifecycle_state_parse_rejects_garbage() {
    let err = "sleeping".parse::<LifecycleState>().unwrap_err();
    assert!(err.is_invalid_argument());
}

#[test]
fn lifecycle_state_serde_is_snake_case() {
    let json = serde_json::to_string(&LifecycleState::InterruptedMan).unwrap();
    assert_eq!(json, "\"interrupted_man\"");
}

#[test]
fn status_parse_and_codes() {
    assert_eq!("Error".parse::<Status>().unwrap(), Status::Error);
    assert_eq!(Status::Error.code(), 2);
    assert_eq!(Status::from_code(1), Status::Warning);
    assert_eq!(Status::from_code(9), Status::Unknown);
    assert!("fine".parse::<Status>().is_err());
}

#[test]
fn movable_selection_parse() {
    assert_eq!(
        "complete-or-terminated".parse::<MovableSelection>().unwrap(),
        MovableSelection::CompleteOrTerminated
    );
    assert_eq!(
        MovableSelection::CompleteOrTerminated.states(),
        vec![LifecycleState::Complete, LifecycleState::Terminated]
    );
    assert!("archived".parse::<MovableSelection>().is_err());
}

// --- Parsing helpers ---

#[test]
fn parse_workflow_id_accepts_numbers_only() {
    assert_eq!(parse_workflow_id(" 42 ").unwrap(), 42);
    let err = parse_workflow_id("abc").unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.to_string().contains("abc"));
}

#[test]
fn parse_timestamp_formats() {
    let a = parse_timestamp("2024-03-01T10:00:00Z").unwrap();
    let b = parse_timestamp("2024-03-01 10:00:00").unwrap();
    assert_eq!(a, b);
    assert!(parse_timestamp("yesterday").unwrap_err().is_invalid_argument());
}

// --- Records ---

#[test]
fn first_record_starts_branch() {
    let record = StepRecord::first(9, "main", 3, "Start");
    assert_eq!(record.step, 0);
    assert_eq!(record.prev_id, None);
    assert_eq!(record.next_activity, NextActivity::Activity(1));
    assert_eq!(record.basic_status, BasicStatus::None);
    assert_eq!(record.definition_id, 3);
}

#[test]
fn successor_chains_to_previous() {
    let mut first = StepRecord::first(9, "main", 3, "Start");
    first.end_time = Some(first.start_time);
    first.status_report = Some("done".to_string());
    first.indexed = true;

    let next = first.successor();
    assert_ne!(next.id, first.id);
    assert_eq!(next.prev_id, Some(first.id));
    assert_eq!(next.step, 1);
    assert_eq!(next.branch_id, "main");
    assert_eq!(next.end_time, None);
    assert_eq!(next.status_report, None);
    assert!(!next.indexed);
}

#[test]
fn interrupt_kind_maps_to_basic_status() {
    assert_eq!(InterruptKind::Automatic.basic_status(), BasicStatus::InterruptAuto);
    assert_eq!(InterruptKind::Manual.basic_status(), BasicStatus::InterruptMan);
    let kind: InterruptKind = serde_json::from_str("\"manual\"").unwrap();
    assert_eq!(kind, InterruptKind::Manual);
}

#[test]
fn time_window_openness() {
    assert!(TimeWindow::default().is_open());
    let window = TimeWindow {
        from: Some(parse_timestamp("2024-01-01 00:00:00").unwrap()),
        to: None,
    };
    assert!(!window.is_open());
}
