//! Tests for branch classification and instance state merging.

use flowwatch::engine::aggregate::{StateMerge, derive_instance_state, merge_states};
use flowwatch::engine::classifier::{ClassifyMode, Rule, Verdict, classify};
use flowwatch::engine::types::*;

fn record(basic: BasicStatus, engine: EngineStatus, next: NextActivity) -> StepRecord {
    let mut r = StepRecord::first(1, "main", 1, "Service");
    r.step = 3;
    r.activity_id = 3;
    r.basic_status = basic;
    r.engine_status = engine;
    r.next_activity = next;
    r
}

fn state_of(r: &StepRecord, mode: ClassifyMode) -> (LifecycleState, Rule) {
    classify(r, mode).resolve(false)
}

// --- Waiting and interrupts ---

#[test]
fn waiting_record_is_waiting() {
    let r = record(BasicStatus::Waiting, EngineStatus::Default, NextActivity::Activity(4));
    assert_eq!(state_of(&r, ClassifyMode::Instance), (LifecycleState::Waiting, Rule::Waiting));
}

#[test]
fn waiting_on_io_done_depends_on_mode() {
    let r = record(BasicStatus::WaitingOnIo, EngineStatus::Default, NextActivity::Done);
    assert_eq!(state_of(&r, ClassifyMode::Instance).0, LifecycleState::Complete);
    assert_eq!(state_of(&r, ClassifyMode::Branch).0, LifecycleState::WaitingOnIo);
}

#[test]
fn interrupts_complete_when_done() {
    let open = record(BasicStatus::InterruptAuto, EngineStatus::ServiceInterrupted, NextActivity::Noop);
    assert_eq!(state_of(&open, ClassifyMode::Instance).0, LifecycleState::InterruptedAuto);

    let man = record(BasicStatus::InterruptMan, EngineStatus::ServiceInterrupted, NextActivity::Noop);
    assert_eq!(state_of(&man, ClassifyMode::Instance).0, LifecycleState::InterruptedMan);

    let done = record(BasicStatus::InterruptManOffset, EngineStatus::Default, NextActivity::Done);
    assert_eq!(
        state_of(&done, ClassifyMode::Instance),
        (LifecycleState::Complete, Rule::InterruptedMan)
    );
}

// --- Errors ---

#[test]
fn errored_and_done_is_complete_unless_child_done() {
    let done = record(BasicStatus::Error, EngineStatus::Default, NextActivity::Done);
    assert_eq!(state_of(&done, ClassifyMode::Instance).0, LifecycleState::Complete);

    let child = record(BasicStatus::Error, EngineStatus::ChildDone, NextActivity::Done);
    assert_eq!(state_of(&child, ClassifyMode::Instance).0, LifecycleState::Halted);
}

#[test]
fn errored_self_loop_is_halted() {
    let r = record(BasicStatus::SystemError, EngineStatus::Default, NextActivity::Activity(3));
    assert_eq!(state_of(&r, ClassifyMode::Instance), (LifecycleState::Halted, Rule::ErrorLike));
}

#[test]
fn errored_with_halting_engine_status_is_halted() {
    for engine in [
        EngineStatus::InstanceStopped,
        EngineStatus::RemoteError,
        EngineStatus::NameError,
        EngineStatus::JmsError,
    ] {
        let r = record(BasicStatus::Error, engine, NextActivity::Activity(9));
        assert_eq!(state_of(&r, ClassifyMode::Instance).0, LifecycleState::Halted, "{:?}", engine);
    }
}

#[test]
fn warning_follows_the_error_rules() {
    let r = record(BasicStatus::Warning, EngineStatus::WfdDeactivated, NextActivity::Activity(9));
    assert_eq!(state_of(&r, ClassifyMode::Instance).0, LifecycleState::Halted);
}

#[test]
fn errored_without_halting_condition_falls_through_to_active() {
    let r = record(BasicStatus::Error, EngineStatus::Default, NextActivity::Activity(9));
    let verdict = classify(&r, ClassifyMode::Instance);
    assert!(!verdict.needs_inactive_check());
    assert_eq!(verdict.resolve(true), (LifecycleState::Active, Rule::ErrorFallthrough));
}

#[test]
fn archived_error_done_is_complete() {
    let r = record(BasicStatus::ErrorOffset, EngineStatus::Default, NextActivity::Done);
    assert_eq!(
        state_of(&r, ClassifyMode::Instance),
        (LifecycleState::Complete, Rule::ArchivedError)
    );
}

#[test]
fn terminated_record_is_terminated() {
    let r = record(BasicStatus::Terminated, EngineStatus::InstanceTerminated, NextActivity::Noop);
    assert_eq!(state_of(&r, ClassifyMode::Branch).0, LifecycleState::Terminated);
}

// --- Engine fallbacks ---

#[test]
fn engine_done_is_complete() {
    let r = record(BasicStatus::Success, EngineStatus::Default, NextActivity::Done);
    assert_eq!(state_of(&r, ClassifyMode::Instance), (LifecycleState::Complete, Rule::EngineDone));
}

#[test]
fn split_point_is_active_waiting() {
    let r = record(BasicStatus::Success, EngineStatus::Default, NextActivity::Noop);
    assert_eq!(
        state_of(&r, ClassifyMode::Instance),
        (LifecycleState::ActiveWaiting, Rule::SplitPoint)
    );
}

#[test]
fn child_done_success_depends_on_successor() {
    let running = record(BasicStatus::Success, EngineStatus::ChildDone, NextActivity::Activity(5));
    assert_eq!(state_of(&running, ClassifyMode::Instance), (LifecycleState::Active, Rule::ChildDone));
}

#[test]
fn running_branch_needs_inactive_flag() {
    let r = record(BasicStatus::Success, EngineStatus::Default, NextActivity::Activity(5));
    let verdict = classify(&r, ClassifyMode::Instance);
    assert_eq!(verdict, Verdict::Running);
    assert!(verdict.needs_inactive_check());
    assert_eq!(verdict.resolve(false).0, LifecycleState::Active);
    assert_eq!(verdict.resolve(true).0, LifecycleState::Halting);
}

#[test]
fn unmatched_record_is_unknown() {
    let r = record(BasicStatus::Success, EngineStatus::InstanceTerminated, NextActivity::Noop);
    assert_eq!(state_of(&r, ClassifyMode::Instance), (LifecycleState::Unknown, Rule::NoMatch));
}

// --- Merging ---

#[test]
fn most_active_branch_wins() {
    assert_eq!(
        merge_states([LifecycleState::Complete, LifecycleState::Waiting, LifecycleState::Halted]),
        LifecycleState::Waiting
    );
    assert_eq!(
        merge_states([LifecycleState::Terminated, LifecycleState::Active]),
        LifecycleState::Active
    );
    assert_eq!(
        merge_states([LifecycleState::Halting, LifecycleState::Waiting]),
        LifecycleState::Halting
    );
}

#[test]
fn active_waiting_loses_to_everything_and_reports_active() {
    assert_eq!(
        merge_states([LifecycleState::ActiveWaiting, LifecycleState::Complete]),
        LifecycleState::Complete
    );
    assert_eq!(merge_states([LifecycleState::ActiveWaiting]), LifecycleState::Active);
}

#[test]
fn unknown_branches_are_ignored() {
    let mut merge = StateMerge::new();
    merge.add(LifecycleState::Unknown);
    merge.add(LifecycleState::Terminated);
    assert_eq!(merge.finish(), LifecycleState::Terminated);
    assert_eq!(merge.unclassified(), 1);

    assert_eq!(merge_states([LifecycleState::Unknown]), LifecycleState::Unknown);
    assert_eq!(merge_states(Vec::new()), LifecycleState::Unknown);
}

#[test]
fn instance_state_from_latest_records() {
    let waiting = record(BasicStatus::Waiting, EngineStatus::Default, NextActivity::Activity(4));
    let mut done = record(BasicStatus::Success, EngineStatus::Default, NextActivity::Done);
    done.branch_id = "side".to_string();
    assert_eq!(derive_instance_state([&waiting, &done], false), LifecycleState::Waiting);

    let running = record(BasicStatus::Success, EngineStatus::Default, NextActivity::Activity(4));
    assert_eq!(derive_instance_state([&running, &done], true), LifecycleState::Halting);
}
