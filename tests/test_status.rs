//! Tests for status aggregation and state precedence codes.

use flowwatch::engine::precedence::{UNKNOWN_CODE, decode, encode, filter_codes};
use flowwatch::engine::status::{error_codes, status_of, worst_status};
use flowwatch::engine::types::*;

// --- Status ---

#[test]
fn single_code_status() {
    assert_eq!(status_of(BasicStatus::Success), Status::Success);
    assert_eq!(status_of(BasicStatus::Waiting), Status::Success);
    assert_eq!(status_of(BasicStatus::Terminated), Status::Success);
    assert_eq!(status_of(BasicStatus::Warning), Status::Warning);
    assert_eq!(status_of(BasicStatus::Error), Status::Error);
    assert_eq!(status_of(BasicStatus::WfeSystemErrorOffset), Status::Error);
    assert_eq!(status_of(BasicStatus::InterruptAuto), Status::Error);
    assert_eq!(status_of(BasicStatus::InterruptManOffset), Status::Error);
}

#[test]
fn worst_status_prefers_error_over_warning() {
    let statuses = [BasicStatus::Success, BasicStatus::Warning, BasicStatus::Error];
    assert_eq!(worst_status(statuses), Status::Error);

    let statuses = [BasicStatus::Success, BasicStatus::Warning, BasicStatus::Success];
    assert_eq!(worst_status(statuses), Status::Warning);

    assert_eq!(worst_status([BasicStatus::Success, BasicStatus::None]), Status::Success);
}

#[test]
fn early_error_is_not_masked_by_later_success() {
    let statuses = [BasicStatus::Error, BasicStatus::Success, BasicStatus::Success];
    assert_eq!(worst_status(statuses), Status::Error);
}

#[test]
fn error_codes_cover_offsets_and_interrupts() {
    let codes = error_codes();
    for code in [1, 2, 3, 4, 40, 41, 101, 102, 103, 104, 140, 141] {
        assert!(codes.contains(&code), "missing {}", code);
    }
    assert!(!codes.contains(&10));
    assert!(!codes.contains(&20));
}

// --- Precedence ---

#[test]
fn encode_decode_round_trip_except_active_waiting() {
    for state in LifecycleState::ALL {
        let decoded = decode(encode(state));
        match state {
            LifecycleState::ActiveWaiting => assert_eq!(decoded, LifecycleState::Active),
            other => assert_eq!(decoded, other),
        }
    }
}

#[test]
fn fixed_codes() {
    assert_eq!(encode(LifecycleState::Active), 0);
    assert_eq!(encode(LifecycleState::Halted), 7);
    assert_eq!(encode(LifecycleState::Complete), 8);
    assert_eq!(encode(LifecycleState::ActiveWaiting), 9);
    assert_eq!(encode(LifecycleState::Unknown), UNKNOWN_CODE);
    assert_eq!(decode(42), LifecycleState::Unknown);
}

#[test]
fn active_filter_includes_active_waiting() {
    assert_eq!(filter_codes(LifecycleState::Active), vec![0, 9]);
    assert_eq!(filter_codes(LifecycleState::Terminated), vec![4]);
}
