//! Compact ordinal codes for lifecycle states, as stored in the instance index.

use super::types::LifecycleState;

pub const UNKNOWN_CODE: i32 = -1;

/// Encode a state into its index ordinal. Never fails.
pub fn encode(state: LifecycleState) -> i32 {
    match state {
        LifecycleState::Active => 0,
        LifecycleState::Halting => 1,
        LifecycleState::Waiting => 2,
        LifecycleState::WaitingOnIo => 3,
        LifecycleState::Terminated => 4,
        LifecycleState::InterruptedMan => 5,
        LifecycleState::InterruptedAuto => 6,
        LifecycleState::Halted => 7,
        LifecycleState::Complete => 8,
        LifecycleState::ActiveWaiting => 9,
        LifecycleState::Unknown => UNKNOWN_CODE,
    }
}

/// Decode an index ordinal. `ActiveWaiting` comes back as `Active`; anything
/// unmapped is `Unknown`.
pub fn decode(code: i32) -> LifecycleState {
    match code {
        0 | 9 => LifecycleState::Active,
        1 => LifecycleState::Halting,
        2 => LifecycleState::Waiting,
        3 => LifecycleState::WaitingOnIo,
        4 => LifecycleState::Terminated,
        5 => LifecycleState::InterruptedMan,
        6 => LifecycleState::InterruptedAuto,
        7 => LifecycleState::Halted,
        8 => LifecycleState::Complete,
        _ => LifecycleState::Unknown,
    }
}

/// Codes a state filter must match. Asking for `Active` also matches rows
/// stored as `ActiveWaiting`.
pub fn filter_codes(state: LifecycleState) -> Vec<i32> {
    match state {
        LifecycleState::Active => vec![encode(LifecycleState::Active), encode(LifecycleState::ActiveWaiting)],
        other => vec![encode(other)],
    }
}
