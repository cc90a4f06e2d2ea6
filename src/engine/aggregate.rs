//! Merging per-branch states into one instance state.
//!
//! Each branch state occupies a precedence slot and the instance reports the
//! highest occupied slot: if any branch is still doing work, the most active
//! state found wins.

use super::classifier::{ClassifyMode, classify};
use super::types::{LifecycleState, StepRecord};

const SLOTS: usize = 11;

/// Slot of a branch state; higher wins. `Unknown` has no slot.
fn slot(state: LifecycleState) -> Option<usize> {
    match state {
        LifecycleState::Active => Some(10),
        LifecycleState::Halting => Some(9),
        LifecycleState::Waiting => Some(8),
        LifecycleState::WaitingOnIo => Some(7),
        LifecycleState::Terminated => Some(6),
        LifecycleState::InterruptedMan => Some(5),
        LifecycleState::InterruptedAuto => Some(4),
        LifecycleState::Halted => Some(3),
        LifecycleState::Complete => Some(2),
        LifecycleState::ActiveWaiting => Some(1),
        LifecycleState::Unknown => None,
    }
}

fn state_of_slot(slot: usize) -> LifecycleState {
    match slot {
        10 | 1 => LifecycleState::Active,
        9 => LifecycleState::Halting,
        8 => LifecycleState::Waiting,
        7 => LifecycleState::WaitingOnIo,
        6 => LifecycleState::Terminated,
        5 => LifecycleState::InterruptedMan,
        4 => LifecycleState::InterruptedAuto,
        3 => LifecycleState::Halted,
        2 => LifecycleState::Complete,
        _ => LifecycleState::Unknown,
    }
}

/// Accumulates branch states for one instance.
#[derive(Debug, Default, Clone)]
pub struct StateMerge {
    occupied: [bool; SLOTS],
    unclassified: usize,
}

impl StateMerge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, state: LifecycleState) {
        match slot(state) {
            Some(s) => self.occupied[s] = true,
            None => self.unclassified += 1,
        }
    }

    /// Number of branches that could not be classified.
    pub fn unclassified(&self) -> usize {
        self.unclassified
    }

    pub fn finish(&self) -> LifecycleState {
        (0..SLOTS)
            .rev()
            .find(|&s| self.occupied[s])
            .map(state_of_slot)
            .unwrap_or(LifecycleState::Unknown)
    }
}

/// Merge a set of branch states.
pub fn merge_states<I>(states: I) -> LifecycleState
where
    I: IntoIterator<Item = LifecycleState>,
{
    let mut merge = StateMerge::new();
    for state in states {
        merge.add(state);
    }
    merge.finish()
}

/// Instance state from the latest record of every branch, with the
/// administrative-stop flag already known. Stores use this to maintain their
/// state index.
pub fn derive_instance_state<'a, I>(latest: I, inactive: bool) -> LifecycleState
where
    I: IntoIterator<Item = &'a StepRecord>,
{
    merge_states(
        latest
            .into_iter()
            .map(|record| classify(record, ClassifyMode::Instance).resolve(inactive).0),
    )
}
