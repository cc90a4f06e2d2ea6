//! Branch state classification.
//!
//! A branch's state is derived from its latest step record by an ordered rule
//! list; the first matching rule wins. The final rule needs to know whether the
//! instance has been administratively stopped, which requires a store lookup,
//! so [`classify`] stays pure and hands that case back as [`Verdict::Running`].

use super::types::{BasicStatus, EngineStatus, LifecycleState, NextActivity, StepRecord};

/// Which flavour of the rule list to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyMode {
    /// Used while merging all branches of an instance. A waiting-on-io branch
    /// whose successor is DONE counts as complete.
    Instance,
    /// Used when picking branches for a transition.
    Branch,
}

/// The rule that produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Waiting,
    WaitingOnIo,
    InterruptedAuto,
    InterruptedMan,
    ErrorLike,
    /// Error-like status that matched none of the halted conditions and was
    /// reported as active by default.
    ErrorFallthrough,
    ArchivedError,
    Terminated,
    EngineDone,
    SplitPoint,
    ChildDone,
    Running,
    NoMatch,
}

/// Engine conditions that make an errored branch count as halted.
const HALTING_ENGINE_STATUSES: [EngineStatus; 9] = [
    EngineStatus::InstanceStopped,
    EngineStatus::WfdDeactivated,
    EngineStatus::ServiceDeactivated,
    EngineStatus::RemoteError,
    EngineStatus::CreateError,
    EngineStatus::BasicError,
    EngineStatus::NameError,
    EngineStatus::LicenseError,
    EngineStatus::JmsError,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Classified { state: LifecycleState, rule: Rule },
    /// The branch has a real successor activity. It is halting if the
    /// instance was marked inactive, otherwise active.
    Running,
}

impl Verdict {
    fn of(state: LifecycleState, rule: Rule) -> Self {
        Verdict::Classified { state, rule }
    }

    pub fn needs_inactive_check(&self) -> bool {
        matches!(self, Verdict::Running)
    }

    pub fn resolve(self, inactive: bool) -> (LifecycleState, Rule) {
        match self {
            Verdict::Classified { state, rule } => (state, rule),
            Verdict::Running if inactive => (LifecycleState::Halting, Rule::Running),
            Verdict::Running => (LifecycleState::Active, Rule::Running),
        }
    }
}

pub fn classify(record: &StepRecord, mode: ClassifyMode) -> Verdict {
    use BasicStatus as B;
    use LifecycleState as S;

    let done = record.next_activity == NextActivity::Done;

    match record.basic_status {
        B::Waiting => Verdict::of(S::Waiting, Rule::Waiting),
        B::WaitingOnIo if done && mode == ClassifyMode::Instance => {
            Verdict::of(S::Complete, Rule::WaitingOnIo)
        }
        B::WaitingOnIo => Verdict::of(S::WaitingOnIo, Rule::WaitingOnIo),
        B::InterruptAuto if done => Verdict::of(S::Complete, Rule::InterruptedAuto),
        B::InterruptAuto => Verdict::of(S::InterruptedAuto, Rule::InterruptedAuto),
        B::InterruptAutoOffset if done => Verdict::of(S::Complete, Rule::InterruptedAuto),
        B::InterruptMan if done => Verdict::of(S::Complete, Rule::InterruptedMan),
        B::InterruptMan => Verdict::of(S::InterruptedMan, Rule::InterruptedMan),
        B::InterruptManOffset if done => Verdict::of(S::Complete, Rule::InterruptedMan),
        b if b.is_error_like() || b == B::Warning => classify_errored(record, done),
        B::ErrorOffset | B::SystemErrorOffset | B::WfeSystemErrorOffset | B::ServiceConfigErrorOffset
            if done =>
        {
            Verdict::of(S::Complete, Rule::ArchivedError)
        }
        B::Terminated => Verdict::of(S::Terminated, Rule::Terminated),
        _ => classify_by_engine(record, done),
    }
}

fn classify_errored(record: &StepRecord, done: bool) -> Verdict {
    if done {
        if record.engine_status == EngineStatus::ChildDone {
            return Verdict::of(LifecycleState::Halted, Rule::ErrorLike);
        }
        return Verdict::of(LifecycleState::Complete, Rule::ErrorLike);
    }
    // A step pointing at itself is how a disabled sub-workflow loop shows up.
    if record.next_activity == NextActivity::Activity(record.activity_id) {
        return Verdict::of(LifecycleState::Halted, Rule::ErrorLike);
    }
    if HALTING_ENGINE_STATUSES.contains(&record.engine_status) {
        return Verdict::of(LifecycleState::Halted, Rule::ErrorLike);
    }
    Verdict::of(LifecycleState::Active, Rule::ErrorFallthrough)
}

fn classify_by_engine(record: &StepRecord, done: bool) -> Verdict {
    let engine = record.engine_status;
    match record.next_activity {
        NextActivity::Done if engine == EngineStatus::Default => {
            Verdict::of(LifecycleState::Complete, Rule::EngineDone)
        }
        NextActivity::Noop if engine == EngineStatus::Default => {
            Verdict::of(LifecycleState::ActiveWaiting, Rule::SplitPoint)
        }
        _ if record.basic_status == BasicStatus::Success && engine == EngineStatus::ChildDone => {
            let state = if done {
                LifecycleState::Complete
            } else {
                LifecycleState::Active
            };
            Verdict::of(state, Rule::ChildDone)
        }
        NextActivity::Activity(_) => Verdict::Running,
        _ => Verdict::of(LifecycleState::Unknown, Rule::NoMatch),
    }
}
