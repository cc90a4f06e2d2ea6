//! Worst-of aggregation of branch health into an instance status.

use super::types::{BasicStatus, Status};

/// Health carried by a single basic status code.
///
/// Interrupts count as errors. Waiting, terminated and success codes carry no
/// error signal and map to success.
pub fn status_of(basic: BasicStatus) -> Status {
    match basic.normalized() {
        BasicStatus::Error
        | BasicStatus::SystemError
        | BasicStatus::WfeSystemError
        | BasicStatus::ServiceConfigError
        | BasicStatus::InterruptAuto
        | BasicStatus::InterruptMan => Status::Error,
        BasicStatus::Warning => Status::Warning,
        _ => Status::Success,
    }
}

/// Fold basic statuses into one status, stopping at the first error.
pub fn worst_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = BasicStatus>,
{
    let mut worst = Status::Success;
    for basic in statuses {
        match status_of(basic) {
            Status::Error => return Status::Error,
            Status::Warning => worst = Status::Warning,
            _ => {}
        }
    }
    worst
}

/// Basic status codes that count as errors, offsets included.
pub fn error_codes() -> Vec<i32> {
    [
        BasicStatus::Error,
        BasicStatus::ErrorOffset,
        BasicStatus::SystemError,
        BasicStatus::SystemErrorOffset,
        BasicStatus::WfeSystemError,
        BasicStatus::WfeSystemErrorOffset,
        BasicStatus::ServiceConfigError,
        BasicStatus::ServiceConfigErrorOffset,
        BasicStatus::InterruptMan,
        BasicStatus::InterruptManOffset,
        BasicStatus::InterruptAuto,
        BasicStatus::InterruptAutoOffset,
    ]
    .iter()
    .map(BasicStatus::code)
    .collect()
}
