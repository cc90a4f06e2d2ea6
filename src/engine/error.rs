use thiserror::Error;

/// Errors raised at the monitor boundary.
///
/// Store failures during state reads and transitions are not surfaced through
/// this type; those operations log and degrade to `Unknown` or `false`.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl MonitorError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        MonitorError::InvalidArgument(msg.into())
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, MonitorError::InvalidArgument(_))
    }
}
