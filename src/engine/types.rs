use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MonitorError;

/// Identifier of a workflow instance.
pub type WorkflowId = i64;

/// Parse a workflow id supplied by an operator or an HTTP path.
pub fn parse_workflow_id(raw: &str) -> Result<WorkflowId, MonitorError> {
    raw.trim()
        .parse::<WorkflowId>()
        .map_err(|_| MonitorError::invalid(format!("'{}' is not a workflow id", raw)))
}

/// Derived lifecycle state of a branch or a whole workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unknown,
    Active,
    Complete,
    Terminated,
    Waiting,
    Halted,
    Halting,
    InterruptedAuto,
    InterruptedMan,
    ActiveWaiting,
    WaitingOnIo,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 11] = [
        LifecycleState::Unknown,
        LifecycleState::Active,
        LifecycleState::Complete,
        LifecycleState::Terminated,
        LifecycleState::Waiting,
        LifecycleState::Halted,
        LifecycleState::Halting,
        LifecycleState::InterruptedAuto,
        LifecycleState::InterruptedMan,
        LifecycleState::ActiveWaiting,
        LifecycleState::WaitingOnIo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unknown => "unknown",
            LifecycleState::Active => "active",
            LifecycleState::Complete => "complete",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Halted => "halted",
            LifecycleState::Halting => "halting",
            LifecycleState::InterruptedAuto => "interrupted_auto",
            LifecycleState::InterruptedMan => "interrupted_man",
            LifecycleState::ActiveWaiting => "active_waiting",
            LifecycleState::WaitingOnIo => "waiting_on_io",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| MonitorError::invalid(format!("unknown state '{}'", s)))
    }
}

/// Aggregate health of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Warning,
    Error,
    Unknown,
}

impl Status {
    /// Ordinal used by the store index. Higher is worse.
    pub fn code(&self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Warning => 1,
            Status::Error => 2,
            Status::Unknown => -1,
        }
    }

    pub fn from_code(code: i64) -> Status {
        match code {
            0 => Status::Success,
            1 => Status::Warning,
            2 => Status::Error,
            _ => Status::Unknown,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Warning => write!(f, "warning"),
            Status::Error => write!(f, "error"),
            Status::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Status::Success),
            "warning" => Ok(Status::Warning),
            "error" => Ok(Status::Error),
            "unknown" => Ok(Status::Unknown),
            _ => Err(MonitorError::invalid(format!("unknown status '{}'", s))),
        }
    }
}

/// Distance between a basic status code and its archival offset twin.
pub const OFFSET: i32 = 100;

/// Coarse status code stamped on every step record.
///
/// Offset variants are written once a branch has been archived and indexed;
/// they mean the same thing as their base code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum BasicStatus {
    None,
    Success,
    Error,
    SystemError,
    WfeSystemError,
    ServiceConfigError,
    Warning,
    Waiting,
    WaitingOnIo,
    Terminated,
    InterruptAuto,
    InterruptMan,
    ErrorOffset,
    SystemErrorOffset,
    WfeSystemErrorOffset,
    ServiceConfigErrorOffset,
    WaitingOffset,
    WaitingOnIoOffset,
    InterruptAutoOffset,
    InterruptManOffset,
    Other(i32),
}

impl BasicStatus {
    pub fn code(&self) -> i32 {
        match self {
            BasicStatus::None => -1,
            BasicStatus::Success => 0,
            BasicStatus::Error => 1,
            BasicStatus::SystemError => 2,
            BasicStatus::WfeSystemError => 3,
            BasicStatus::ServiceConfigError => 4,
            BasicStatus::Warning => 10,
            BasicStatus::Waiting => 20,
            BasicStatus::WaitingOnIo => 21,
            BasicStatus::Terminated => 30,
            BasicStatus::InterruptAuto => 40,
            BasicStatus::InterruptMan => 41,
            BasicStatus::ErrorOffset => 1 + OFFSET,
            BasicStatus::SystemErrorOffset => 2 + OFFSET,
            BasicStatus::WfeSystemErrorOffset => 3 + OFFSET,
            BasicStatus::ServiceConfigErrorOffset => 4 + OFFSET,
            BasicStatus::WaitingOffset => 20 + OFFSET,
            BasicStatus::WaitingOnIoOffset => 21 + OFFSET,
            BasicStatus::InterruptAutoOffset => 40 + OFFSET,
            BasicStatus::InterruptManOffset => 41 + OFFSET,
            BasicStatus::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> BasicStatus {
        match code {
            -1 => BasicStatus::None,
            0 => BasicStatus::Success,
            1 => BasicStatus::Error,
            2 => BasicStatus::SystemError,
            3 => BasicStatus::WfeSystemError,
            4 => BasicStatus::ServiceConfigError,
            10 => BasicStatus::Warning,
            20 => BasicStatus::Waiting,
            21 => BasicStatus::WaitingOnIo,
            30 => BasicStatus::Terminated,
            40 => BasicStatus::InterruptAuto,
            41 => BasicStatus::InterruptMan,
            101 => BasicStatus::ErrorOffset,
            102 => BasicStatus::SystemErrorOffset,
            103 => BasicStatus::WfeSystemErrorOffset,
            104 => BasicStatus::ServiceConfigErrorOffset,
            120 => BasicStatus::WaitingOffset,
            121 => BasicStatus::WaitingOnIoOffset,
            140 => BasicStatus::InterruptAutoOffset,
            141 => BasicStatus::InterruptManOffset,
            other => BasicStatus::Other(other),
        }
    }

    pub fn is_offset(&self) -> bool {
        self.normalized() != *self
    }

    /// Map an offset code onto its base code. Non-offset codes are returned as-is.
    pub fn normalized(&self) -> BasicStatus {
        match self {
            BasicStatus::ErrorOffset => BasicStatus::Error,
            BasicStatus::SystemErrorOffset => BasicStatus::SystemError,
            BasicStatus::WfeSystemErrorOffset => BasicStatus::WfeSystemError,
            BasicStatus::ServiceConfigErrorOffset => BasicStatus::ServiceConfigError,
            BasicStatus::WaitingOffset => BasicStatus::Waiting,
            BasicStatus::WaitingOnIoOffset => BasicStatus::WaitingOnIo,
            BasicStatus::InterruptAutoOffset => BasicStatus::InterruptAuto,
            BasicStatus::InterruptManOffset => BasicStatus::InterruptMan,
            other => *other,
        }
    }

    /// Error, system error, engine system error and service config error.
    pub fn is_error_like(&self) -> bool {
        matches!(
            self,
            BasicStatus::Error
                | BasicStatus::SystemError
                | BasicStatus::WfeSystemError
                | BasicStatus::ServiceConfigError
        )
    }
}

impl From<i32> for BasicStatus {
    fn from(code: i32) -> Self {
        BasicStatus::from_code(code)
    }
}

impl From<BasicStatus> for i32 {
    fn from(status: BasicStatus) -> Self {
        status.code()
    }
}

/// Fine-grained condition reported by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum EngineStatus {
    Default,
    ChildDone,
    InstanceStopped,
    InstanceTerminated,
    WfdDeactivated,
    ServiceDeactivated,
    RemoteError,
    CreateError,
    BasicError,
    NameError,
    LicenseError,
    JmsError,
    ServiceInterrupted,
    WaitingOnIo,
    SystemShutdown,
    Other(i32),
}

impl EngineStatus {
    pub fn code(&self) -> i32 {
        match self {
            EngineStatus::Default => 0,
            EngineStatus::ChildDone => 1,
            EngineStatus::InstanceStopped => 2,
            EngineStatus::InstanceTerminated => 3,
            EngineStatus::WfdDeactivated => 4,
            EngineStatus::ServiceDeactivated => 5,
            EngineStatus::RemoteError => 6,
            EngineStatus::CreateError => 7,
            EngineStatus::BasicError => 8,
            EngineStatus::NameError => 9,
            EngineStatus::LicenseError => 10,
            EngineStatus::JmsError => 11,
            EngineStatus::ServiceInterrupted => 12,
            EngineStatus::WaitingOnIo => 13,
            EngineStatus::SystemShutdown => 100,
            EngineStatus::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> EngineStatus {
        match code {
            0 => EngineStatus::Default,
            1 => EngineStatus::ChildDone,
            2 => EngineStatus::InstanceStopped,
            3 => EngineStatus::InstanceTerminated,
            4 => EngineStatus::WfdDeactivated,
            5 => EngineStatus::ServiceDeactivated,
            6 => EngineStatus::RemoteError,
            7 => EngineStatus::CreateError,
            8 => EngineStatus::BasicError,
            9 => EngineStatus::NameError,
            10 => EngineStatus::LicenseError,
            11 => EngineStatus::JmsError,
            12 => EngineStatus::ServiceInterrupted,
            13 => EngineStatus::WaitingOnIo,
            100 => EngineStatus::SystemShutdown,
            other => EngineStatus::Other(other),
        }
    }
}

impl From<i32> for EngineStatus {
    fn from(code: i32) -> Self {
        EngineStatus::from_code(code)
    }
}

impl From<EngineStatus> for i32 {
    fn from(status: EngineStatus) -> Self {
        status.code()
    }
}

/// Successor activity of a step, or one of the two sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum NextActivity {
    /// The workflow has nothing left to run on this branch.
    Done,
    /// No successor yet: the branch sits at a split point.
    Noop,
    Activity(i32),
}

impl NextActivity {
    pub const DONE_CODE: i32 = -2;
    pub const NOOP_CODE: i32 = -1;

    pub fn code(&self) -> i32 {
        match self {
            NextActivity::Done => Self::DONE_CODE,
            NextActivity::Noop => Self::NOOP_CODE,
            NextActivity::Activity(id) => *id,
        }
    }

    pub fn from_code(code: i32) -> NextActivity {
        match code {
            Self::DONE_CODE => NextActivity::Done,
            Self::NOOP_CODE => NextActivity::Noop,
            id => NextActivity::Activity(id),
        }
    }
}

impl From<i32> for NextActivity {
    fn from(code: i32) -> Self {
        NextActivity::from_code(code)
    }
}

impl From<NextActivity> for i32 {
    fn from(next: NextActivity) -> Self {
        next.code()
    }
}

/// One immutable entry in a branch's execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub prev_id: Option<Uuid>,
    pub workflow_id: WorkflowId,
    pub branch_id: String,
    pub step: i64,
    pub activity_id: i32,
    pub next_activity: NextActivity,
    pub basic_status: BasicStatus,
    pub engine_status: EngineStatus,
    pub adv_status: Option<String>,
    pub service_name: String,
    pub definition_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status_report: Option<String>,
    /// Set once the archive indexer has processed the record.
    pub indexed: bool,
}

impl StepRecord {
    /// Step 0 of a new branch.
    pub fn first(
        workflow_id: WorkflowId,
        branch_id: impl Into<String>,
        definition_id: i64,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            prev_id: None,
            workflow_id,
            branch_id: branch_id.into(),
            step: 0,
            activity_id: 0,
            next_activity: NextActivity::Activity(1),
            basic_status: BasicStatus::None,
            engine_status: EngineStatus::Default,
            adv_status: None,
            service_name: service_name.into(),
            definition_id,
            start_time: Utc::now(),
            end_time: None,
            status_report: None,
            indexed: false,
        }
    }

    /// The next record in this branch's chain, inheriting the current fields.
    pub fn successor(&self) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            prev_id: Some(self.id),
            step: self.step + 1,
            start_time: now,
            end_time: None,
            status_report: None,
            indexed: false,
            ..self.clone()
        }
    }
}

/// Cached classification of one branch. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub workflow_id: WorkflowId,
    pub branch_id: String,
    pub state: LifecycleState,
    pub engine_status: EngineStatus,
    pub basic_status: BasicStatus,
    pub adv_status: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Who asked for an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptKind {
    Automatic,
    Manual,
}

impl InterruptKind {
    pub fn basic_status(&self) -> BasicStatus {
        match self {
            InterruptKind::Automatic => BasicStatus::InterruptAuto,
            InterruptKind::Manual => BasicStatus::InterruptMan,
        }
    }
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptKind::Automatic => write!(f, "automatic"),
            InterruptKind::Manual => write!(f, "manual"),
        }
    }
}

/// Bounds on an instance's start time. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Attribution for a terminate request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user: Option<String>,
    /// Workflow and service that issued the request, when another workflow did.
    pub origin: Option<(WorkflowId, String)>,
}

impl Requester {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: Some(name.into()),
            origin: None,
        }
    }

    pub fn from_workflow(workflow_id: WorkflowId, service: impl Into<String>) -> Self {
        Self {
            user: None,
            origin: Some((workflow_id, service.into())),
        }
    }
}

/// Archival selection for [`crate::engine::WorkflowMonitor::movable_ids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovableSelection {
    Complete,
    Terminated,
    CompleteOrTerminated,
}

impl MovableSelection {
    pub fn states(&self) -> Vec<LifecycleState> {
        match self {
            MovableSelection::Complete => vec![LifecycleState::Complete],
            MovableSelection::Terminated => vec![LifecycleState::Terminated],
            MovableSelection::CompleteOrTerminated => {
                vec![LifecycleState::Complete, LifecycleState::Terminated]
            }
        }
    }
}

impl std::str::FromStr for MovableSelection {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "complete" => Ok(MovableSelection::Complete),
            "terminated" => Ok(MovableSelection::Terminated),
            "complete_or_terminated" => Ok(MovableSelection::CompleteOrTerminated),
            _ => Err(MonitorError::invalid(format!(
                "unknown selection '{}'. Use: complete, terminated, complete_or_terminated",
                s
            ))),
        }
    }
}

/// Parse an RFC 3339 timestamp or a `YYYY-MM-DD HH:MM:SS` UTC time.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, MonitorError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| MonitorError::invalid(format!("'{}' is not a timestamp", raw)))
}
