use serde::{Deserialize, Serialize};

use crate::models::{TaskId, TaskStage};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    InvalidInput,
    InvalidState,
    NotFound,
    Busy,
    Configuration,
    Upload,
    NoSubject,
    RateLimited,
    Unauthorized,
    RemoteRejected,
    RemoteTaskNotFound,
    RemoteTaskExpired,
    Timeout,
    Cancelled,
    Transport,
    StorageFailure,
    Internal,
}

impl CoreErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::Configuration => "configuration",
            Self::Upload => "upload",
            Self::NoSubject => "no_subject",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::RemoteRejected => "remote_rejected",
            Self::RemoteTaskNotFound => "remote_task_not_found",
            Self::RemoteTaskExpired => "remote_task_expired",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Transport => "transport",
            Self::StorageFailure => "storage_failure",
            Self::Internal => "internal",
        }
    }

    /// Errors the caller caused; these never change a task's stage.
    pub fn is_caller_error(self) -> bool {
        matches!(
            self,
            Self::InvalidInput | Self::InvalidState | Self::NotFound | Self::Busy
        )
    }

    /// The provider no longer knows the job, so its reference cannot be polled again.
    pub fn is_dead_remote_reference(self) -> bool {
        matches!(self, Self::RemoteTaskNotFound | Self::RemoteTaskExpired)
    }
}

impl std::str::FromStr for CoreErrorKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "invalid_input" => Ok(Self::InvalidInput),
            "invalid_state" => Ok(Self::InvalidState),
            "not_found" => Ok(Self::NotFound),
            "busy" => Ok(Self::Busy),
            "configuration" => Ok(Self::Configuration),
            "upload" => Ok(Self::Upload),
            "no_subject" => Ok(Self::NoSubject),
            "rate_limited" => Ok(Self::RateLimited),
            "unauthorized" => Ok(Self::Unauthorized),
            "remote_rejected" => Ok(Self::RemoteRejected),
            "remote_task_not_found" => Ok(Self::RemoteTaskNotFound),
            "remote_task_expired" => Ok(Self::RemoteTaskExpired),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "transport" => Ok(Self::Transport),
            "storage_failure" => Ok(Self::StorageFailure),
            "internal" => Ok(Self::Internal),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub stage: Option<TaskStage>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            stage: None,
            kind,
            message: message.into(),
        }
    }

    /// Attributes the error to a task unless it already names one.
    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task.get_or_insert(task);
        self
    }

    /// Records the stage the error surfaced in unless one is already recorded.
    pub fn at_stage(mut self, stage: TaskStage) -> Self {
        self.stage.get_or_insert(stage);
        self
    }
}
