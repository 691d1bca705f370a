use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::models::{TaskId, TaskStage};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventLevel {
    Info,
    Warn,
    Error,
}

impl TaskEventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for TaskEventLevel {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskEventRecord {
    pub id: u64,
    pub task_id: TaskId,
    pub stage: TaskStage,
    pub level: TaskEventLevel,
    pub message: String,
    pub created_at: SystemTime,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NewTaskEvent {
    pub task_id: TaskId,
    pub stage: TaskStage,
    pub level: TaskEventLevel,
    pub message: String,
    pub created_at: SystemTime,
}

impl NewTaskEvent {
    pub fn info(task_id: TaskId, stage: TaskStage, message: impl Into<String>) -> Self {
        Self::with_level(task_id, stage, TaskEventLevel::Info, message)
    }

    pub fn error(task_id: TaskId, stage: TaskStage, message: impl Into<String>) -> Self {
        Self::with_level(task_id, stage, TaskEventLevel::Error, message)
    }

    pub fn with_level(
        task_id: TaskId,
        stage: TaskStage,
        level: TaskEventLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            stage,
            level,
            message: message.into(),
            created_at: SystemTime::now(),
        }
    }
}
