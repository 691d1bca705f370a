pub mod error;
pub mod task;
pub mod task_event;

pub use error::{CoreError, CoreErrorKind};
pub use task::{AvatarTask, FailureRecord, NewTask, TaskId, TaskPatch, TaskStage};
pub use task_event::{NewTaskEvent, TaskEventLevel, TaskEventRecord};
