pub mod in_memory;

pub use in_memory::InMemoryTaskStore;

use std::time::Duration;

use crate::models::{
    AvatarTask, CoreError, CoreErrorKind, NewTask, NewTaskEvent, TaskEventRecord, TaskId,
    TaskPatch,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable task records. Implementations are blocking; async callers go
/// through `spawn_blocking`.
pub trait TaskStore: Send + Sync {
    fn create_task(&self, task: &NewTask) -> PersistenceResult<AvatarTask>;

    /// Fails with [`CoreErrorKind::NotFound`] for unknown ids.
    fn get_task(&self, id: TaskId) -> PersistenceResult<AvatarTask>;

    fn update_task(&self, id: TaskId, patch: &TaskPatch) -> PersistenceResult<AvatarTask>;

    /// Newest first.
    fn list_tasks_by_owner(&self, owner_id: &str) -> PersistenceResult<Vec<AvatarTask>>;

    fn delete_task(&self, id: TaskId) -> PersistenceResult<()>;

    /// Atomically takes the processing lease for `owner` until `ttl` from
    /// now. Succeeds when the task is unleased or the previous lease has
    /// expired; returns `false` while another holder's lease is live.
    fn try_acquire_processing(
        &self,
        id: TaskId,
        owner: &str,
        ttl: Duration,
    ) -> PersistenceResult<bool>;

    /// Extends `owner`'s lease. Returns `false` once the lease belongs to
    /// someone else, was released, or the task is gone.
    fn refresh_processing(&self, id: TaskId, owner: &str, ttl: Duration) -> PersistenceResult<bool>;

    /// Drops the lease if `owner` still holds it.
    fn release_processing(&self, id: TaskId, owner: &str) -> PersistenceResult<()>;

    /// Tasks holding a lease, live or not.
    fn list_processing(&self) -> PersistenceResult<Vec<AvatarTask>>;

    /// Tasks whose lease ran out without being released.
    fn list_expired_processing(&self) -> PersistenceResult<Vec<AvatarTask>>;

    fn append_event(&self, event: &NewTaskEvent) -> PersistenceResult<()>;

    /// Oldest first.
    fn list_events(&self, id: TaskId) -> PersistenceResult<Vec<TaskEventRecord>>;
}

/// External records (for example storyboard shots) that mirror a task's audio input.
pub trait LinkedRecordStore: Send + Sync {
    fn update_linked_audio(&self, record_id: &str, audio_url: &str) -> PersistenceResult<()>;

    fn linked_audio(&self, record_id: &str) -> PersistenceResult<Option<String>>;
}

pub(crate) fn task_not_found(id: TaskId) -> CoreError {
    CoreError::new(CoreErrorKind::NotFound, format!("unknown task id '{id}'")).for_task(id)
}
