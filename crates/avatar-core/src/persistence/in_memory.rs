use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::models::{
    AvatarTask, CoreError, CoreErrorKind, NewTask, NewTaskEvent, TaskEventRecord, TaskId,
    TaskPatch,
};
use crate::persistence::{LinkedRecordStore, PersistenceResult, TaskStore, task_not_found};

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    next_task_id: u64,
    next_event_id: u64,
    tasks: HashMap<TaskId, AvatarTask>,
    processing: HashMap<TaskId, Lease>,
    events: Vec<TaskEventRecord>,
    linked_audio: HashMap<String, String>,
}

struct Lease {
    owner: String,
    expires_at: SystemTime,
}

impl Lease {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(
                CoreErrorKind::Internal,
                "in-memory task store mutex poisoned",
            )
        })
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create_task(&self, task: &NewTask) -> PersistenceResult<AvatarTask> {
        let mut state = self.lock_state()?;
        state.next_task_id = state.next_task_id.saturating_add(1);
        let id = TaskId(state.next_task_id);

        let record = AvatarTask::from_new(id, task, SystemTime::now());
        state.tasks.insert(id, record.clone());
        Ok(record)
    }

    fn get_task(&self, id: TaskId) -> PersistenceResult<AvatarTask> {
        let state = self.lock_state()?;
        state.tasks.get(&id).cloned().ok_or_else(|| task_not_found(id))
    }

    fn update_task(&self, id: TaskId, patch: &TaskPatch) -> PersistenceResult<AvatarTask> {
        let mut state = self.lock_state()?;
        let task = state.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.apply_patch(patch, SystemTime::now());
        Ok(task.clone())
    }

    fn list_tasks_by_owner(&self, owner_id: &str) -> PersistenceResult<Vec<AvatarTask>> {
        let state = self.lock_state()?;
        let mut tasks: Vec<AvatarTask> = state
            .tasks
            .values()
            .filter(|task| task.owner_id == owner_id)
            .cloned()
            .collect();
        tasks.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then(right.id.cmp(&left.id))
        });
        Ok(tasks)
    }

    fn delete_task(&self, id: TaskId) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if state.tasks.remove(&id).is_none() {
            return Err(task_not_found(id));
        }
        state.processing.remove(&id);
        state.events.retain(|event| event.task_id != id);
        Ok(())
    }

    fn try_acquire_processing(
        &self,
        id: TaskId,
        owner: &str,
        ttl: Duration,
    ) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        if !state.tasks.contains_key(&id) {
            return Err(task_not_found(id));
        }
        let now = SystemTime::now();
        if state
            .processing
            .get(&id)
            .is_some_and(|lease| !lease.is_expired(now))
        {
            return Ok(false);
        }
        state.processing.insert(
            id,
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn refresh_processing(&self, id: TaskId, owner: &str, ttl: Duration) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        match state.processing.get_mut(&id) {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = SystemTime::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_processing(&self, id: TaskId, owner: &str) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if state
            .processing
            .get(&id)
            .is_some_and(|lease| lease.owner == owner)
        {
            state.processing.remove(&id);
        }
        Ok(())
    }

    fn list_processing(&self) -> PersistenceResult<Vec<AvatarTask>> {
        let state = self.lock_state()?;
        Ok(leased_tasks(&state, |_| true))
    }

    fn list_expired_processing(&self) -> PersistenceResult<Vec<AvatarTask>> {
        let state = self.lock_state()?;
        let now = SystemTime::now();
        Ok(leased_tasks(&state, |lease| lease.is_expired(now)))
    }

    fn append_event(&self, event: &NewTaskEvent) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if !state.tasks.contains_key(&event.task_id) {
            return Err(task_not_found(event.task_id));
        }
        state.next_event_id = state.next_event_id.saturating_add(1);
        let id = state.next_event_id;
        state.events.push(TaskEventRecord {
            id,
            task_id: event.task_id,
            stage: event.stage,
            level: event.level,
            message: event.message.clone(),
            created_at: event.created_at,
        });
        Ok(())
    }

    fn list_events(&self, id: TaskId) -> PersistenceResult<Vec<TaskEventRecord>> {
        let state = self.lock_state()?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.task_id == id)
            .cloned()
            .collect())
    }
}

impl LinkedRecordStore for InMemoryTaskStore {
    fn update_linked_audio(&self, record_id: &str, audio_url: &str) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state
            .linked_audio
            .insert(record_id.to_string(), audio_url.to_string());
        Ok(())
    }

    fn linked_audio(&self, record_id: &str) -> PersistenceResult<Option<String>> {
        let state = self.lock_state()?;
        Ok(state.linked_audio.get(record_id).cloned())
    }
}

fn leased_tasks(state: &StoreState, include: impl Fn(&Lease) -> bool) -> Vec<AvatarTask> {
    let mut tasks: Vec<AvatarTask> = state
        .processing
        .iter()
        .filter(|(_, lease)| include(lease))
        .filter_map(|(id, _)| state.tasks.get(id).cloned())
        .collect();
    tasks.sort_by_key(|task| task.id);
    tasks
}
