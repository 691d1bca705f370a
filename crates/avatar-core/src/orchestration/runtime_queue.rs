use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;

use crate::models::{CoreError, CoreErrorKind, TaskId};
use crate::orchestration::OrchestrationResult;

pub type ProcessingOperation = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = OrchestrationResult<()>> + Send>>
        + Send,
>;

/// Cooperative cancellation shared between a routine and its owner.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    flag: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn check(&self) -> OrchestrationResult<()> {
        if self.is_cancelled() {
            return Err(cancelled_error());
        }
        Ok(())
    }

    /// Waits for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> OrchestrationResult<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.check(),
            _ = self.cancelled() => Err(cancelled_error()),
        }
    }
}

pub(crate) fn cancelled_error() -> CoreError {
    CoreError::new(CoreErrorKind::Cancelled, "processing was cancelled")
}

/// Runs at most one routine per task, with a global bound on how many run at
/// once. Routines waiting for a permit are still cancellable.
#[derive(Clone)]
pub struct ProcessingQueue {
    inner: Arc<Mutex<QueueState>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

#[derive(Default)]
struct QueueState {
    next_generation: u64,
    closed: bool,
    routines: HashMap<TaskId, RoutineHandle>,
}

struct RoutineHandle {
    generation: u64,
    token: CancellationToken,
    finished: Arc<Notify>,
}

impl ProcessingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(QueueState::default())),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not held by a running routine.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn spawn(
        &self,
        task_id: TaskId,
        operation: ProcessingOperation,
    ) -> OrchestrationResult<()> {
        let (generation, token, finished) = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(CoreError::new(
                    CoreErrorKind::Internal,
                    "processing queue is shut down",
                )
                .for_task(task_id));
            }
            if state.routines.contains_key(&task_id) {
                return Err(CoreError::new(
                    CoreErrorKind::Busy,
                    format!("task '{task_id}' already has an active processing routine"),
                )
                .for_task(task_id));
            }

            state.next_generation = state.next_generation.saturating_add(1);
            let generation = state.next_generation;
            let token = CancellationToken::new();
            let finished = Arc::new(Notify::new());
            state.routines.insert(
                task_id,
                RoutineHandle {
                    generation,
                    token: token.clone(),
                    finished: finished.clone(),
                },
            );
            (generation, token, finished)
        };

        let inner = self.inner.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // A routine cancelled while queued still runs so it can record the
            // cancellation and release its lease.
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };

            if let Err(error) = operation(token).await {
                tracing::error!(
                    task_id = task_id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "processing routine returned an error"
                );
            }

            finalize(&inner, task_id, generation, &finished).await;
        });

        Ok(())
    }

    pub async fn is_active(&self, task_id: TaskId) -> bool {
        self.inner.lock().await.routines.contains_key(&task_id)
    }

    pub async fn active_tasks(&self) -> Vec<TaskId> {
        let state = self.inner.lock().await;
        let mut tasks: Vec<TaskId> = state.routines.keys().copied().collect();
        tasks.sort();
        tasks
    }

    /// Signals the task's routine. Returns `false` when none is active.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let state = self.inner.lock().await;
        match state.routines.get(&task_id) {
            Some(routine) => {
                routine.token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let state = self.inner.lock().await;
        for routine in state.routines.values() {
            routine.token.cancel();
        }
        state.routines.len()
    }

    pub async fn wait_for_idle(
        &self,
        task_id: TaskId,
        timeout_duration: Option<Duration>,
    ) -> OrchestrationResult<()> {
        let deadline = timeout_duration.map(|duration| Instant::now() + duration);
        loop {
            let state = self.inner.lock().await;
            let Some(routine) = state.routines.get(&task_id) else {
                return Ok(());
            };
            let finished = routine.finished.clone();
            let notified = finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);

            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, notified)
                        .await
                        .map_err(|_| {
                            CoreError::new(
                                CoreErrorKind::Timeout,
                                format!("timed out waiting for task '{task_id}' to become idle"),
                            )
                            .for_task(task_id)
                        })?;
                }
                None => notified.await,
            }
        }
    }

    /// Rejects new routines, cancels running ones, and waits for them to drain.
    pub async fn shutdown(&self, grace_period: Duration) -> OrchestrationResult<()> {
        let active = {
            let mut state = self.inner.lock().await;
            state.closed = true;
            for routine in state.routines.values() {
                routine.token.cancel();
            }
            state.routines.keys().copied().collect::<Vec<_>>()
        };

        let deadline = Instant::now() + grace_period;
        for task_id in active {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.wait_for_idle(task_id, Some(remaining)).await?;
        }
        Ok(())
    }
}

async fn finalize(
    inner: &Arc<Mutex<QueueState>>,
    task_id: TaskId,
    generation: u64,
    finished: &Arc<Notify>,
) {
    {
        let mut state = inner.lock().await;
        if state
            .routines
            .get(&task_id)
            .is_some_and(|routine| routine.generation == generation)
        {
            state.routines.remove(&task_id);
        }
    }
    finished.notify_waiters();
}
