use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::assets::{AssetPreparer, is_public_url};
use crate::config::PollingConfig;
use crate::models::{
    AvatarTask, CoreError, CoreErrorKind, NewTask, NewTaskEvent, TaskEventRecord, TaskId,
    TaskPatch, TaskStage,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::failure::classify_failure;
use crate::orchestration::polling::poll_until_complete;
use crate::orchestration::recovery::{ResumePoint, plan_retry};
use crate::orchestration::runtime_queue::{CancellationToken, ProcessingOperation, ProcessingQueue};
use crate::persistence::TaskStore;
use crate::probe::{DurationProbe, NoDurationProbe};
use crate::vision::{GenerationRequest, VisionClient};

const DEFAULT_MAX_CONCURRENT_TASKS: usize = 8;
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
const INTERRUPTED_MESSAGE: &str =
    "processing was interrupted before it finished; retry to resume";

/// Drives avatar tasks through their stages. The only component that writes
/// a task's stage.
#[derive(Clone)]
pub struct TaskOrchestrator {
    store: Arc<dyn TaskStore>,
    vision: Arc<dyn VisionClient>,
    assets: Arc<AssetPreparer>,
    probe: Arc<dyn DurationProbe>,
    polling: PollingConfig,
    queue: ProcessingQueue,
    owner_id: Arc<str>,
    lease_ttl: Duration,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        vision: Arc<dyn VisionClient>,
        assets: AssetPreparer,
    ) -> Self {
        Self {
            store,
            vision,
            assets: Arc::new(assets),
            probe: Arc::new(NoDurationProbe),
            polling: PollingConfig::default(),
            queue: ProcessingQueue::new(DEFAULT_MAX_CONCURRENT_TASKS),
            owner_id: instance_owner_id().into(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn DurationProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.queue = ProcessingQueue::new(max_concurrent_tasks);
        self
    }

    /// How long a lease taken by this orchestrator survives without a
    /// refresh. Running routines refresh it before every poll and stage write.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Identifies this orchestrator (and its clones) as a lease holder.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Persists the task in `UPLOADING_ASSETS` and starts processing in the
    /// background. Returns as soon as the record exists.
    pub async fn create_task(&self, request: NewTask) -> OrchestrationResult<AvatarTask> {
        request.validate()?;

        let mut request = request;
        if request.duration_seconds.is_none() {
            let audio_source = if is_public_url(&request.audio_url) {
                request.audio_url.clone()
            } else {
                self.assets
                    .resolve_local_path(&request.audio_url)
                    .to_string_lossy()
                    .into_owned()
            };
            request.duration_seconds = self.probe.probe_duration(&audio_source).await;
            if request.duration_seconds.is_none() {
                tracing::warn!(
                    owner_id = %request.owner_id,
                    audio_url = %request.audio_url,
                    "audio duration unavailable; continuing without it"
                );
            }
        }

        let store = self.store.clone();
        let task = blocking(move || store.create_task(&request)).await?;
        self.record_event(NewTaskEvent::info(task.id, task.stage, "task created"))
            .await;

        if !self.acquire_lease(task.id).await? {
            return Err(busy_error(task.id));
        }
        if let Err(error) = self.launch(task.id, ResumePoint::PrepareAssets).await {
            self.persist_failure(task.id, &error).await;
            return Err(error);
        }

        tracing::info!(task_id = task.id.0, owner_id = %task.owner_id, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> OrchestrationResult<AvatarTask> {
        let store = self.store.clone();
        blocking(move || store.get_task(id)).await
    }

    pub async fn list_tasks_for_owner(&self, owner_id: &str) -> OrchestrationResult<Vec<AvatarTask>> {
        let store = self.store.clone();
        let owner_id = owner_id.to_string();
        blocking(move || store.list_tasks_by_owner(&owner_id)).await
    }

    pub async fn task_events(&self, id: TaskId) -> OrchestrationResult<Vec<TaskEventRecord>> {
        self.get_task(id).await?;
        let store = self.store.clone();
        blocking(move || store.list_events(id)).await
    }

    /// Records the owner's mask choice and resumes at generation submit.
    /// Wrong stage or an out-of-range index is a caller error and leaves the
    /// task untouched.
    pub async fn select_subject_and_continue(
        &self,
        id: TaskId,
        mask_index: usize,
    ) -> OrchestrationResult<AvatarTask> {
        validate_selection(&self.get_task(id).await?, mask_index)?;

        if !self.acquire_lease(id).await? {
            return Err(busy_error(id));
        }
        let task = match self.get_task(id).await {
            Ok(task) => task,
            Err(error) => {
                self.release_lease(id).await;
                return Err(error);
            }
        };
        if let Err(error) = validate_selection(&task, mask_index) {
            self.release_lease(id).await;
            return Err(error);
        }

        let updated = match self
            .write(id, TaskPatch::default().selected_mask(Some(mask_index)))
            .await
        {
            Ok(updated) => updated,
            Err(error) => {
                self.release_lease(id).await;
                return Err(error);
            }
        };
        self.record_event(NewTaskEvent::info(
            id,
            updated.stage,
            format!("subject {mask_index} selected"),
        ))
        .await;

        if let Err(error) = self.launch(id, ResumePoint::SubmitGeneration).await {
            self.persist_failure(id, &error).await;
            return Err(error);
        }
        Ok(updated)
    }

    /// Resumes a failed task from the deepest checkpoint its persisted
    /// references allow.
    pub async fn retry_task(&self, id: TaskId) -> OrchestrationResult<AvatarTask> {
        plan_retry(&self.get_task(id).await?)?;

        if !self.acquire_lease(id).await? {
            return Err(busy_error(id));
        }
        let planned = match self.get_task(id).await {
            Ok(task) => plan_retry(&task),
            Err(error) => Err(error),
        };
        let point = match planned {
            Ok(point) => point,
            Err(error) => {
                self.release_lease(id).await;
                return Err(error);
            }
        };

        let updated = match self.write(id, point.retry_patch()).await {
            Ok(updated) => updated,
            Err(error) => {
                self.release_lease(id).await;
                return Err(error);
            }
        };
        self.record_event(NewTaskEvent::info(
            id,
            updated.stage,
            format!("retry requested; resuming at {}", updated.stage),
        ))
        .await;
        tracing::info!(
            task_id = id.0,
            resume = ?point,
            stage = updated.stage.as_str(),
            "retrying task"
        );

        if let Err(error) = self.launch(id, point).await {
            self.persist_failure(id, &error).await;
            return Err(error);
        }
        Ok(updated)
    }

    /// Removes the task at any stage. An in-flight routine is cancelled and
    /// its later writes are dropped.
    pub async fn delete_task(&self, id: TaskId) -> OrchestrationResult<()> {
        if self.queue.cancel(id).await {
            tracing::info!(task_id = id.0, "cancelled processing for deleted task");
        }
        let store = self.store.clone();
        blocking(move || store.delete_task(id)).await?;
        tracing::info!(task_id = id.0, "task deleted");
        Ok(())
    }

    /// Signals the task's routine. Returns `false` when nothing was running.
    pub async fn cancel_task(&self, id: TaskId) -> OrchestrationResult<bool> {
        self.get_task(id).await?;
        Ok(self.queue.cancel(id).await)
    }

    pub async fn wait_for_idle(
        &self,
        id: TaskId,
        timeout_duration: Option<Duration>,
    ) -> OrchestrationResult<()> {
        self.queue.wait_for_idle(id, timeout_duration).await
    }

    pub async fn shutdown(&self, grace_period: Duration) -> OrchestrationResult<()> {
        self.queue.shutdown(grace_period).await
    }

    /// Sweeps leases whose holder stopped refreshing them, such as those of a
    /// process that exited mid-flight. Live leases held by other processes
    /// are left alone. Each expired lease is taken over before the task is
    /// touched; parked and terminal tasks only lose the lease, anything else
    /// is failed so it can be retried. Returns the ids that were failed.
    pub async fn recover_interrupted(&self) -> OrchestrationResult<Vec<TaskId>> {
        let store = self.store.clone();
        let expired = blocking(move || store.list_expired_processing()).await?;

        let mut interrupted = Vec::new();
        for task in expired {
            if self.queue.is_active(task.id).await {
                continue;
            }
            match self.acquire_lease(task.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) if error.kind == CoreErrorKind::NotFound => continue,
                Err(error) => return Err(error),
            }

            let task = match self.get_task(task.id).await {
                Ok(task) => task,
                Err(error) if error.kind == CoreErrorKind::NotFound => continue,
                Err(error) => {
                    self.release_lease(task.id).await;
                    return Err(error);
                }
            };
            if !task.stage.is_terminal() && task.stage != TaskStage::AwaitingSubjectSelection {
                let error = CoreError::new(CoreErrorKind::Cancelled, INTERRUPTED_MESSAGE)
                    .for_task(task.id)
                    .at_stage(task.stage);
                self.persist_failure(task.id, &error).await;
                interrupted.push(task.id);
            }
            self.release_lease(task.id).await;
        }

        if !interrupted.is_empty() {
            tracing::warn!(
                count = interrupted.len(),
                owner = %self.owner_id,
                "failed tasks whose processing lease had expired"
            );
        }
        Ok(interrupted)
    }

    async fn launch(&self, id: TaskId, start: ResumePoint) -> OrchestrationResult<()> {
        let orchestrator = self.clone();
        let operation: ProcessingOperation = Box::new(move |token| {
            Box::pin(async move {
                orchestrator.run_routine(id, start, token).await;
                Ok(())
            }) as Pin<Box<dyn Future<Output = OrchestrationResult<()>> + Send>>
        });

        if let Err(error) = self.queue.spawn(id, operation).await {
            tracing::error!(
                task_id = id.0,
                kind = ?error.kind,
                message = %error.message,
                "failed to start processing routine"
            );
            self.release_lease(id).await;
            return Err(error);
        }
        Ok(())
    }

    async fn run_routine(&self, id: TaskId, start: ResumePoint, token: CancellationToken) {
        let driver = self.clone();
        let outcome = match tokio::spawn(async move { driver.drive(id, start, &token).await }).await
        {
            Ok(outcome) => outcome,
            Err(join_error) => Err(CoreError::new(
                CoreErrorKind::Internal,
                format!("processing routine stopped unexpectedly: {join_error}"),
            )),
        };

        if let Err(error) = outcome {
            // Busy from a routine means the lease moved to another holder,
            // which now owns the task record.
            if error.kind == CoreErrorKind::Busy {
                tracing::warn!(
                    task_id = id.0,
                    owner = %self.owner_id,
                    message = %error.message,
                    "stopping routine that lost its processing lease"
                );
                return;
            }
            if self.keep_lease(id).await.is_err() {
                tracing::warn!(
                    task_id = id.0,
                    kind = ?error.kind,
                    "processing lease no longer held; failure not recorded"
                );
                return;
            }
            self.persist_failure(id, &error).await;
        }
        self.release_lease(id).await;
    }

    async fn drive(
        &self,
        id: TaskId,
        start: ResumePoint,
        token: &CancellationToken,
    ) -> OrchestrationResult<()> {
        let mut next = Some(start);
        while let Some(point) = next {
            token.check()?;
            self.keep_lease(id).await?;
            next = match point {
                ResumePoint::PrepareAssets => self.prepare_assets(id, token).await?,
                ResumePoint::PollRecognition => self.poll_recognition(id, token).await?,
                ResumePoint::Branch => self.branch(id).await?,
                ResumePoint::SubmitGeneration => self.submit_generation(id).await?,
                ResumePoint::PollGeneration => self.poll_generation(id, token).await?,
            };
        }
        Ok(())
    }

    async fn prepare_assets(
        &self,
        id: TaskId,
        token: &CancellationToken,
    ) -> OrchestrationResult<Option<ResumePoint>> {
        let task = self.get_task(id).await?;
        let stage = task.stage;

        let assets = self.assets.clone();
        let (image_ref, audio_ref) = (task.image_url.clone(), task.audio_url.clone());
        let linked_record_id = task.linked_record_id.clone();
        let prepared = blocking(move || {
            assets.prepare(id, &image_ref, &audio_ref, linked_record_id.as_deref())
        })
        .await
        .map_err(|error| error.at_stage(stage))?;

        if prepared.image_url != task.image_url || prepared.audio_url != task.audio_url {
            self.keep_lease(id).await?;
            self.write(
                id,
                TaskPatch::default().assets(&prepared.image_url, &prepared.audio_url),
            )
            .await?;
        }
        token.check()?;

        let vision = self.vision.clone();
        let image_url = prepared.image_url.clone();
        let job_id = blocking(move || vision.submit_recognition(&image_url))
            .await
            .map_err(|error| error.at_stage(stage))?;

        self.transition(
            &task,
            TaskStage::RecognitionSubmitted,
            TaskPatch::default().recognition_ref(&job_id),
            format!("recognition submitted as job '{job_id}'"),
        )
        .await?;
        Ok(Some(ResumePoint::PollRecognition))
    }

    async fn poll_recognition(
        &self,
        id: TaskId,
        token: &CancellationToken,
    ) -> OrchestrationResult<Option<ResumePoint>> {
        let task = self.get_task(id).await?;
        let job_id = task.recognition_task_ref.clone().ok_or_else(|| {
            missing_reference(id, task.stage, "recognition")
        })?;
        let task = self
            .transition(
                &task,
                TaskStage::RecognitionProcessing,
                TaskPatch::default(),
                format!("polling recognition job '{job_id}'"),
            )
            .await?;

        let outcome = poll_until_complete(
            "recognition",
            &job_id,
            self.polling.recognition,
            token,
            || {
                let vision = self.vision.clone();
                let job_id = job_id.clone();
                async move {
                    self.keep_lease(id).await?;
                    blocking(move || vision.query_recognition(&job_id)).await
                }
            },
        )
        .await
        .map_err(|error| error.at_stage(TaskStage::RecognitionProcessing))?;

        if !outcome.subject_found {
            return Err(CoreError::new(
                CoreErrorKind::NoSubject,
                format!("recognition job '{job_id}' reported no subject"),
            )
            .at_stage(TaskStage::RecognitionProcessing));
        }

        self.transition(
            &task,
            TaskStage::RecognitionCompleted,
            TaskPatch::default(),
            "recognition found a subject",
        )
        .await?;
        Ok(Some(ResumePoint::Branch))
    }

    async fn branch(&self, id: TaskId) -> OrchestrationResult<Option<ResumePoint>> {
        let task = self.get_task(id).await?;
        if !task.multi_subject {
            return Ok(Some(ResumePoint::SubmitGeneration));
        }

        let masks = match task.mask_candidates.clone().filter(|masks| !masks.is_empty()) {
            Some(masks) => masks,
            None => {
                let vision = self.vision.clone();
                let image_url = task.image_url.clone();
                let detection = blocking(move || vision.detect_subjects(&image_url))
                    .await
                    .map_err(|error| error.at_stage(task.stage))?;
                if detection.mask_urls.is_empty() {
                    return Err(CoreError::new(
                        CoreErrorKind::NoSubject,
                        "subject detection returned no selectable subjects",
                    )
                    .at_stage(task.stage));
                }
                detection.mask_urls
            }
        };

        let count = masks.len();
        self.transition(
            &task,
            TaskStage::AwaitingSubjectSelection,
            TaskPatch::default()
                .mask_candidates(Some(masks))
                .selected_mask(None),
            format!("awaiting selection among {count} subjects"),
        )
        .await?;
        Ok(None)
    }

    async fn submit_generation(&self, id: TaskId) -> OrchestrationResult<Option<ResumePoint>> {
        let task = self.get_task(id).await?;

        let mask_url = if task.multi_subject {
            let mask = task.selected_mask().ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidState,
                    "multi-subject generation needs a selected subject",
                )
                .for_task(id)
                .at_stage(task.stage)
            })?;
            Some(mask.to_string())
        } else {
            None
        };

        let request = GenerationRequest {
            image_url: task.image_url.clone(),
            audio_url: task.audio_url.clone(),
            mask_url,
            prompt: task.prompt.clone(),
            seed: task.seed,
            fast_mode: task.fast_mode,
        };
        let vision = self.vision.clone();
        let job_id = blocking(move || vision.submit_generation(&request))
            .await
            .map_err(|error| error.at_stage(task.stage))?;

        let task = self
            .transition(
                &task,
                TaskStage::GenerationSubmitted,
                TaskPatch::default().generation_ref(Some(job_id.clone())),
                format!("generation submitted as job '{job_id}'"),
            )
            .await?;
        self.transition(
            &task,
            TaskStage::GenerationProcessing,
            TaskPatch::default(),
            format!("polling generation job '{job_id}'"),
        )
        .await?;
        Ok(Some(ResumePoint::PollGeneration))
    }

    async fn poll_generation(
        &self,
        id: TaskId,
        token: &CancellationToken,
    ) -> OrchestrationResult<Option<ResumePoint>> {
        let task = self.get_task(id).await?;
        let job_id = task.generation_task_ref.clone().ok_or_else(|| {
            missing_reference(id, task.stage, "generation")
        })?;
        let task = if task.stage == TaskStage::GenerationProcessing {
            task
        } else {
            self.transition(
                &task,
                TaskStage::GenerationProcessing,
                TaskPatch::default(),
                format!("polling generation job '{job_id}'"),
            )
            .await?
        };

        let result = poll_until_complete(
            "generation",
            &job_id,
            self.polling.generation,
            token,
            || {
                let vision = self.vision.clone();
                let job_id = job_id.clone();
                async move {
                    self.keep_lease(id).await?;
                    blocking(move || vision.query_generation(&job_id)).await
                }
            },
        )
        .await
        .map_err(|error| error.at_stage(TaskStage::GenerationProcessing))?;

        self.transition(
            &task,
            TaskStage::GenerationCompleted,
            TaskPatch::default().result(&result.video_url, result.tagged),
            "generation completed",
        )
        .await?;
        tracing::info!(task_id = id.0, video_url = %result.video_url, "task completed");
        Ok(None)
    }

    /// Writes `next` together with the stage-specific fields in `patch`.
    /// Off-graph moves are logged but still written.
    async fn transition(
        &self,
        task: &AvatarTask,
        next: TaskStage,
        patch: TaskPatch,
        message: impl Into<String>,
    ) -> OrchestrationResult<AvatarTask> {
        if !task.stage.can_transition_to(next) {
            tracing::warn!(
                task_id = task.id.0,
                from = task.stage.as_str(),
                to = next.as_str(),
                "stage change is outside the stage graph"
            );
        }

        let patch = TaskPatch {
            stage: Some(next),
            ..patch
        };
        self.keep_lease(task.id).await?;
        let updated = self.write(task.id, patch).await?;
        self.record_event(NewTaskEvent::info(task.id, next, message))
            .await;
        tracing::info!(
            task_id = task.id.0,
            from = task.stage.as_str(),
            to = next.as_str(),
            "task stage changed"
        );
        Ok(updated)
    }

    async fn write(&self, id: TaskId, patch: TaskPatch) -> OrchestrationResult<AvatarTask> {
        let store = self.store.clone();
        blocking(move || store.update_task(id, &patch)).await
    }

    /// Classifies `error` and persists the terminal stage. Never fails; a task
    /// deleted mid-flight is skipped.
    async fn persist_failure(&self, id: TaskId, error: &CoreError) {
        let task = match self.get_task(id).await {
            Ok(task) => task,
            Err(lookup) if lookup.kind == CoreErrorKind::NotFound => {
                tracing::debug!(
                    task_id = id.0,
                    kind = ?error.kind,
                    "task was deleted while processing; dropping failure"
                );
                return;
            }
            Err(lookup) => {
                tracing::error!(
                    task_id = id.0,
                    kind = ?lookup.kind,
                    message = %lookup.message,
                    original = %error.message,
                    "failed to load task while recording a failure"
                );
                return;
            }
        };

        let failed_at = error.stage.unwrap_or(task.stage);
        let failure = classify_failure(error, failed_at);
        tracing::error!(
            task_id = id.0,
            stage = failed_at.as_str(),
            kind = ?error.kind,
            message = %error.message,
            "task processing failed"
        );

        if !task.stage.can_transition_to(failure.stage) {
            tracing::warn!(
                task_id = id.0,
                from = task.stage.as_str(),
                to = failure.stage.as_str(),
                "stage change is outside the stage graph"
            );
        }
        let patch = TaskPatch::stage(failure.stage).failed(failure.message.clone(), failure.record);
        match self.write(id, patch).await {
            Ok(_) => {
                self.record_event(NewTaskEvent::error(id, failure.stage, failure.message))
                    .await;
            }
            Err(write_error) if write_error.kind == CoreErrorKind::NotFound => {
                tracing::debug!(task_id = id.0, "task was deleted before its failure was written");
            }
            Err(write_error) => {
                tracing::error!(
                    task_id = id.0,
                    kind = ?write_error.kind,
                    message = %write_error.message,
                    "failed to persist task failure"
                );
            }
        }
    }

    async fn record_event(&self, event: NewTaskEvent) {
        let store = self.store.clone();
        let task_id = event.task_id;
        let level = event.level;
        if let Err(error) = blocking(move || store.append_event(&event)).await {
            if error.kind == CoreErrorKind::NotFound {
                return;
            }
            tracing::warn!(
                task_id = task_id.0,
                level = level.as_str(),
                kind = ?error.kind,
                message = %error.message,
                "failed to append task event"
            );
        }
    }

    async fn acquire_lease(&self, id: TaskId) -> OrchestrationResult<bool> {
        let store = self.store.clone();
        let owner = self.owner_id.clone();
        let ttl = self.lease_ttl;
        blocking(move || store.try_acquire_processing(id, &owner, ttl)).await
    }

    /// Extends this orchestrator's lease on `id`, failing with `Busy` once
    /// another holder has taken it over.
    async fn keep_lease(&self, id: TaskId) -> OrchestrationResult<()> {
        let store = self.store.clone();
        let owner = self.owner_id.clone();
        let ttl = self.lease_ttl;
        if blocking(move || store.refresh_processing(id, &owner, ttl)).await? {
            return Ok(());
        }
        Err(CoreError::new(
            CoreErrorKind::Busy,
            format!("task '{id}' is no longer leased to this worker"),
        )
        .for_task(id))
    }

    async fn release_lease(&self, id: TaskId) {
        let store = self.store.clone();
        let owner = self.owner_id.clone();
        if let Err(error) = blocking(move || store.release_processing(id, &owner)).await {
            tracing::warn!(
                task_id = id.0,
                kind = ?error.kind,
                message = %error.message,
                "failed to release processing lease"
            );
        }
    }
}

fn validate_selection(task: &AvatarTask, mask_index: usize) -> OrchestrationResult<()> {
    if task.stage != TaskStage::AwaitingSubjectSelection {
        return Err(CoreError::new(
            CoreErrorKind::InvalidState,
            format!(
                "task '{}' is in stage {}; subject selection is only accepted in {}",
                task.id,
                task.stage,
                TaskStage::AwaitingSubjectSelection
            ),
        )
        .for_task(task.id)
        .at_stage(task.stage));
    }

    let count = task.mask_candidates.as_ref().map_or(0, Vec::len);
    if mask_index >= count {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("mask index {mask_index} is out of range for {count} candidates"),
        )
        .for_task(task.id)
        .at_stage(task.stage));
    }
    Ok(())
}

fn busy_error(id: TaskId) -> CoreError {
    CoreError::new(
        CoreErrorKind::Busy,
        format!("task '{id}' is already being processed"),
    )
    .for_task(id)
}

fn missing_reference(id: TaskId, stage: TaskStage, phase: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::Internal,
        format!("task '{id}' has no persisted {phase} job reference"),
    )
    .for_task(id)
    .at_stage(stage)
}

/// Unique per orchestrator instance within and across processes.
fn instance_owner_id() -> String {
    static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(
        "avatar-{}-{started:x}-{}",
        std::process::id(),
        NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
    )
}

async fn blocking<T: Send + 'static>(
    operation: impl FnOnce() -> OrchestrationResult<T> + Send + 'static,
) -> OrchestrationResult<T> {
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("blocking call join failure: {join_error}"),
            )
        })?
}
