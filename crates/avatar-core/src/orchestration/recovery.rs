use crate::models::{AvatarTask, CoreError, CoreErrorKind, TaskPatch, TaskStage};
use crate::orchestration::OrchestrationResult;

/// Where a processing routine starts or continues.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResumePoint {
    /// Upload inputs and submit recognition.
    PrepareAssets,
    PollRecognition,
    /// Pick the single- or multi-subject path after recognition.
    Branch,
    SubmitGeneration,
    PollGeneration,
}

impl ResumePoint {
    /// The stage persisted when a retry restarts here.
    pub fn resume_stage(self) -> TaskStage {
        match self {
            Self::PrepareAssets => TaskStage::UploadingAssets,
            Self::PollRecognition => TaskStage::RecognitionProcessing,
            Self::Branch | Self::SubmitGeneration => TaskStage::RecognitionCompleted,
            Self::PollGeneration => TaskStage::GenerationProcessing,
        }
    }

    /// Stage plus the fields a restart at this point must reset.
    pub fn retry_patch(self) -> TaskPatch {
        let patch = TaskPatch::stage(self.resume_stage()).clear_failure();
        match self {
            Self::PrepareAssets => patch
                .mask_candidates(None)
                .selected_mask(None)
                .generation_ref(None),
            Self::PollRecognition | Self::Branch | Self::SubmitGeneration => {
                patch.generation_ref(None)
            }
            Self::PollGeneration => patch,
        }
    }
}

/// Picks the deepest checkpoint a failed task can resume from. A provider
/// reference that the provider reported dead is resubmitted, never polled.
pub fn plan_retry(task: &AvatarTask) -> OrchestrationResult<ResumePoint> {
    if !task.stage.is_failed() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidState,
            format!(
                "task '{}' is in stage {} and can only be retried after a failure",
                task.id, task.stage
            ),
        )
        .for_task(task.id)
        .at_stage(task.stage));
    }

    let dead_at = task
        .failure
        .filter(|failure| failure.kind.is_dead_remote_reference())
        .map(|failure| failure.stage);

    if task.generation_task_ref.is_some() {
        if dead_at.is_some_and(TaskStage::is_generation_stage) {
            return Ok(ResumePoint::SubmitGeneration);
        }
        return Ok(ResumePoint::PollGeneration);
    }

    if task.recognition_task_ref.is_some() {
        let recognition_dead = dead_at.is_some_and(|stage| {
            matches!(
                stage,
                TaskStage::RecognitionSubmitted | TaskStage::RecognitionProcessing
            )
        });
        if recognition_dead {
            return Ok(ResumePoint::PrepareAssets);
        }
        return Ok(ResumePoint::PollRecognition);
    }

    Ok(ResumePoint::PrepareAssets)
}
