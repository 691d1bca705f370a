use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    UploadingAssets,
    RecognitionSubmitted,
    RecognitionProcessing,
    RecognitionCompleted,
    AwaitingSubjectSelection,
    GenerationSubmitted,
    GenerationProcessing,
    GenerationCompleted,
    UploadFailed,
    Failed,
}

impl TaskStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UploadingAssets => "UPLOADING_ASSETS",
            Self::RecognitionSubmitted => "RECOGNITION_SUBMITTED",
            Self::RecognitionProcessing => "RECOGNITION_PROCESSING",
            Self::RecognitionCompleted => "RECOGNITION_COMPLETED",
            Self::AwaitingSubjectSelection => "AWAITING_SUBJECT_SELECTION",
            Self::GenerationSubmitted => "GENERATION_SUBMITTED",
            Self::GenerationProcessing => "GENERATION_PROCESSING",
            Self::GenerationCompleted => "GENERATION_COMPLETED",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::GenerationCompleted | Self::UploadFailed | Self::Failed
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::UploadFailed | Self::Failed)
    }

    /// Stages at which the generation job reference may already be persisted.
    pub fn is_generation_stage(self) -> bool {
        matches!(
            self,
            Self::GenerationSubmitted | Self::GenerationProcessing | Self::GenerationCompleted
        )
    }

    /// Whether `next` is an edge of the stage graph. Rewriting the current
    /// stage is always allowed; failed stages may only move back to a
    /// recovery checkpoint.
    pub fn can_transition_to(self, next: TaskStage) -> bool {
        if self == next {
            return true;
        }
        if !self.is_terminal() && next.is_failed() {
            return true;
        }

        match self {
            Self::UploadingAssets => next == Self::RecognitionSubmitted,
            Self::RecognitionSubmitted => next == Self::RecognitionProcessing,
            Self::RecognitionProcessing => next == Self::RecognitionCompleted,
            Self::RecognitionCompleted => matches!(
                next,
                Self::AwaitingSubjectSelection | Self::GenerationSubmitted
            ),
            Self::AwaitingSubjectSelection => next == Self::GenerationSubmitted,
            Self::GenerationSubmitted => next == Self::GenerationProcessing,
            Self::GenerationProcessing => next == Self::GenerationCompleted,
            Self::GenerationCompleted => false,
            Self::UploadFailed | Self::Failed => matches!(
                next,
                Self::UploadingAssets
                    | Self::RecognitionProcessing
                    | Self::RecognitionCompleted
                    | Self::GenerationProcessing
            ),
        }
    }
}

impl Display for TaskStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStage {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "UPLOADING_ASSETS" => Ok(Self::UploadingAssets),
            "RECOGNITION_SUBMITTED" => Ok(Self::RecognitionSubmitted),
            "RECOGNITION_PROCESSING" => Ok(Self::RecognitionProcessing),
            "RECOGNITION_COMPLETED" => Ok(Self::RecognitionCompleted),
            "AWAITING_SUBJECT_SELECTION" => Ok(Self::AwaitingSubjectSelection),
            "GENERATION_SUBMITTED" => Ok(Self::GenerationSubmitted),
            "GENERATION_PROCESSING" => Ok(Self::GenerationProcessing),
            "GENERATION_COMPLETED" => Ok(Self::GenerationCompleted),
            "UPLOAD_FAILED" => Ok(Self::UploadFailed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// What went wrong and where, kept next to the error message so recovery can
/// tell a live provider reference from a dead one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: CoreErrorKind,
    pub stage: TaskStage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvatarTask {
    pub id: TaskId,
    pub owner_id: String,
    pub linked_record_id: Option<String>,
    pub image_url: String,
    pub audio_url: String,
    pub duration_seconds: Option<f64>,
    pub prompt: Option<String>,
    pub seed: Option<i64>,
    pub fast_mode: bool,
    pub multi_subject: bool,
    pub stage: TaskStage,
    pub recognition_task_ref: Option<String>,
    pub mask_candidates: Option<Vec<String>>,
    pub selected_mask_index: Option<usize>,
    pub generation_task_ref: Option<String>,
    pub result_video_url: Option<String>,
    pub result_tagged: Option<bool>,
    pub error_message: Option<String>,
    pub failure: Option<FailureRecord>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl AvatarTask {
    pub fn from_new(id: TaskId, new_task: &NewTask, now: SystemTime) -> Self {
        Self {
            id,
            owner_id: new_task.owner_id.clone(),
            linked_record_id: new_task.linked_record_id.clone(),
            image_url: new_task.image_url.clone(),
            audio_url: new_task.audio_url.clone(),
            duration_seconds: new_task.duration_seconds,
            prompt: new_task.prompt.clone(),
            seed: new_task.seed,
            fast_mode: new_task.fast_mode,
            multi_subject: new_task.multi_subject,
            stage: TaskStage::UploadingAssets,
            recognition_task_ref: None,
            mask_candidates: None,
            selected_mask_index: None,
            generation_task_ref: None,
            result_video_url: None,
            result_tagged: None,
            error_message: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn selected_mask(&self) -> Option<&str> {
        let index = self.selected_mask_index?;
        self.mask_candidates
            .as_ref()
            .and_then(|masks| masks.get(index))
            .map(String::as_str)
    }

    pub fn apply_patch(&mut self, patch: &TaskPatch, now: SystemTime) {
        if let Some(stage) = patch.stage {
            self.stage = stage;
        }
        if let Some(image_url) = &patch.image_url {
            self.image_url = image_url.clone();
        }
        if let Some(audio_url) = &patch.audio_url {
            self.audio_url = audio_url.clone();
        }
        if let Some(recognition_task_ref) = &patch.recognition_task_ref {
            self.recognition_task_ref = Some(recognition_task_ref.clone());
        }
        if let Some(mask_candidates) = &patch.mask_candidates {
            self.mask_candidates = mask_candidates.clone();
        }
        if let Some(selected_mask_index) = patch.selected_mask_index {
            self.selected_mask_index = selected_mask_index;
        }
        if let Some(generation_task_ref) = &patch.generation_task_ref {
            self.generation_task_ref = generation_task_ref.clone();
        }
        if let Some(result_video_url) = &patch.result_video_url {
            self.result_video_url = Some(result_video_url.clone());
        }
        if let Some(result_tagged) = patch.result_tagged {
            self.result_tagged = Some(result_tagged);
        }
        if let Some(error_message) = &patch.error_message {
            self.error_message = error_message.clone();
        }
        if let Some(failure) = patch.failure {
            self.failure = failure;
        }
        self.updated_at = now;
    }
}

/// Owner-supplied inputs for a new task. Generation parameters are fixed here
/// and never change afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub owner_id: String,
    pub linked_record_id: Option<String>,
    pub image_url: String,
    pub audio_url: String,
    pub duration_seconds: Option<f64>,
    pub prompt: Option<String>,
    pub seed: Option<i64>,
    pub fast_mode: bool,
    pub multi_subject: bool,
}

impl NewTask {
    pub fn new(
        owner_id: impl Into<String>,
        image_url: impl Into<String>,
        audio_url: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            linked_record_id: None,
            image_url: image_url.into(),
            audio_url: audio_url.into(),
            duration_seconds: None,
            prompt: None,
            seed: None,
            fast_mode: false,
            multi_subject: false,
        }
    }

    pub fn linked_record(mut self, record_id: impl Into<String>) -> Self {
        self.linked_record_id = Some(record_id.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn fast_mode(mut self, fast_mode: bool) -> Self {
        self.fast_mode = fast_mode;
        self
    }

    pub fn multi_subject(mut self, multi_subject: bool) -> Self {
        self.multi_subject = multi_subject;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let required = [
            ("owner_id", self.owner_id.as_str()),
            ("image_url", self.image_url.as_str()),
            ("audio_url", self.audio_url.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("{field} must not be empty"),
                ));
            }
            if value.contains('\0') {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("{field} must not contain NUL bytes"),
                ));
            }
        }

        if let Some(record_id) = &self.linked_record_id
            && record_id.trim().is_empty()
        {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "linked_record_id must not be blank when provided",
            ));
        }

        Ok(())
    }
}

/// A partial update. `None` leaves a field untouched; for nullable fields the
/// inner `Option` is the new value, so `Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskPatch {
    pub stage: Option<TaskStage>,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    pub recognition_task_ref: Option<String>,
    pub mask_candidates: Option<Option<Vec<String>>>,
    pub selected_mask_index: Option<Option<usize>>,
    pub generation_task_ref: Option<Option<String>>,
    pub result_video_url: Option<String>,
    pub result_tagged: Option<bool>,
    pub error_message: Option<Option<String>>,
    pub failure: Option<Option<FailureRecord>>,
}

impl TaskPatch {
    pub fn stage(stage: TaskStage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    pub fn assets(mut self, image_url: impl Into<String>, audio_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self.audio_url = Some(audio_url.into());
        self
    }

    pub fn recognition_ref(mut self, job_ref: impl Into<String>) -> Self {
        self.recognition_task_ref = Some(job_ref.into());
        self
    }

    pub fn mask_candidates(mut self, masks: Option<Vec<String>>) -> Self {
        self.mask_candidates = Some(masks);
        self
    }

    pub fn selected_mask(mut self, index: Option<usize>) -> Self {
        self.selected_mask_index = Some(index);
        self
    }

    pub fn generation_ref(mut self, job_ref: Option<String>) -> Self {
        self.generation_task_ref = Some(job_ref);
        self
    }

    pub fn result(mut self, video_url: impl Into<String>, tagged: bool) -> Self {
        self.result_video_url = Some(video_url.into());
        self.result_tagged = Some(tagged);
        self
    }

    pub fn failed(mut self, message: impl Into<String>, failure: FailureRecord) -> Self {
        self.error_message = Some(Some(message.into()));
        self.failure = Some(Some(failure));
        self
    }

    pub fn clear_failure(mut self) -> Self {
        self.error_message = Some(None);
        self.failure = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn task() -> AvatarTask {
        let new_task = NewTask::new("owner-1", "https://cdn/a.png", "local/a.wav").multi_subject(true);
        AvatarTask::from_new(TaskId(1), &new_task, UNIX_EPOCH + Duration::from_secs(10))
    }

    #[test]
    fn stage_names_parse_back() {
        for stage in [
            TaskStage::UploadingAssets,
            TaskStage::AwaitingSubjectSelection,
            TaskStage::GenerationCompleted,
            TaskStage::UploadFailed,
        ] {
            assert_eq!(stage.as_str().parse::<TaskStage>(), Ok(stage));
        }
        assert!("DONE".parse::<TaskStage>().is_err());
    }

    #[test]
    fn failure_is_reachable_from_every_non_terminal_stage() {
        for stage in [
            TaskStage::UploadingAssets,
            TaskStage::RecognitionSubmitted,
            TaskStage::RecognitionProcessing,
            TaskStage::RecognitionCompleted,
            TaskStage::AwaitingSubjectSelection,
            TaskStage::GenerationSubmitted,
            TaskStage::GenerationProcessing,
        ] {
            assert!(stage.can_transition_to(TaskStage::Failed));
            assert!(stage.can_transition_to(TaskStage::UploadFailed));
        }
        assert!(!TaskStage::GenerationCompleted.can_transition_to(TaskStage::Failed));
    }

    #[test]
    fn branch_edges_follow_the_stage_graph() {
        assert!(TaskStage::RecognitionCompleted.can_transition_to(TaskStage::GenerationSubmitted));
        assert!(
            TaskStage::RecognitionCompleted.can_transition_to(TaskStage::AwaitingSubjectSelection)
        );
        assert!(!TaskStage::RecognitionProcessing.can_transition_to(TaskStage::GenerationSubmitted));
        assert!(!TaskStage::UploadingAssets.can_transition_to(TaskStage::GenerationCompleted));
        assert!(TaskStage::Failed.can_transition_to(TaskStage::GenerationProcessing));
        assert!(!TaskStage::Failed.can_transition_to(TaskStage::GenerationCompleted));
    }

    #[test]
    fn patch_sets_and_clears_nullable_fields() {
        let mut task = task();
        let later = UNIX_EPOCH + Duration::from_secs(20);

        task.apply_patch(
            &TaskPatch::stage(TaskStage::AwaitingSubjectSelection)
                .mask_candidates(Some(vec!["m0".into(), "m1".into()]))
                .selected_mask(Some(1)),
            later,
        );
        assert_eq!(task.stage, TaskStage::AwaitingSubjectSelection);
        assert_eq!(task.selected_mask(), Some("m1"));
        assert_eq!(task.updated_at, later);

        task.apply_patch(
            &TaskPatch::default().failed(
                "boom",
                FailureRecord {
                    kind: CoreErrorKind::Timeout,
                    stage: TaskStage::GenerationProcessing,
                },
            ),
            later,
        );
        assert_eq!(task.error_message.as_deref(), Some("boom"));

        task.apply_patch(&TaskPatch::default().clear_failure(), later);
        assert_eq!(task.error_message, None);
        assert_eq!(task.failure, None);
        assert_eq!(task.mask_candidates.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn validation_rejects_blank_inputs() {
        let error = NewTask::new("owner", " ", "a.wav").validate().unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert!(error.message.contains("image_url"));

        assert!(NewTask::new("owner", "a.png", "a.wav").validate().is_ok());
    }
}
