use crate::models::{CoreError, CoreErrorKind, FailureRecord, TaskStage};

/// What gets persisted when processing stops on an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassifiedFailure {
    pub stage: TaskStage,
    pub message: String,
    pub record: FailureRecord,
}

/// Maps an error raised while the task was at `failed_at` to its terminal
/// stage and a message meant for the task owner.
pub fn classify_failure(error: &CoreError, failed_at: TaskStage) -> ClassifiedFailure {
    let phase = phase_name(failed_at);
    let (stage, message) = match error.kind {
        CoreErrorKind::Upload => (
            TaskStage::UploadFailed,
            format!("asset upload failed: {}", error.message),
        ),
        CoreErrorKind::NoSubject => (
            TaskStage::Failed,
            format!(
                "no subject was found in the image ({})",
                error.message
            ),
        ),
        CoreErrorKind::RateLimited => (
            TaskStage::Failed,
            format!(
                "the vision provider is rate limiting requests; retry later ({})",
                error.message
            ),
        ),
        CoreErrorKind::Unauthorized => (
            TaskStage::Failed,
            format!(
                "the vision provider rejected the configured credentials ({})",
                error.message
            ),
        ),
        CoreErrorKind::RemoteTaskNotFound => (
            TaskStage::Failed,
            format!(
                "the provider no longer knows the {phase} job; retry will resubmit it ({})",
                error.message
            ),
        ),
        CoreErrorKind::RemoteTaskExpired => (
            TaskStage::Failed,
            format!(
                "the {phase} job expired on the provider; retry will resubmit it ({})",
                error.message
            ),
        ),
        CoreErrorKind::Timeout => (
            TaskStage::Failed,
            format!("{phase} timed out: {}", error.message),
        ),
        _ => (TaskStage::Failed, error.message.clone()),
    };

    ClassifiedFailure {
        stage,
        message,
        record: FailureRecord {
            kind: error.kind,
            stage: failed_at,
        },
    }
}

fn phase_name(stage: TaskStage) -> &'static str {
    match stage {
        TaskStage::UploadingAssets | TaskStage::UploadFailed => "asset upload",
        TaskStage::RecognitionSubmitted
        | TaskStage::RecognitionProcessing
        | TaskStage::RecognitionCompleted => "recognition",
        TaskStage::AwaitingSubjectSelection => "subject selection",
        TaskStage::GenerationSubmitted
        | TaskStage::GenerationProcessing
        | TaskStage::GenerationCompleted => "generation",
        TaskStage::Failed => "processing",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_errors_end_in_upload_failed() {
        let failure = classify_failure(
            &CoreError::new(CoreErrorKind::Upload, "disk full"),
            TaskStage::UploadingAssets,
        );
        assert_eq!(failure.stage, TaskStage::UploadFailed);
        assert_eq!(failure.message, "asset upload failed: disk full");
        assert_eq!(failure.record.kind, CoreErrorKind::Upload);
    }

    #[test]
    fn timeouts_name_the_phase() {
        let failure = classify_failure(
            &CoreError::new(CoreErrorKind::Timeout, "did not finish within 60 polling attempts"),
            TaskStage::RecognitionProcessing,
        );
        assert_eq!(failure.stage, TaskStage::Failed);
        assert!(failure.message.starts_with("recognition timed out"));
        assert_eq!(failure.record.stage, TaskStage::RecognitionProcessing);
    }

    #[test]
    fn rate_limits_get_a_distinct_message() {
        let failure = classify_failure(
            &CoreError::new(CoreErrorKind::RateLimited, "HTTP 429"),
            TaskStage::GenerationSubmitted,
        );
        assert!(failure.message.contains("rate limiting"));
    }

    #[test]
    fn dead_generation_reference_is_recorded_with_its_stage() {
        let failure = classify_failure(
            &CoreError::new(CoreErrorKind::RemoteTaskNotFound, "job 'g-1' is unknown"),
            TaskStage::GenerationProcessing,
        );
        assert_eq!(
            failure.record,
            FailureRecord {
                kind: CoreErrorKind::RemoteTaskNotFound,
                stage: TaskStage::GenerationProcessing,
            }
        );
        assert!(failure.message.contains("generation job"));
    }

    #[test]
    fn unknown_errors_keep_their_message_verbatim() {
        let failure = classify_failure(
            &CoreError::new(CoreErrorKind::RemoteRejected, "code 50411: bad image"),
            TaskStage::RecognitionSubmitted,
        );
        assert_eq!(failure.message, "code 50411: bad image");
    }
}
