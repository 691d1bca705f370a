use std::future::Future;

use crate::config::PollPolicy;
use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::runtime_queue::CancellationToken;
use crate::vision::RemoteJobStatus;

/// Waits one interval before every query. Pending results consume an
/// attempt; dead references and exhausted attempts are errors.
pub async fn poll_until_complete<T, F, Fut>(
    phase: &str,
    job_id: &str,
    policy: PollPolicy,
    token: &CancellationToken,
    mut query: F,
) -> OrchestrationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestrationResult<RemoteJobStatus<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        token.sleep(policy.interval()).await?;

        match query().await? {
            RemoteJobStatus::Pending => {
                tracing::debug!(phase, job_id, attempt, "remote job still pending");
            }
            RemoteJobStatus::Completed(result) => return Ok(result),
            RemoteJobStatus::NotFound => {
                return Err(CoreError::new(
                    CoreErrorKind::RemoteTaskNotFound,
                    format!("{phase} job '{job_id}' is unknown to the provider"),
                ));
            }
            RemoteJobStatus::Expired => {
                return Err(CoreError::new(
                    CoreErrorKind::RemoteTaskExpired,
                    format!("{phase} job '{job_id}' expired before it finished"),
                ));
            }
        }
    }

    Err(CoreError::new(
        CoreErrorKind::Timeout,
        format!(
            "{phase} job '{job_id}' did not finish within {} polling attempts",
            policy.max_attempts
        ),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn fast(max_attempts: u32) -> PollPolicy {
        PollPolicy::new(1, max_attempts)
    }

    #[tokio::test]
    async fn returns_result_after_pending_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let counter = calls.clone();

        let result = poll_until_complete("generation", "job-1", fast(5), &token, || {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if attempt < 3 {
                    RemoteJobStatus::Pending
                } else {
                    RemoteJobStatus::Completed("video")
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "video");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_is_a_timeout() {
        let token = CancellationToken::new();
        let error = poll_until_complete::<(), _, _>("recognition", "job-2", fast(4), &token, || async {
            Ok(RemoteJobStatus::Pending)
        })
        .await
        .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::Timeout);
        assert!(error.message.contains("4 polling attempts"));
    }

    #[tokio::test]
    async fn dead_references_map_to_distinct_kinds() {
        let token = CancellationToken::new();
        let missing = poll_until_complete::<(), _, _>("generation", "job-3", fast(4), &token, || async {
            Ok(RemoteJobStatus::NotFound)
        })
        .await
        .unwrap_err();
        let expired = poll_until_complete::<(), _, _>("generation", "job-3", fast(4), &token, || async {
            Ok(RemoteJobStatus::Expired)
        })
        .await
        .unwrap_err();

        assert_eq!(missing.kind, CoreErrorKind::RemoteTaskNotFound);
        assert_eq!(expired.kind, CoreErrorKind::RemoteTaskExpired);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let error = poll_until_complete::<(), _, _>(
            "generation",
            "job-4",
            PollPolicy::new(60_000, 100),
            &token,
            || async { Ok(RemoteJobStatus::Pending) },
        )
        .await
        .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::Cancelled);
    }
}
