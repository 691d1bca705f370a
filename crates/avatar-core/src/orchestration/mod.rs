pub mod failure;
pub mod orchestrator;
pub mod polling;
pub mod recovery;
pub mod runtime_queue;

pub use failure::{ClassifiedFailure, classify_failure};
pub use orchestrator::TaskOrchestrator;
pub use polling::poll_until_complete;
pub use recovery::{ResumePoint, plan_retry};
pub use runtime_queue::{CancellationToken, ProcessingOperation, ProcessingQueue};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
