pub mod credentials;
pub mod http;
pub mod signing;

pub use credentials::{VisionCredentials, parse_packed_credentials, resolve_credentials};
pub use http::HttpVisionClient;
pub use signing::{SignableRequest, SignedHeaders, SigningScope, sign_request};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::VisionConfig;
use crate::models::CoreError;

pub type VisionResult<T> = Result<T, CoreError>;

/// State of an asynchronous provider job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RemoteJobStatus<T> {
    Pending,
    Completed(T),
    NotFound,
    Expired,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecognitionOutcome {
    pub subject_found: bool,
}

/// An empty mask list means there is nothing to choose from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubjectDetection {
    pub subject_found: bool,
    pub mask_urls: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub image_url: String,
    pub audio_url: String,
    pub mask_url: Option<String>,
    pub prompt: Option<String>,
    pub seed: Option<i64>,
    pub fast_mode: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub video_url: String,
    pub tagged: bool,
}

/// Stateless adapter over the vision provider. Calls block; the orchestrator
/// runs them on the blocking pool.
pub trait VisionClient: Send + Sync {
    /// Returns the provider's job id.
    fn submit_recognition(&self, image_url: &str) -> VisionResult<String>;

    fn query_recognition(&self, job_id: &str)
    -> VisionResult<RemoteJobStatus<RecognitionOutcome>>;

    fn detect_subjects(&self, image_url: &str) -> VisionResult<SubjectDetection>;

    /// Returns the provider's job id.
    fn submit_generation(&self, request: &GenerationRequest) -> VisionResult<String>;

    fn query_generation(&self, job_id: &str) -> VisionResult<RemoteJobStatus<GenerationResult>>;
}

/// Builds the HTTP client once at startup. Missing credentials fail here, not
/// on the first request.
pub fn build_client(
    config: &VisionConfig,
    explicit: Option<VisionCredentials>,
    lookup: impl Fn(&str) -> Option<String>,
) -> VisionResult<Arc<dyn VisionClient>> {
    let credentials = resolve_credentials(explicit, lookup)?;
    let client = HttpVisionClient::new(config, credentials)?;
    Ok(Arc::new(client))
}
