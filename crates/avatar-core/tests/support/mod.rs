#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use avatar_core::assets::{AssetKind, AssetPreparer, AssetUploader};
use avatar_core::config::{PollPolicy, PollingConfig};
use avatar_core::models::{AvatarTask, CoreError, CoreErrorKind, TaskId, TaskStage};
use avatar_core::orchestration::TaskOrchestrator;
use avatar_core::persistence::{LinkedRecordStore, TaskStore};
use avatar_core::probe::{DurationProbe, ProbeFuture};
use avatar_core::vision::{
    GenerationRequest, GenerationResult, RecognitionOutcome, RemoteJobStatus, SubjectDetection,
    VisionClient, VisionResult,
};

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fast_polling() -> PollingConfig {
    PollingConfig {
        recognition: PollPolicy::new(1, 5),
        generation: PollPolicy::new(1, 5),
    }
}

/// Polling slow enough that a test can act while a routine waits.
pub fn patient_polling() -> PollingConfig {
    PollingConfig {
        recognition: PollPolicy::new(20, 1_000),
        generation: PollPolicy::new(20, 1_000),
    }
}

pub fn temp_db_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("avatar-{name}-{nanos}.sqlite3"))
}

/// Vision provider double. Scripted statuses are consumed in order; once a
/// script runs dry the fallback answers every query.
pub struct ScriptedVision {
    state: Mutex<VisionState>,
}

struct VisionState {
    calls: Vec<String>,
    recognition_submits: u32,
    generation_submits: u32,
    recognition: VecDeque<RemoteJobStatus<RecognitionOutcome>>,
    recognition_fallback: RemoteJobStatus<RecognitionOutcome>,
    masks: Vec<String>,
    generation: VecDeque<RemoteJobStatus<GenerationResult>>,
    generation_fallback: Option<RemoteJobStatus<GenerationResult>>,
    generation_requests: Vec<GenerationRequest>,
}

impl ScriptedVision {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VisionState {
                calls: Vec::new(),
                recognition_submits: 0,
                generation_submits: 0,
                recognition: VecDeque::new(),
                recognition_fallback: RemoteJobStatus::Completed(RecognitionOutcome {
                    subject_found: true,
                }),
                masks: Vec::new(),
                generation: VecDeque::new(),
                generation_fallback: None,
                generation_requests: Vec::new(),
            }),
        }
    }

    pub fn script_recognition(&self, steps: Vec<RemoteJobStatus<RecognitionOutcome>>) {
        self.state.lock().unwrap().recognition = steps.into();
    }

    pub fn recognition_always(&self, status: RemoteJobStatus<RecognitionOutcome>) {
        self.state.lock().unwrap().recognition_fallback = status;
    }

    pub fn detect_masks(&self, masks: &[&str]) {
        self.state.lock().unwrap().masks = masks.iter().map(|mask| mask.to_string()).collect();
    }

    pub fn script_generation(&self, steps: Vec<RemoteJobStatus<GenerationResult>>) {
        self.state.lock().unwrap().generation = steps.into();
    }

    /// `None` restores the default: a finished video named after the job.
    pub fn generation_always(&self, status: Option<RemoteJobStatus<GenerationResult>>) {
        self.state.lock().unwrap().generation_fallback = status;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn recognition_submits(&self) -> u32 {
        self.state.lock().unwrap().recognition_submits
    }

    pub fn generation_submits(&self) -> u32 {
        self.state.lock().unwrap().generation_submits
    }

    pub fn generation_requests(&self) -> Vec<GenerationRequest> {
        self.state.lock().unwrap().generation_requests.clone()
    }
}

impl VisionClient for ScriptedVision {
    fn submit_recognition(&self, image_url: &str) -> VisionResult<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("submit_recognition:{image_url}"));
        state.recognition_submits += 1;
        Ok(format!("rec-{}", state.recognition_submits))
    }

    fn query_recognition(
        &self,
        job_id: &str,
    ) -> VisionResult<RemoteJobStatus<RecognitionOutcome>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("query_recognition:{job_id}"));
        let fallback = state.recognition_fallback.clone();
        Ok(state.recognition.pop_front().unwrap_or(fallback))
    }

    fn detect_subjects(&self, image_url: &str) -> VisionResult<SubjectDetection> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("detect_subjects:{image_url}"));
        Ok(SubjectDetection {
            subject_found: !state.masks.is_empty(),
            mask_urls: state.masks.clone(),
        })
    }

    fn submit_generation(&self, request: &GenerationRequest) -> VisionResult<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!(
            "submit_generation:{}",
            request.mask_url.as_deref().unwrap_or("-")
        ));
        state.generation_submits += 1;
        state.generation_requests.push(request.clone());
        Ok(format!("gen-{}", state.generation_submits))
    }

    fn query_generation(&self, job_id: &str) -> VisionResult<RemoteJobStatus<GenerationResult>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("query_generation:{job_id}"));
        if let Some(next) = state.generation.pop_front() {
            return Ok(next);
        }
        Ok(state.generation_fallback.clone().unwrap_or_else(|| {
            RemoteJobStatus::Completed(GenerationResult {
                video_url: format!("https://videos.example.com/{job_id}.mp4"),
                tagged: true,
            })
        }))
    }
}

#[derive(Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<(PathBuf, AssetKind)>>,
    failing: AtomicBool,
}

impl RecordingUploader {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<(PathBuf, AssetKind)> {
        self.uploads.lock().unwrap().clone()
    }
}

impl AssetUploader for RecordingUploader {
    fn upload(
        &self,
        local_path: &Path,
        task_id: TaskId,
        kind: AssetKind,
    ) -> Result<String, CoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::new(
                CoreErrorKind::Upload,
                format!("storage bucket rejected '{}'", local_path.display()),
            ));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((local_path.to_path_buf(), kind));
        Ok(format!(
            "https://uploads.example.com/{task_id}/{}",
            kind.as_str()
        ))
    }
}

/// Reports a fixed duration and remembers which audio sources were measured.
#[derive(Default)]
pub struct FixedProbe {
    seconds: Option<f64>,
    measured: Mutex<Vec<String>>,
}

impl FixedProbe {
    pub fn new(seconds: Option<f64>) -> Self {
        Self {
            seconds,
            measured: Mutex::new(Vec::new()),
        }
    }

    pub fn measured(&self) -> Vec<String> {
        self.measured.lock().unwrap().clone()
    }
}

impl DurationProbe for FixedProbe {
    fn probe_duration(&self, audio_url: &str) -> ProbeFuture {
        self.measured.lock().unwrap().push(audio_url.to_string());
        let seconds = self.seconds;
        Box::pin(async move { seconds })
    }
}

pub struct Harness<S> {
    pub orchestrator: TaskOrchestrator,
    pub store: Arc<S>,
    pub vision: Arc<ScriptedVision>,
    pub uploader: Arc<RecordingUploader>,
    pub probe: Arc<FixedProbe>,
}

pub fn harness_with<S>(store: Arc<S>, polling: PollingConfig) -> Harness<S>
where
    S: TaskStore + LinkedRecordStore + 'static,
{
    let vision = Arc::new(ScriptedVision::new());
    let uploader = Arc::new(RecordingUploader::default());
    let probe = Arc::new(FixedProbe::new(Some(3.5)));
    let orchestrator = build_orchestrator(&store, &vision, &uploader, &probe, polling);

    Harness {
        orchestrator,
        store,
        vision,
        uploader,
        probe,
    }
}

fn build_orchestrator<S>(
    store: &Arc<S>,
    vision: &Arc<ScriptedVision>,
    uploader: &Arc<RecordingUploader>,
    probe: &Arc<FixedProbe>,
    polling: PollingConfig,
) -> TaskOrchestrator
where
    S: TaskStore + LinkedRecordStore + 'static,
{
    let assets = AssetPreparer::new(uploader.clone(), "/srv/avatar/media")
        .with_linked_records(store.clone());
    TaskOrchestrator::new(store.clone(), vision.clone(), assets)
        .with_probe(probe.clone())
        .with_polling(polling)
        .with_max_concurrent_tasks(4)
}

impl<S> Harness<S>
where
    S: TaskStore + LinkedRecordStore + 'static,
{
    /// Another orchestrator over the same store and fakes, standing in for a
    /// second process.
    pub fn peer_orchestrator(&self, polling: PollingConfig) -> TaskOrchestrator {
        build_orchestrator(&self.store, &self.vision, &self.uploader, &self.probe, polling)
    }
}

impl<S> Harness<S> {
    pub async fn settle(&self, id: TaskId) -> AvatarTask {
        self.orchestrator
            .wait_for_idle(id, Some(SETTLE_TIMEOUT))
            .await
            .expect("task routine should settle");
        self.orchestrator
            .get_task(id)
            .await
            .expect("settled task should exist")
    }

    pub async fn wait_for_stage(&self, id: TaskId, stage: TaskStage) -> AvatarTask {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            let task = self.orchestrator.get_task(id).await.expect("task should exist");
            if task.stage == stage {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} never reached {stage}; last stage {}",
                task.stage
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
