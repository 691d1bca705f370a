use serde::Deserialize;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;

use crate::config::VisionConfig;
use crate::models::{CoreError, CoreErrorKind};
use crate::vision::credentials::VisionCredentials;
use crate::vision::signing::{SignableRequest, SigningScope, canonical_query, sign_request};
use crate::vision::{
    GenerationRequest, GenerationResult, RecognitionOutcome, RemoteJobStatus, SubjectDetection,
    VisionClient, VisionResult,
};

const CONTENT_TYPE: &str = "application/json";
const SUCCESS_CODE: i64 = 10000;
const THROTTLED_CODES: [i64; 2] = [50429, 50430];

const ACTION_SUBMIT: &str = "CVSubmitTask";
const ACTION_QUERY: &str = "CVGetResult";
const ACTION_PROCESS: &str = "CVProcess";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<EnvelopeData>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeData {
    task_id: Option<String>,
    status: Option<String>,
    resp_data: Option<String>,
    video_url: Option<String>,
    aigc_meta_tagged: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RecognitionPayload {
    status: i64,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionPayload {
    #[serde(default)]
    status: i64,
    object_detection_result: Option<DetectionResult>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionResult {
    mask: Option<DetectionMask>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionMask {
    #[serde(default)]
    url: Vec<String>,
}

/// Signed JSON-over-HTTP client for the vision provider.
pub struct HttpVisionClient {
    agent: ureq::Agent,
    endpoint: String,
    host: String,
    region: String,
    service: String,
    api_version: String,
    recognition_req_key: String,
    detection_req_key: String,
    generation_req_key: String,
    credentials: VisionCredentials,
}

impl HttpVisionClient {
    pub fn new(config: &VisionConfig, credentials: VisionCredentials) -> VisionResult<Self> {
        let (endpoint, host) = parse_endpoint(&config.endpoint)?;
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout())
            .build();

        Ok(Self {
            agent,
            endpoint,
            host,
            region: config.region.clone(),
            service: config.service.clone(),
            api_version: config.api_version.clone(),
            recognition_req_key: config.recognition_req_key.clone(),
            detection_req_key: config.detection_req_key.clone(),
            generation_req_key: config.generation_req_key.clone(),
            credentials,
        })
    }

    fn call(&self, action: &str, payload: &Value) -> VisionResult<EnvelopeData> {
        let body = serde_json::to_vec(payload).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to encode {action} request: {error}"),
            )
        })?;
        let query = [("Action", action), ("Version", self.api_version.as_str())];
        let signed = sign_request(
            &SignableRequest {
                method: "POST",
                host: &self.host,
                path: "/",
                query: &query,
                content_type: CONTENT_TYPE,
                body: &body,
            },
            &self.credentials,
            &SigningScope {
                region: &self.region,
                service: &self.service,
            },
            OffsetDateTime::now_utc(),
        )?;

        let url = format!("{}/?{}", self.endpoint, canonical_query(&query));
        let mut request = self.agent.post(&url).set("Content-Type", CONTENT_TYPE);
        for (name, value) in signed.as_pairs() {
            request = request.set(name, value);
        }

        match request.send_bytes(&body) {
            Ok(response) => {
                let text = response.into_string().map_err(|error| {
                    CoreError::new(
                        CoreErrorKind::Transport,
                        format!("failed to read {action} response: {error}"),
                    )
                })?;
                decode_envelope(action, &text)
            }
            Err(ureq::Error::Status(status, response)) => {
                let text = response.into_string().unwrap_or_default();
                Err(http_status_error(action, status, &text))
            }
            Err(ureq::Error::Transport(transport)) => Err(CoreError::new(
                CoreErrorKind::Transport,
                format!("{action} request failed: {transport}"),
            )),
        }
    }

    fn submit(&self, payload: Value) -> VisionResult<String> {
        let data = self.call(ACTION_SUBMIT, &payload)?;
        data.task_id
            .filter(|task_id| !task_id.trim().is_empty())
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::RemoteRejected,
                    "provider accepted the job but returned no task id",
                )
            })
    }

    fn query(&self, req_key: &str, job_id: &str) -> VisionResult<RemoteJobStatus<EnvelopeData>> {
        let data = self.call(
            ACTION_QUERY,
            &json!({ "req_key": req_key, "task_id": job_id }),
        )?;
        job_status(data)
    }
}

impl VisionClient for HttpVisionClient {
    fn submit_recognition(&self, image_url: &str) -> VisionResult<String> {
        self.submit(json!({
            "req_key": self.recognition_req_key,
            "image_url": image_url,
        }))
    }

    fn query_recognition(
        &self,
        job_id: &str,
    ) -> VisionResult<RemoteJobStatus<RecognitionOutcome>> {
        Ok(match self.query(&self.recognition_req_key, job_id)? {
            RemoteJobStatus::Completed(data) => {
                RemoteJobStatus::Completed(recognition_outcome(&data)?)
            }
            RemoteJobStatus::Pending => RemoteJobStatus::Pending,
            RemoteJobStatus::NotFound => RemoteJobStatus::NotFound,
            RemoteJobStatus::Expired => RemoteJobStatus::Expired,
        })
    }

    fn detect_subjects(&self, image_url: &str) -> VisionResult<SubjectDetection> {
        let data = self.call(
            ACTION_PROCESS,
            &json!({
                "req_key": self.detection_req_key,
                "image_url": image_url,
            }),
        )?;
        subject_detection(&data)
    }

    fn submit_generation(&self, request: &GenerationRequest) -> VisionResult<String> {
        self.submit(generation_payload(&self.generation_req_key, request))
    }

    fn query_generation(&self, job_id: &str) -> VisionResult<RemoteJobStatus<GenerationResult>> {
        Ok(match self.query(&self.generation_req_key, job_id)? {
            RemoteJobStatus::Completed(data) => {
                RemoteJobStatus::Completed(generation_result(data)?)
            }
            RemoteJobStatus::Pending => RemoteJobStatus::Pending,
            RemoteJobStatus::NotFound => RemoteJobStatus::NotFound,
            RemoteJobStatus::Expired => RemoteJobStatus::Expired,
        })
    }
}

/// Splits `https://host[:port][/...]` into a normalized base URL and the
/// signed `host` value.
fn parse_endpoint(raw: &str) -> VisionResult<(String, String)> {
    let endpoint = raw.trim().trim_end_matches('/');
    let authority = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::Configuration,
                format!("vision endpoint '{raw}' must start with http:// or https://"),
            )
        })?;
    let host = authority.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(CoreError::new(
            CoreErrorKind::Configuration,
            format!("vision endpoint '{raw}' has no host"),
        ));
    }
    Ok((endpoint.to_string(), host.to_string()))
}

fn decode_envelope(action: &str, text: &str) -> VisionResult<EnvelopeData> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|error| {
        CoreError::new(
            CoreErrorKind::RemoteRejected,
            format!("malformed {action} response: {error}"),
        )
    })?;

    if envelope.code == SUCCESS_CODE {
        return Ok(envelope.data.unwrap_or_default());
    }
    if THROTTLED_CODES.contains(&envelope.code) {
        return Err(CoreError::new(
            CoreErrorKind::RateLimited,
            format!("{action} was throttled by the provider: {}", envelope.message),
        ));
    }
    Err(CoreError::new(
        CoreErrorKind::RemoteRejected,
        format!(
            "{action} was rejected with code {}: {}",
            envelope.code, envelope.message
        ),
    ))
}

fn http_status_error(action: &str, status: u16, body: &str) -> CoreError {
    match status {
        429 => CoreError::new(
            CoreErrorKind::RateLimited,
            format!("{action} was throttled by the provider (HTTP 429)"),
        ),
        401 | 403 => CoreError::new(
            CoreErrorKind::Unauthorized,
            format!("{action} was not authorized (HTTP {status})"),
        ),
        _ => {
            let detail = serde_json::from_str::<Envelope>(body)
                .ok()
                .map(|envelope| envelope.message)
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| body.chars().take(200).collect());
            CoreError::new(
                CoreErrorKind::RemoteRejected,
                format!("{action} failed with HTTP {status}: {detail}"),
            )
        }
    }
}

fn job_status(data: EnvelopeData) -> VisionResult<RemoteJobStatus<EnvelopeData>> {
    match data.status.as_deref() {
        Some("in_queue" | "generating" | "processing") => Ok(RemoteJobStatus::Pending),
        Some("done") => Ok(RemoteJobStatus::Completed(data)),
        Some("not_found") => Ok(RemoteJobStatus::NotFound),
        Some("expired") => Ok(RemoteJobStatus::Expired),
        other => Err(CoreError::new(
            CoreErrorKind::RemoteRejected,
            format!("provider reported unexpected job status {other:?}"),
        )),
    }
}

fn recognition_outcome(data: &EnvelopeData) -> VisionResult<RecognitionOutcome> {
    let raw = data.resp_data.as_deref().ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::RemoteRejected,
            "recognition finished without a result payload",
        )
    })?;
    let payload: RecognitionPayload = serde_json::from_str(raw).map_err(|error| {
        CoreError::new(
            CoreErrorKind::RemoteRejected,
            format!("malformed recognition result: {error}"),
        )
    })?;
    Ok(RecognitionOutcome {
        subject_found: payload.status == 1,
    })
}

fn subject_detection(data: &EnvelopeData) -> VisionResult<SubjectDetection> {
    let payload = match data.resp_data.as_deref() {
        Some(raw) => serde_json::from_str::<DetectionPayload>(raw).map_err(|error| {
            CoreError::new(
                CoreErrorKind::RemoteRejected,
                format!("malformed subject detection result: {error}"),
            )
        })?,
        None => DetectionPayload::default(),
    };
    let mask_urls = payload
        .object_detection_result
        .and_then(|result| result.mask)
        .map(|mask| mask.url)
        .unwrap_or_default();
    Ok(SubjectDetection {
        subject_found: payload.status == 1,
        mask_urls,
    })
}

fn generation_result(data: EnvelopeData) -> VisionResult<GenerationResult> {
    let video_url = data
        .video_url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::RemoteRejected,
                "generation finished without a video url",
            )
        })?;
    Ok(GenerationResult {
        video_url,
        tagged: data.aigc_meta_tagged.unwrap_or(false),
    })
}

fn generation_payload(req_key: &str, request: &GenerationRequest) -> Value {
    let mut payload = Map::new();
    payload.insert("req_key".into(), json!(req_key));
    payload.insert("image_url".into(), json!(request.image_url));
    payload.insert("audio_url".into(), json!(request.audio_url));
    if let Some(mask_url) = &request.mask_url {
        payload.insert("mask_url".into(), json!([mask_url]));
    }
    if let Some(prompt) = &request.prompt {
        payload.insert("prompt".into(), json!(prompt));
    }
    if let Some(seed) = request.seed {
        payload.insert("seed".into(), json!(seed));
    }
    if request.fast_mode {
        payload.insert("fast_mode".into(), json!(true));
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_yields_base_and_signed_host() {
        assert_eq!(
            parse_endpoint("https://visual.example.com/").unwrap(),
            (
                "https://visual.example.com".to_string(),
                "visual.example.com".to_string()
            )
        );
        assert_eq!(
            parse_endpoint("http://127.0.0.1:8080").unwrap().1,
            "127.0.0.1:8080"
        );
        assert_eq!(
            parse_endpoint("visual.example.com").unwrap_err().kind,
            CoreErrorKind::Configuration
        );
    }

    #[test]
    fn envelope_codes_map_to_error_kinds() {
        let data = decode_envelope(
            ACTION_SUBMIT,
            r#"{"code": 10000, "message": "Success", "data": {"task_id": "job-1"}}"#,
        )
        .unwrap();
        assert_eq!(data.task_id.as_deref(), Some("job-1"));

        let throttled =
            decode_envelope(ACTION_SUBMIT, r#"{"code": 50429, "message": "qps"}"#).unwrap_err();
        assert_eq!(throttled.kind, CoreErrorKind::RateLimited);

        let rejected =
            decode_envelope(ACTION_SUBMIT, r#"{"code": 50411, "message": "bad image"}"#)
                .unwrap_err();
        assert_eq!(rejected.kind, CoreErrorKind::RemoteRejected);
        assert!(rejected.message.contains("bad image"));
    }

    #[test]
    fn http_statuses_map_to_error_kinds() {
        assert_eq!(
            http_status_error(ACTION_QUERY, 429, "").kind,
            CoreErrorKind::RateLimited
        );
        assert_eq!(
            http_status_error(ACTION_QUERY, 401, "").kind,
            CoreErrorKind::Unauthorized
        );
        assert_eq!(
            http_status_error(ACTION_QUERY, 403, "").kind,
            CoreErrorKind::Unauthorized
        );
        let server = http_status_error(ACTION_QUERY, 500, r#"{"code": 1, "message": "boom"}"#);
        assert_eq!(server.kind, CoreErrorKind::RemoteRejected);
        assert!(server.message.contains("boom"));
    }

    #[test]
    fn job_statuses_are_classified() {
        let status = |raw: &str| EnvelopeData {
            status: Some(raw.to_string()),
            ..EnvelopeData::default()
        };
        assert!(matches!(
            job_status(status("in_queue")),
            Ok(RemoteJobStatus::Pending)
        ));
        assert!(matches!(
            job_status(status("generating")),
            Ok(RemoteJobStatus::Pending)
        ));
        assert!(matches!(
            job_status(status("done")),
            Ok(RemoteJobStatus::Completed(_))
        ));
        assert!(matches!(
            job_status(status("not_found")),
            Ok(RemoteJobStatus::NotFound)
        ));
        assert!(matches!(
            job_status(status("expired")),
            Ok(RemoteJobStatus::Expired)
        ));
        assert!(job_status(EnvelopeData::default()).is_err());
    }

    #[test]
    fn detection_payload_lists_mask_urls() {
        let data = EnvelopeData {
            resp_data: Some(
                r#"{"status": 1, "object_detection_result": {"mask": {"url": ["m0", "m1"]}}}"#
                    .to_string(),
            ),
            ..EnvelopeData::default()
        };
        let detection = subject_detection(&data).unwrap();
        assert!(detection.subject_found);
        assert_eq!(detection.mask_urls, vec!["m0", "m1"]);

        let empty = subject_detection(&EnvelopeData::default()).unwrap();
        assert!(!empty.subject_found);
        assert!(empty.mask_urls.is_empty());
    }

    #[test]
    fn recognition_status_one_means_subject_found() {
        let data = |raw: &str| EnvelopeData {
            resp_data: Some(raw.to_string()),
            ..EnvelopeData::default()
        };
        assert!(recognition_outcome(&data(r#"{"status": 1}"#)).unwrap().subject_found);
        assert!(!recognition_outcome(&data(r#"{"status": 0}"#)).unwrap().subject_found);
        assert!(recognition_outcome(&EnvelopeData::default()).is_err());
    }

    #[test]
    fn generation_payload_omits_unset_options() {
        let payload = generation_payload(
            "gen",
            &GenerationRequest {
                image_url: "https://cdn/i.png".into(),
                audio_url: "https://cdn/a.wav".into(),
                mask_url: Some("https://cdn/m1.png".into()),
                prompt: None,
                seed: Some(7),
                fast_mode: false,
            },
        );
        assert_eq!(payload["mask_url"], json!(["https://cdn/m1.png"]));
        assert_eq!(payload["seed"], json!(7));
        assert!(payload.get("prompt").is_none());
        assert!(payload.get("fast_mode").is_none());
    }
}
