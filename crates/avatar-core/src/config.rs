use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

pub const ENV_PREFIX: &str = "AVATAR_";

/// Runtime settings. Every field has a default, so an empty JSON object is a
/// valid configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub database_path: PathBuf,
    pub max_concurrent_tasks: usize,
    /// How long a processing lease stays valid without a refresh. Routines
    /// refresh it at every poll, so it must outlast the longest poll interval.
    pub lease_ttl_secs: u64,
    pub vision: VisionConfig,
    pub polling: PollingConfig,
    pub assets: AssetConfig,
    pub probe: ProbeConfig,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("avatar.sqlite3"),
            max_concurrent_tasks: 8,
            lease_ttl_secs: 300,
            vision: VisionConfig::default(),
            polling: PollingConfig::default(),
            assets: AssetConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub endpoint: String,
    pub region: String,
    pub service: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
    pub recognition_req_key: String,
    pub detection_req_key: String,
    pub generation_req_key: String,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://visual.volcengineapi.com".to_string(),
            region: "cn-north-1".to_string(),
            service: "cv".to_string(),
            api_version: "2022-08-31".to_string(),
            request_timeout_secs: 30,
            recognition_req_key: "realman_avatar_picture_create_role_omni".to_string(),
            detection_req_key: "realman_avatar_object_detection".to_string(),
            generation_req_key: "realman_avatar_picture_omni_v2".to_string(),
        }
    }
}

impl VisionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Fixed-interval polling with a bounded number of attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub recognition: PollPolicy,
    pub generation: PollPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            recognition: PollPolicy::new(5_000, 60),
            generation: PollPolicy::new(20_000, 100),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Base directory for relative local references.
    pub local_root: PathBuf,
    pub publish_dir: Option<PathBuf>,
    pub public_base_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub program: String,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            program: "ffprobe".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AvatarConfig {
    /// Reads the optional JSON file, then overlays the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let raw = fs::read_to_string(path).map_err(|error| {
            config_error(format!(
                "failed to read config file '{}': {error}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|error| config_error(format!("malformed config file: {error}")))
    }

    /// Overlays `AVATAR_*` variables onto the current values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), CoreError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = var("DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = var("MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = parse_number("MAX_CONCURRENT_TASKS", &value)?;
        }
        if let Some(value) = var("LEASE_TTL_SECS") {
            self.lease_ttl_secs = parse_number("LEASE_TTL_SECS", &value)?;
        }

        if let Some(value) = var("VISION_ENDPOINT") {
            self.vision.endpoint = value;
        }
        if let Some(value) = var("VISION_REGION") {
            self.vision.region = value;
        }
        if let Some(value) = var("VISION_SERVICE") {
            self.vision.service = value;
        }
        if let Some(value) = var("VISION_API_VERSION") {
            self.vision.api_version = value;
        }
        if let Some(value) = var("VISION_REQUEST_TIMEOUT_SECS") {
            self.vision.request_timeout_secs = parse_number("VISION_REQUEST_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = var("RECOGNITION_POLL_INTERVAL_MS") {
            self.polling.recognition.interval_ms =
                parse_number("RECOGNITION_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("RECOGNITION_POLL_ATTEMPTS") {
            self.polling.recognition.max_attempts =
                parse_number("RECOGNITION_POLL_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("GENERATION_POLL_INTERVAL_MS") {
            self.polling.generation.interval_ms =
                parse_number("GENERATION_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("GENERATION_POLL_ATTEMPTS") {
            self.polling.generation.max_attempts =
                parse_number("GENERATION_POLL_ATTEMPTS", &value)?;
        }

        if let Some(value) = var("ASSET_LOCAL_ROOT") {
            self.assets.local_root = PathBuf::from(value);
        }
        if let Some(value) = var("PUBLISH_DIR") {
            self.assets.publish_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = var("PUBLIC_BASE_URL") {
            self.assets.public_base_url = Some(value);
        }

        if let Some(value) = var("FFPROBE") {
            self.probe.program = value;
        }
        if let Some(value) = var("FFPROBE_TIMEOUT_MS") {
            self.probe.timeout_ms = parse_number("FFPROBE_TIMEOUT_MS", &value)?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_tasks == 0 {
            return Err(config_error("max_concurrent_tasks must be at least 1"));
        }
        for (name, policy) in [
            ("recognition", self.polling.recognition),
            ("generation", self.polling.generation),
        ] {
            if policy.max_attempts == 0 {
                return Err(config_error(format!(
                    "{name} polling needs at least one attempt"
                )));
            }
            if policy.interval() >= self.lease_ttl() {
                return Err(config_error(format!(
                    "lease_ttl_secs must exceed the {name} poll interval"
                )));
            }
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, CoreError> {
    value.parse::<T>().map_err(|_| {
        config_error(format!(
            "environment variable {ENV_PREFIX}{name} must be a non-negative integer, got '{value}'"
        ))
    })
}

fn config_error(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::Configuration, message)
}
