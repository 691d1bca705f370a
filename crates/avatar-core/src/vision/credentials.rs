use std::fmt::{Debug, Formatter};

use serde::Deserialize;

use crate::models::{CoreError, CoreErrorKind};
use crate::vision::VisionResult;

pub const PACKED_CREDENTIALS_VAR: &str = "AVATAR_VISION_CREDENTIALS";
pub const ACCESS_KEY_VAR: &str = "AVATAR_VISION_ACCESS_KEY";
pub const SECRET_KEY_VAR: &str = "AVATAR_VISION_SECRET_KEY";

#[derive(Clone, Eq, PartialEq, Deserialize)]
pub struct VisionCredentials {
    #[serde(alias = "accessKey", alias = "access_key_id", alias = "ak")]
    pub access_key: String,
    #[serde(alias = "secretKey", alias = "secret_access_key", alias = "sk")]
    pub secret_key: String,
}

impl VisionCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.access_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

impl Debug for VisionCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Resolution order: explicit credentials, then the packed
/// `AVATAR_VISION_CREDENTIALS` value, then the separate access/secret key
/// variables. Nothing resolvable is a configuration error.
pub fn resolve_credentials(
    explicit: Option<VisionCredentials>,
    lookup: impl Fn(&str) -> Option<String>,
) -> VisionResult<VisionCredentials> {
    if let Some(credentials) = explicit
        && credentials.is_complete()
    {
        return Ok(credentials);
    }

    if let Some(packed) = lookup(PACKED_CREDENTIALS_VAR).filter(|value| !value.trim().is_empty()) {
        return parse_packed_credentials(&packed);
    }

    let access_key = lookup(ACCESS_KEY_VAR).unwrap_or_default();
    let secret_key = lookup(SECRET_KEY_VAR).unwrap_or_default();
    let credentials = VisionCredentials::new(access_key.trim(), secret_key.trim());
    if credentials.is_complete() {
        return Ok(credentials);
    }

    Err(CoreError::new(
        CoreErrorKind::Configuration,
        format!(
            "no vision provider credentials configured; set {PACKED_CREDENTIALS_VAR} or \
             {ACCESS_KEY_VAR} and {SECRET_KEY_VAR}"
        ),
    ))
}

/// Accepts a JSON object or an `access:secret` / `access,secret` pair.
pub fn parse_packed_credentials(raw: &str) -> VisionResult<VisionCredentials> {
    let trimmed = raw.trim();

    let credentials = if trimmed.starts_with('{') {
        serde_json::from_str::<VisionCredentials>(trimmed).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Configuration,
                format!("packed vision credentials are not a valid JSON object: {error}"),
            )
        })?
    } else {
        let (access_key, secret_key) = trimmed
            .split_once(':')
            .or_else(|| trimmed.split_once(','))
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::Configuration,
                    "packed vision credentials must be JSON or an 'access:secret' pair",
                )
            })?;
        VisionCredentials::new(access_key.trim(), secret_key.trim())
    };

    if !credentials.is_complete() {
        return Err(CoreError::new(
            CoreErrorKind::Configuration,
            "packed vision credentials have an empty access or secret key",
        ));
    }
    Ok(credentials)
}
