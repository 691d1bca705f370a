use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::utf8_percent_encode;
use sha2::{Digest, Sha256};

use crate::assets::{AssetKind, AssetUploader};
use crate::config::AssetConfig;
use crate::models::{CoreError, CoreErrorKind, TaskId};
use crate::vision::signing::URI_COMPONENT;

/// Copies assets into a directory that a web server exposes under
/// `public_base_url`. File names are content-addressed per task, so repeated
/// uploads of the same file are idempotent.
pub struct PublishDirectoryUploader {
    publish_dir: PathBuf,
    public_base_url: String,
}

impl PublishDirectoryUploader {
    pub fn new(publish_dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            publish_dir: publish_dir.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn publish_dir(&self) -> &Path {
        &self.publish_dir
    }
}

impl AssetUploader for PublishDirectoryUploader {
    fn upload(
        &self,
        local_path: &Path,
        task_id: TaskId,
        kind: AssetKind,
    ) -> Result<String, CoreError> {
        let contents = fs::read(local_path).map_err(|error| {
            upload_error(format!(
                "failed to read {} '{}': {error}",
                kind.as_str(),
                local_path.display()
            ))
        })?;

        let digest = hex::encode(Sha256::digest(&contents));
        let extension = local_path
            .extension()
            .and_then(|extension| extension.to_str())
            .filter(|extension| !extension.is_empty())
            .map(|extension| format!(".{}", extension.to_ascii_lowercase()))
            .unwrap_or_default();
        let file_name = format!("task-{task_id}-{}-{}{extension}", kind.as_str(), &digest[..16]);

        fs::create_dir_all(&self.publish_dir).map_err(|error| {
            upload_error(format!(
                "failed to create publish directory '{}': {error}",
                self.publish_dir.display()
            ))
        })?;
        let target = self.publish_dir.join(&file_name);
        fs::write(&target, &contents).map_err(|error| {
            upload_error(format!(
                "failed to write '{}': {error}",
                target.display()
            ))
        })?;

        Ok(format!(
            "{}/{}",
            self.public_base_url,
            utf8_percent_encode(&file_name, URI_COMPONENT)
        ))
    }
}

/// Stands in when no publish location is configured. Public URLs still
/// work; local references fail as upload errors.
pub struct UnconfiguredUploader {
    reason: String,
}

impl AssetUploader for UnconfiguredUploader {
    fn upload(
        &self,
        local_path: &Path,
        _task_id: TaskId,
        kind: AssetKind,
    ) -> Result<String, CoreError> {
        Err(upload_error(format!(
            "cannot publish local {} '{}': {}",
            kind.as_str(),
            local_path.display(),
            self.reason
        )))
    }
}

pub fn uploader_from_config(config: &AssetConfig) -> Arc<dyn AssetUploader> {
    match (&config.publish_dir, &config.public_base_url) {
        (Some(publish_dir), Some(public_base_url)) => Arc::new(PublishDirectoryUploader::new(
            publish_dir.clone(),
            public_base_url.clone(),
        )),
        (None, _) => Arc::new(UnconfiguredUploader {
            reason: "no publish directory is configured".to_string(),
        }),
        (Some(_), None) => Arc::new(UnconfiguredUploader {
            reason: "no public base url is configured".to_string(),
        }),
    }
}

fn upload_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::Upload, message)
}
