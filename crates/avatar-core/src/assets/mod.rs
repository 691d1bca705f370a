pub mod uploader;

pub use uploader::{PublishDirectoryUploader, UnconfiguredUploader, uploader_from_config};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::{CoreError, CoreErrorKind, TaskId};
use crate::persistence::LinkedRecordStore;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AssetKind {
    Image,
    Audio,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

/// Durable blob storage. Returns a URL the provider can fetch.
pub trait AssetUploader: Send + Sync {
    fn upload(&self, local_path: &Path, task_id: TaskId, kind: AssetKind)
    -> Result<String, CoreError>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PreparedAssets {
    pub image_url: String,
    pub audio_url: String,
    pub audio_rewritten: bool,
}

/// References the provider can fetch as-is.
pub fn is_public_url(reference: &str) -> bool {
    let reference = reference.trim();
    ["http://", "https://"].iter().any(|scheme| {
        reference.len() > scheme.len()
            && reference
                .get(..scheme.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

pub struct AssetPreparer {
    uploader: Arc<dyn AssetUploader>,
    linked_records: Option<Arc<dyn LinkedRecordStore>>,
    local_root: PathBuf,
}

impl AssetPreparer {
    pub fn new(uploader: Arc<dyn AssetUploader>, local_root: impl Into<PathBuf>) -> Self {
        Self {
            uploader,
            linked_records: None,
            local_root: local_root.into(),
        }
    }

    pub fn with_linked_records(mut self, linked_records: Arc<dyn LinkedRecordStore>) -> Self {
        self.linked_records = Some(linked_records);
        self
    }

    /// Uploads non-public references. A rewritten audio URL is mirrored to the
    /// linked record on a best-effort basis; upload failures surface as
    /// [`CoreErrorKind::Upload`].
    pub fn prepare(
        &self,
        task_id: TaskId,
        image_ref: &str,
        audio_ref: &str,
        linked_record_id: Option<&str>,
    ) -> Result<PreparedAssets, CoreError> {
        let image_url = self.ensure_public(task_id, image_ref, AssetKind::Image)?;
        let audio_url = self.ensure_public(task_id, audio_ref, AssetKind::Audio)?;
        let audio_rewritten = audio_url != audio_ref;

        if audio_rewritten
            && let (Some(record_id), Some(linked_records)) = (linked_record_id, &self.linked_records)
            && let Err(error) = linked_records.update_linked_audio(record_id, &audio_url)
        {
            tracing::warn!(
                task_id = task_id.0,
                record_id,
                kind = ?error.kind,
                message = %error.message,
                "failed to propagate uploaded audio url to linked record"
            );
        }

        Ok(PreparedAssets {
            image_url,
            audio_url,
            audio_rewritten,
        })
    }

    pub fn resolve_local_path(&self, reference: &str) -> PathBuf {
        let reference = reference.trim();
        let path = Path::new(reference.strip_prefix("file://").unwrap_or(reference));
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.local_root.join(path)
        }
    }

    fn ensure_public(
        &self,
        task_id: TaskId,
        reference: &str,
        kind: AssetKind,
    ) -> Result<String, CoreError> {
        if is_public_url(reference) {
            return Ok(reference.to_string());
        }

        let local_path = self.resolve_local_path(reference);
        let url = self
            .uploader
            .upload(&local_path, task_id, kind)
            .map_err(|error| {
                let message = if error.kind == CoreErrorKind::Upload {
                    error.message
                } else {
                    format!(
                        "failed to upload {} '{}': {}",
                        kind.as_str(),
                        local_path.display(),
                        error.message
                    )
                };
                CoreError::new(CoreErrorKind::Upload, message).for_task(task_id)
            })?;

        tracing::debug!(
            task_id = task_id.0,
            kind = kind.as_str(),
            url = %url,
            "uploaded local asset"
        );
        Ok(url)
    }
}
