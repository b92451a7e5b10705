use std::path::{Path, PathBuf};

use uuid::Uuid;

use village_health_common::AppError;

use crate::config::StorageConfig;
use crate::services::AppState;

/// Public prefix stored in `problems.photo`; files are served back through
/// the authenticated `/uploads/:name` route.
pub const UPLOAD_URL_PREFIX: &str = "uploads/";

#[derive(Clone)]
pub struct PhotoStorage {
    config: StorageConfig,
}

impl PhotoStorage {
    pub fn new(state: &AppState) -> Self {
        Self::from_config(&state.config.storage)
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn dir(&self) -> &Path {
        Path::new(&self.config.uploads_dir)
    }

    /// Checks an upload before anything touches the disk. Returns the
    /// lower-cased extension to store it under.
    pub fn validate(&self, original_name: &str, size: usize) -> Result<String, AppError> {
        if size == 0 {
            return Err(AppError::Validation("The uploaded photo is empty".to_string()));
        }
        if size > self.config.max_photo_bytes {
            return Err(AppError::Validation(format!(
                "Photo is too large (maximum {} MB)",
                self.config.max_photo_bytes / (1024 * 1024)
            )));
        }

        let extension = Path::new(original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.config.allowed_photo_extensions.contains(&extension) {
            return Err(AppError::Validation(format!(
                "Unsupported photo format. Allowed: {}",
                self.config.allowed_photo_extensions.join(", ")
            )));
        }

        Ok(extension)
    }

    /// Stores the photo under a fresh random name and returns the value to
    /// keep in `problems.photo`.
    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> Result<String, AppError> {
        let extension = self.validate(original_name, bytes.len())?;
        let file_name = format!("{}.{}", Uuid::new_v4(), extension);

        tokio::fs::create_dir_all(self.dir()).await?;
        tokio::fs::write(self.dir().join(&file_name), bytes).await?;

        tracing::info!("Stored photo {} ({} bytes)", file_name, bytes.len());
        Ok(format!("{}{}", UPLOAD_URL_PREFIX, file_name))
    }

    /// Best effort; used to clean up after a failed insert.
    pub async fn remove(&self, stored: &str) {
        let Some(name) = stored.strip_prefix(UPLOAD_URL_PREFIX) else {
            return;
        };
        let Ok(path) = self.path_for(name) else {
            return;
        };
        if let Err(err) = tokio::fs::remove_file(&path).await {
            tracing::warn!("Could not remove photo {}: {}", path.display(), err);
        }
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>, AppError> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound("Photo not found".to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, AppError> {
        if !is_stored_name(name) {
            return Err(AppError::NotFound("Photo not found".to_string()));
        }
        Ok(self.dir().join(name))
    }
}

/// Only names this storage generates are accepted: `<uuid>.<ext>`.
pub fn is_stored_name(name: &str) -> bool {
    let Some((stem, ext)) = name.split_once('.') else {
        return false;
    };
    Uuid::parse_str(stem).is_ok()
        && !ext.is_empty()
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `Content-Type` for a stored photo, derived from its extension.
pub fn content_type_for(name: &str) -> &'static str {
    match name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &str) -> PhotoStorage {
        PhotoStorage::from_config(&StorageConfig {
            uploads_dir: dir.to_string(),
            backups_dir: "backups".to_string(),
            max_photo_bytes: 1024,
            allowed_photo_extensions: vec!["jpg".to_string(), "png".to_string()],
        })
    }

    #[test]
    fn rejects_wrong_extension_and_size() {
        let storage = storage("uploads");
        assert_eq!(storage.validate("Well.JPG", 10).unwrap(), "jpg");
        assert!(storage.validate("notes.exe", 10).is_err());
        assert!(storage.validate("noextension", 10).is_err());
        assert!(storage.validate("big.png", 2048).is_err());
        assert!(storage.validate("empty.png", 0).is_err());
    }

    #[test]
    fn only_generated_names_are_served() {
        let name = format!("{}.png", Uuid::new_v4());
        assert!(is_stored_name(&name));
        assert!(!is_stored_name("../secret.png"));
        assert!(!is_stored_name("photo.png"));
        assert!(!is_stored_name(&format!("{}.", Uuid::new_v4())));
        assert!(!is_stored_name(&format!("{}.png/..", Uuid::new_v4())));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("a.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("a.webp"), "image/webp");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn save_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path().to_str().unwrap());

        let stored = storage.save("pump.png", b"png-bytes").await.unwrap();
        assert!(stored.starts_with(UPLOAD_URL_PREFIX));

        let name = stored.strip_prefix(UPLOAD_URL_PREFIX).unwrap();
        assert_eq!(storage.read(name).await.unwrap(), b"png-bytes");

        storage.remove(&stored).await;
        assert!(matches!(storage.read(name).await, Err(AppError::NotFound(_))));
    }
}
