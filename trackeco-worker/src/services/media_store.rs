//! Media object store lifecycle
//!
//! Uploaded media lives under the configured media root: the upload
//! collaborator writes into `incoming/`, this worker moves objects to
//! `processed/` on success or `failed/` on terminal failure. Moves are
//! copy-then-delete; the original is removed only after the copy succeeded,
//! so a crash mid-move can duplicate an object but never lose one.

use std::path::{Path, PathBuf};
use trackeco_common::{Error, Result};
use tracing::{info, warn};

pub const PROCESSED_PREFIX: &str = "processed";
pub const FAILED_PREFIX: &str = "failed";

/// Filesystem-backed media store
#[derive(Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a store-relative object path, rejecting traversal
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative_path = Path::new(relative);
        if relative_path.is_absolute()
            || relative_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::InvalidInput(format!(
                "Invalid media path: {}",
                relative
            )));
        }
        Ok(self.root.join(relative_path))
    }

    pub async fn exists(&self, relative: &str) -> bool {
        match self.resolve(relative) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read an object's bytes
    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "Media object not found: {}",
                relative
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an object to the `processed/` area, returning its new relative path
    pub async fn move_to_processed(&self, relative: &str) -> Result<String> {
        self.move_to(relative, PROCESSED_PREFIX).await
    }

    /// Move an object to the `failed/` area for manual inspection
    pub async fn move_to_failed(&self, relative: &str) -> Result<String> {
        self.move_to(relative, FAILED_PREFIX).await
    }

    async fn move_to(&self, relative: &str, prefix: &str) -> Result<String> {
        let source = self.resolve(relative)?;
        let file_name = source
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("No file name in: {}", relative)))?
            .to_owned();

        let dest_relative = format!("{}/{}", prefix, file_name.to_string_lossy());
        let dest = self.resolve(&dest_relative)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Copy first; the original is deleted only once the copy is durable
        tokio::fs::copy(&source, &dest).await?;
        tokio::fs::remove_file(&source).await?;

        info!(from = relative, to = %dest_relative, "Moved media object");
        Ok(dest_relative)
    }

    /// Best-effort variant of the failed-area move for error paths: a media
    /// lifecycle problem must never mask the error being handled
    pub async fn try_move_to_failed(&self, relative: &str) {
        if !self.exists(relative).await {
            return;
        }
        if let Err(e) = self.move_to_failed(relative).await {
            warn!(path = relative, "Could not move media to failed area: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_object(name: &str, content: &[u8]) -> (tempfile::TempDir, MediaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());
        let incoming = dir.path().join("incoming");
        tokio::fs::create_dir_all(&incoming).await.unwrap();
        tokio::fs::write(incoming.join(name), content).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn read_round_trip() {
        let (_dir, store) = store_with_object("clip.mp4", b"video bytes").await;
        assert_eq!(store.read("incoming/clip.mp4").await.unwrap(), b"video bytes");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_dir, store) = store_with_object("clip.mp4", b"x").await;
        assert!(matches!(
            store.read("incoming/other.mp4").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn processed_move_deletes_original() {
        let (_dir, store) = store_with_object("clip.mp4", b"video bytes").await;
        let dest = store.move_to_processed("incoming/clip.mp4").await.unwrap();
        assert_eq!(dest, "processed/clip.mp4");
        assert!(!store.exists("incoming/clip.mp4").await);
        assert_eq!(store.read(&dest).await.unwrap(), b"video bytes");
    }

    #[tokio::test]
    async fn failed_move_lands_in_failed_area() {
        let (_dir, store) = store_with_object("clip.mp4", b"x").await;
        let dest = store.move_to_failed("incoming/clip.mp4").await.unwrap();
        assert_eq!(dest, "failed/clip.mp4");
        assert!(store.exists("failed/clip.mp4").await);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, store) = store_with_object("clip.mp4", b"x").await;
        assert!(store.read("../etc/passwd").await.is_err());
        assert!(store.read("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn best_effort_move_tolerates_missing_source() {
        let (_dir, store) = store_with_object("clip.mp4", b"x").await;
        // Does not panic or error for a path that is already gone
        store.try_move_to_failed("incoming/ghost.mp4").await;
    }
}
