//! Blob store adapter
//!
//! Artifacts (feature frames, model files) are addressed by a path string.
//! [`FsBlobStore`] keeps them under a root directory; a cloud-storage client
//! plugs in behind the [`BlobStore`] trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{Error, Result};

/// Blob locator of an item's feature frames
pub fn features_path(feature_kind: &str, project: &str, item_id: &str) -> String {
    format!("artifacts/{feature_kind}/{project}/{item_id}/frames.json")
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download a blob to a local file, returning the local path.
    /// A destination file that already exists is reused without a transfer.
    async fn download(&self, path: &str, dest: &Path) -> Result<PathBuf>;

    /// Upload a local file to the given blob path, creating it or replacing
    /// any previous content.
    async fn upload(&self, src: &Path, path: &str) -> Result<()>;
}

/// Filesystem-backed blob store
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn download(&self, path: &str, dest: &Path) -> Result<PathBuf> {
        if tokio::fs::try_exists(dest).await? {
            tracing::debug!(path, dest = %dest.display(), "blob already present locally");
            return Ok(dest.to_path_buf());
        }

        let source = self.resolve(path);
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::NotFound(format!("blob {path}")));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, dest).await?;
        tracing::debug!(path, dest = %dest.display(), "blob downloaded");

        Ok(dest.to_path_buf())
    }

    async fn upload(&self, src: &Path, path: &str) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, &target).await?;
        tracing::debug!(src = %src.display(), path, "blob uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_download() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(store_dir.path());

        let src = work_dir.path().join("payload.json");
        std::fs::write(&src, b"[1,2,3]").unwrap();
        store.upload(&src, "artifacts/test/payload.json").await.unwrap();

        let dest = work_dir.path().join("fetched.json");
        let local = store
            .download("artifacts/test/payload.json", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"[1,2,3]");
    }

    #[tokio::test]
    async fn test_download_reuses_existing_local_file() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(store_dir.path());

        let dest = work_dir.path().join("cached.json");
        std::fs::write(&dest, b"cached-content").unwrap();

        // No such blob exists in the store, but the local copy wins
        let local = store.download("artifacts/missing.json", &dest).await.unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"cached-content");
    }

    #[tokio::test]
    async fn test_download_missing_blob_is_not_found() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(store_dir.path());

        let dest = work_dir.path().join("absent.json");
        let err = store.download("artifacts/absent.json", &dest).await;
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_features_path_shape() {
        assert_eq!(
            features_path("embedding", "proj", "item-9"),
            "artifacts/embedding/proj/item-9/frames.json"
        );
    }
}
