//! Artifact storage
//!
//! The [`ArtifactStore`] trait is the seam to whatever keeps published
//! files (object storage, a package registry, a release page). The
//! orchestrator ships [`LocalArtifactStore`], which copies artifacts into a
//! directory.

use async_trait::async_trait;
use kiln_core::domain::artifact::StorageHandle;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Storage error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("File {0} not found in the run workspace")]
    MissingFile(PathBuf),

    #[error("Path {0} is not a relative path inside the run workspace")]
    InvalidPath(PathBuf),

    #[error("Unknown storage handle '{0}'")]
    UnknownHandle(StorageHandle),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persists artifact files and hands out handles to them
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `paths` (relative to `root`) as artifact `name`
    async fn store(
        &self,
        name: &str,
        root: &Path,
        paths: &[PathBuf],
    ) -> Result<StorageHandle, StoreError>;

    /// Lists the stored paths behind a handle
    async fn fetch(&self, handle: &StorageHandle) -> Result<Vec<PathBuf>, StoreError>;
}

/// Stores each artifact in its own directory `<root>/<name>-<uuid>/`
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn copy_all(
        &self,
        source_root: &Path,
        destination: &Path,
        paths: &[PathBuf],
    ) -> Result<(), StoreError> {
        for path in paths {
            if !is_relative_inside(path) {
                return Err(StoreError::InvalidPath(path.clone()));
            }

            let source = source_root.join(path);
            if !tokio::fs::metadata(&source)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Err(StoreError::MissingFile(path.clone()));
            }

            let target = destination.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&source, &target).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(
        &self,
        name: &str,
        root: &Path,
        paths: &[PathBuf],
    ) -> Result<StorageHandle, StoreError> {
        let handle = StorageHandle(format!("{}-{}", sanitize(name), Uuid::new_v4()));
        let destination = self.root.join(&handle.0);
        tokio::fs::create_dir_all(&destination).await?;

        if let Err(e) = self.copy_all(root, &destination, paths).await {
            let _ = tokio::fs::remove_dir_all(&destination).await;
            return Err(e);
        }

        debug!(
            "Stored {} file(s) of artifact '{}' in {}",
            paths.len(),
            name,
            destination.display()
        );
        Ok(handle)
    }

    async fn fetch(&self, handle: &StorageHandle) -> Result<Vec<PathBuf>, StoreError> {
        let handle_path = Path::new(&handle.0);
        let single_component = handle_path.components().count() == 1
            && matches!(handle_path.components().next(), Some(Component::Normal(_)));
        if !single_component {
            return Err(StoreError::UnknownHandle(handle.clone()));
        }

        let directory = self.root.join(handle_path);
        if !tokio::fs::metadata(&directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(StoreError::UnknownHandle(handle.clone()));
        }

        let mut files = Vec::new();
        let mut pending = vec![directory.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&directory) {
                    files.push(relative.to_path_buf());
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

fn is_relative_inside(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_with(files: &[&str]) -> tempfile::TempDir {
        let workspace = tempfile::tempdir().unwrap();
        for file in files {
            let path = workspace.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, file.as_bytes()).unwrap();
        }
        workspace
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let workspace = workspace_with(&["out/app.exe", "out/app.pdb"]);
        let storage = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(storage.path());

        let handle = store
            .store(
                "app bundle",
                workspace.path(),
                &[PathBuf::from("out/app.exe"), PathBuf::from("out/app.pdb")],
            )
            .await
            .unwrap();
        assert!(handle.0.starts_with("app_bundle-"));

        let copied = storage.path().join(&handle.0).join("out/app.exe");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "out/app.exe");

        assert_eq!(
            store.fetch(&handle).await.unwrap(),
            vec![PathBuf::from("out/app.exe"), PathBuf::from("out/app.pdb")]
        );
    }

    #[tokio::test]
    async fn test_store_missing_file_leaves_nothing_behind() {
        let workspace = workspace_with(&["out/app.exe"]);
        let storage = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(storage.path());

        let result = store
            .store(
                "app",
                workspace.path(),
                &[PathBuf::from("out/app.exe"), PathBuf::from("out/missing")],
            )
            .await;

        assert!(matches!(result, Err(StoreError::MissingFile(_))));
        assert_eq!(std::fs::read_dir(storage.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_store_rejects_escaping_paths() {
        let workspace = workspace_with(&["out/app.exe"]);
        let storage = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(storage.path());

        let result = store
            .store("app", workspace.path(), &[PathBuf::from("../secret")])
            .await;
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_fetch_unknown_handle() {
        let storage = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(storage.path());

        for handle in ["app-missing", "../etc", ""] {
            let result = store.fetch(&StorageHandle(handle.to_string())).await;
            assert!(matches!(result, Err(StoreError::UnknownHandle(_))));
        }
    }
}
