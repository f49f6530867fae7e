//! Filesystem blob store.
//!
//! Writes go to a temporary sibling which is then hard-linked to the final
//! path and removed. The link fails if the target exists, so an object is
//! written at most once and readers never see a partial one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{BlobError, BlobKey, BlobResult, BlobStore};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.path())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> BlobResult<()> {
        key.validate()?;
        let path = self.object_path(key);
        if tokio::fs::try_exists(&path).await? {
            return Err(BlobError::AlreadyExists(key.path()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;

        // hard_link fails if the target exists, which keeps the write-once
        // guarantee even when two writers race on one key.
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(key = %key, bytes = bytes.len(), "Wrote blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BlobError::AlreadyExists(key.path()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &BlobKey) -> BlobResult<Option<Vec<u8>>> {
        key.validate()?;
        match tokio::fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> BlobResult<Vec<BlobKey>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let keys = tokio::task::spawn_blocking(move || -> BlobResult<Vec<BlobKey>> {
            let mut paths = Vec::new();
            if root.exists() {
                collect_files(&root, &root, &mut paths)?;
            }
            let mut keys: Vec<BlobKey> = paths
                .iter()
                .filter(|p| p.starts_with(&prefix))
                .filter_map(|p| BlobKey::parse(p))
                .collect();
            keys.sort_by_key(|k| k.path());
            Ok(keys)
        })
        .await??;
        Ok(keys)
    }
}

/// Relative `/`-separated paths of every file under `dir`.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(rel.join("/"));
        }
    }
    Ok(())
}
