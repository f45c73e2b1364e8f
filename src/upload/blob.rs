use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// Remote object storage for recorded artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path`, replacing any previous object, and returns
    /// the storage reference.
    async fn upload(&self, bytes: Vec<u8>, path: &str) -> Result<String>;

    /// Resolves a stored object to a URL that can be fetched later.
    async fn download_url(&self, path: &str) -> Result<String>;
}

/// Reads a locally captured artifact given the URI its driver returned.
pub async fn read_artifact(uri: &str) -> Result<Vec<u8>> {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read artifact {uri}"))
}

/// Blob store rooted in a local directory. Used by the headless binary and
/// as an offline fallback.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("blob path '{path}' must be relative and stay inside the store");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, bytes: Vec<u8>, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("failed to write blob {}", target.display()))?;
        Ok(path.to_string())
    }

    async fn download_url(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            bail!("no blob stored at '{path}'");
        }
        Ok(format!("file://{}", target.display()))
    }
}
