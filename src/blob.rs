use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid blob key '{0}'")]
    InvalidKey(String),
}

/// Write-only payload storage. `put` returns a URL where the payload can be read.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, value: &Value) -> Result<String, BlobError>;
}

fn check_key(key: &str) -> Result<&Path, BlobError> {
    let path = Path::new(key);
    let clean = !key.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if clean {
        Ok(path)
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

/// Writes pretty-printed JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    /// Serve returned URLs from `base_url` instead of `file://` paths.
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url_for(&self, key: &str, path: &Path) -> Result<String, BlobError> {
        if let Some(base) = &self.public_base_url {
            return Ok(format!("{}/{}", base.trim_end_matches('/'), key));
        }
        let absolute = std::path::absolute(path)?;
        Url::from_file_path(&absolute)
            .map(String::from)
            .map_err(|_| BlobError::InvalidKey(key.to_string()))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, value: &Value) -> Result<String, BlobError> {
        let path = self.root.join(check_key(key)?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes).await?;
        self.url_for(key, &path)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Value>>,
    fail: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, value: &Value) -> Result<String, BlobError> {
        check_key(key)?;
        if self.fail {
            return Err(BlobError::Io(std::io::Error::other("blob store unavailable")));
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(format!("memory://{key}"))
    }
}
