//! Object storage for finalized images.
//!
//! Keys are stable per (tenant, site, device, image name), so finalizing the
//! same image twice overwrites the same object.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{EngineError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobKey {
    pub tenant_id: String,
    pub site_id: Option<String>,
    pub device_id: String,
    pub image_name: String,
}

fn segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}

impl BlobKey {
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            segment(&self.tenant_id),
            segment(self.site_id.as_deref().unwrap_or("unassigned")),
            segment(&self.device_id),
            segment(&self.image_name),
        )
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object. Returns the
    /// stored key path.
    async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String>;
}

/// Writes objects as files below a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String> {
        let rel = key.path();
        let target = self.root.join(&rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Blob(format!("create {}: {e}", parent.display())))?;
        }
        // Rename into place; readers never see a partial object.
        let tmp = target.with_extension("part");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| EngineError::Blob(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| EngineError::Blob(format!("rename {}: {e}", target.display())))?;
        debug!(key = %rel, len = bytes.len(), "blob stored");
        Ok(rel)
    }
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.get(path).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String> {
        let path = key.path();
        self.objects.insert(path.clone(), bytes.to_vec());
        Ok(path)
    }
}
