//! JSON file store, one document per swap

use super::StateStore;
use crate::error::{SwapError, SwapResult};
use crate::flow::FlowRecord;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const EXTENSION: &str = "json";

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create) the directory holding the snapshots
    pub async fn open(dir: impl Into<PathBuf>) -> SwapResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SwapError::Store(format!("cannot create {:?}: {}", dir, e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, swap_id: &str) -> SwapResult<PathBuf> {
        if swap_id.is_empty()
            || swap_id.contains(['/', '\\'])
            || swap_id.starts_with('.')
        {
            return Err(SwapError::Store(format!("invalid swap id: {:?}", swap_id)));
        }
        Ok(self.dir.join(format!("{}.{}", swap_id, EXTENSION)))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self, swap_id: &str) -> SwapResult<Option<FlowRecord>> {
        let path = self.path_for(swap_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SwapError::Store(format!("read {:?}: {}", path, e))),
        }
    }

    async fn save(&self, swap_id: &str, record: &FlowRecord) -> SwapResult<()> {
        let path = self.path_for(swap_id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;

        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SwapError::Store(format!("write {:?}: {}", tmp, e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SwapError::Store(format!("rename {:?}: {}", path, e)))?;

        debug!("Saved swap {} at step {}", swap_id, record.step);
        Ok(())
    }

    async fn remove(&self, swap_id: &str) -> SwapResult<()> {
        let path = self.path_for(swap_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SwapError::Store(format!("remove {:?}: {}", path, e))),
        }
    }

    async fn list(&self) -> SwapResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| SwapError::Store(format!("list {:?}: {}", self.dir, e)))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SwapError::Store(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
