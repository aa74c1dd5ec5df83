use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::chunk::ChunkLayout;
use crate::error::TransferError;
use crate::utils::{chunk_path, manifest_path};

/// Sidecar written next to the chunk files so an interrupted transfer can be
/// resumed with the same layout, and listed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferManifest {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub created_at: DateTime<Local>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl TransferManifest {
    pub fn new(url: String, file_name: String, layout: ChunkLayout) -> Self {
        Self {
            url,
            file_name,
            file_size: layout.file_size,
            chunk_size: layout.chunk_size,
            created_at: Local::now(),
            sha256: None,
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout::new(self.file_size, self.chunk_size)
    }

    /// Chunk files on disk can be reused only when size and chunking agree.
    pub fn is_compatible(&self, other: &TransferManifest) -> bool {
        self.file_size == other.file_size && self.chunk_size == other.chunk_size
    }

    pub async fn load(dir: &Path, file_name: &str) -> Result<Option<Self>, TransferError> {
        let path = manifest_path(dir, file_name);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, dir: &Path) -> Result<PathBuf, TransferError> {
        let path = manifest_path(dir, &self.file_name);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content).await?;
        Ok(path)
    }

    /// Bytes already sitting in complete chunk files.
    pub async fn downloaded_bytes(&self, dir: &Path) -> u64 {
        let layout = self.layout();
        let mut done = 0;
        for index in 0..layout.total_chunks() {
            let Ok((_, size)) = layout.locate(index) else { break };
            if let Ok(meta) = fs::metadata(chunk_path(dir, &self.file_name, index)).await {
                if meta.len() == size {
                    done += size;
                }
            }
        }
        done
    }
}
