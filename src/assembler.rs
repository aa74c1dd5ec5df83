//! Joins committed chunk files into the final output while the transfer is
//! still running, hashing on the way.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::coordinator::Transfer;
use crate::error::TransferError;
use crate::utils::chunk_path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Appends chunks 0..N-1 to `<output>.part` as they become available and
/// renames it to `output` at the end. Chunk files are removed only after the
/// rename, unless `keep_chunks` is set, so an interrupted run can start over.
pub async fn assemble(transfer: &Transfer, output: &Path, keep_chunks: bool) -> Result<Assembled, TransferError> {
    let config = &transfer.config;
    let layout = transfer.layout;
    let part_path = part_path(output);

    let mut out = OpenOptions::new().create(true).write(true).truncate(true).open(&part_path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    let mut next = 0u64;

    while next < layout.total_chunks() {
        let (_, size) = layout.locate(next).map_err(|_| TransferError::MissingChunk(next))?;
        let path = chunk_path(&config.download_path, &config.file_name, next);

        if chunk_ready(&path, size).await {
            let mut chunk = File::open(&path).await?;
            loop {
                let n = chunk.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                out.write_all(&buffer[..n]).await?;
            }
            written += size;
            debug!(chunk = next, "appended chunk");
            next += 1;
            continue;
        }

        if transfer.is_stopped() {
            return Err(TransferError::Stopped(transfer.stop_reason().unwrap_or_default()));
        }
        if transfer.slot_count() == 0 {
            // Workers are gone; one last look in case the final commit raced us.
            if chunk_ready(&path, size).await {
                continue;
            }
            return Err(TransferError::MissingChunk(next));
        }
        transfer.wait_chunk_event().await;
    }

    out.flush().await?;
    drop(out);
    fs::rename(&part_path, output).await?;

    if !keep_chunks {
        for index in 0..layout.total_chunks() {
            fs::remove_file(chunk_path(&config.download_path, &config.file_name, index)).await?;
        }
    }

    let sha256 = hex::encode(hasher.finalize());
    info!(path = %output.display(), bytes = written, "assembled output");
    Ok(Assembled { path: output.to_path_buf(), bytes: written, sha256 })
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn chunk_ready(path: &Path, size: u64) -> bool {
    matches!(fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() == size)
}

/// SHA-256 of an existing file, hex encoded.
pub async fn sha256_file(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
