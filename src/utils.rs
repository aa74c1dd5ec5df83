use std::path::{Path, PathBuf};
use url::Url;

/// Last path segment of the URL, or a random name when there is none.
pub fn file_name_from_url(url_str: &str) -> String {
    if let Ok(url) = Url::parse(url_str) {
        if let Some(name) = url.path_segments().and_then(|s| s.last()).filter(|s| !s.is_empty()) {
            return sanitize_filename(name);
        }
    }
    format!("download_{}", uuid::Uuid::new_v4())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// `<dir>/<name>.chunk<index>`
pub fn chunk_path(dir: &Path, file_name: &str, index: u64) -> PathBuf {
    dir.join(format!("{}.chunk{}", file_name, index))
}

/// Staging file a chunk is written to before it is promoted.
pub fn chunk_tmp_path(dir: &Path, file_name: &str, index: u64) -> PathBuf {
    dir.join(format!("{}.chunk{}.tmp", file_name, index))
}

pub fn manifest_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{}.chunks.json", file_name))
}

/// Chunk index encoded in a `<name>.chunk<index>` file name.
pub fn parse_chunk_index(file_name: &str, path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(file_name)?.strip_prefix(".chunk")?.parse().ok()
}
