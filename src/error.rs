use thiserror::Error;

/// Outcome of a single chunk attempt that did not commit.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid chunk {index}: offset {offset} is outside a file of {file_size} bytes")]
    InvalidChunk { index: u64, offset: u64, file_size: u64 },

    #[error("no more chunks to download")]
    NoMoreChunks,

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("rate limited by origin (HTTP {0})")]
    RateLimited(u16),

    #[error("download url expired (HTTP {0})")]
    AuthExpired(u16),

    #[error("fatal worker error: {0}")]
    Fatal(String),
}

impl ChunkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChunkError::Timeout(_))
    }

    /// Classifies a non-success status from a chunk request.
    pub fn from_status(code: u16) -> Self {
        match code {
            crate::config::HTTP_RATE_LIMITED => ChunkError::RateLimited(code),
            crate::config::HTTP_URL_EXPIRED => ChunkError::AuthExpired(code),
            _ => ChunkError::UnexpectedStatus(code),
        }
    }

    /// HTTP status carried by the error, if the server answered at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ChunkError::RateLimited(code)
            | ChunkError::AuthExpired(code)
            | ChunkError::UnexpectedStatus(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChunkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChunkError::Timeout("waiting for the server")
        } else {
            ChunkError::Transient(e.to_string())
        }
    }
}

impl From<std::io::Error> for ChunkError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            ChunkError::Timeout("doing I/O")
        } else {
            ChunkError::Transient(e.to_string())
        }
    }
}

/// Errors raised outside the per-chunk loop.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("server did not report a content length for {0}")]
    UnknownSize(String),

    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("bad manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("chunk {0} is missing or has the wrong size")]
    MissingChunk(u64),

    #[error("transfer stopped: {0}")]
    Stopped(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed proxy address {0:?}, expected host:port")]
    Malformed(String),

    #[error("failed to load proxy list: {0}")]
    Load(String),

    #[error("failed to build proxied client: {0}")]
    Client(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(ChunkError::from_status(509), ChunkError::RateLimited(509)));
        assert!(matches!(ChunkError::from_status(403), ChunkError::AuthExpired(403)));
        assert!(matches!(ChunkError::from_status(503), ChunkError::UnexpectedStatus(503)));
        assert_eq!(ChunkError::from_status(500).http_status(), Some(500));
        assert_eq!(ChunkError::NoMoreChunks.http_status(), None);
    }

    #[test]
    fn timed_out_io_is_a_timeout() {
        let e: ChunkError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(e.is_timeout());
        let e: ChunkError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(!e.is_timeout());
    }
}
