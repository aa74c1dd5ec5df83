//! Where workers get the base URL for their range requests.

pub mod resolve;

use async_trait::async_trait;

use crate::error::TransferError;

pub use resolve::{probe, Probe, RedirectResolver};

/// Supplies a base URL for range requests. Called again whenever a worker
/// sees its URL rejected as expired, so implementations may go back to the
/// network for a fresh one.
#[async_trait]
pub trait UrlProvider: Send + Sync {
    async fn download_url(&self) -> Result<String, TransferError>;
}

/// A URL that never expires.
#[derive(Clone, Debug)]
pub struct StaticUrl(pub String);

#[async_trait]
impl UrlProvider for StaticUrl {
    async fn download_url(&self) -> Result<String, TransferError> {
        Ok(self.0.clone())
    }
}

/// Picks a provider for a user-supplied URL.
pub fn for_url(url: &str, follow_redirects: bool) -> Result<Box<dyn UrlProvider>, TransferError> {
    let parsed = url::Url::parse(url).map_err(|e| TransferError::InvalidUrl(format!("{url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(TransferError::InvalidUrl(format!("{url}: only http(s) is supported")));
    }
    if follow_redirects {
        Ok(Box::new(RedirectResolver::new(url.to_string())?))
    } else {
        Ok(Box::new(StaticUrl(url.to_string())))
    }
}
