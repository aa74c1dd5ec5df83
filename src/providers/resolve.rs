use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::debug;

use super::UrlProvider;
use crate::config::DEFAULT_USER_AGENT;
use crate::error::TransferError;

/// What a server tells us about a download before it starts.
#[derive(Debug, Clone)]
pub struct Probe {
    /// URL after redirects.
    pub url: String,
    pub size: u64,
    pub accepts_ranges: bool,
}

/// Asks the server for the file size, following redirects. Falls back to a
/// one-byte ranged GET when HEAD gives no length.
pub async fn probe(client: &Client, url: &str) -> Result<Probe, TransferError> {
    let resp = client.head(url).send().await?;
    let final_url = resp.url().to_string();
    let accepts_ranges = resp
        .headers()
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("bytes"))
        .unwrap_or(false);

    if resp.status().is_success() {
        // The body of a HEAD response is empty, so read the header itself.
        let size = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|s| *s > 0);
        if let Some(size) = size {
            return Ok(Probe { url: final_url, size, accepts_ranges });
        }
    }

    let resp = client.get(url).header(header::RANGE, "bytes=0-0").send().await?.error_for_status()?;
    let final_url = resp.url().to_string();
    let size = resp
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| TransferError::UnknownSize(url.to_string()))?;
    Ok(Probe { url: final_url, size, accepts_ranges: true })
}

/// Re-resolves a source URL through its redirects each time a fresh download
/// URL is needed, for hosts that hand out short-lived signed links.
#[derive(Debug, Clone)]
pub struct RedirectResolver {
    source: String,
    client: Client,
}

impl RedirectResolver {
    pub fn new(source: String) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { source, client })
    }
}

#[async_trait]
impl UrlProvider for RedirectResolver {
    async fn download_url(&self) -> Result<String, TransferError> {
        let resp = self.client.head(&self.source).send().await?;
        let resolved = resp.url().to_string();
        debug!(source = %self.source, resolved = %resolved, "resolved download url");
        Ok(resolved)
    }
}
