use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Chunk size for a multiplier of 1.
pub const BASE_CHUNK_SIZE: u64 = 1024 * 1024;

/// A proxied chunk slower than this share of the fair per-slot speed marks
/// the proxy as slow.
pub const SLOW_PROXY_PERCENT: f64 = 0.5;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts through one smart proxy before it is blocked.
pub const PROXY_TIMEOUT_LIMIT: u32 = 2;

/// Upper bound of the exponential backoff, in backoff units.
pub const MAX_BACKOFF_SECS: u64 = 64;

/// Origin signal that this route is rate limited; try another proxy.
pub const HTTP_RATE_LIMITED: u16 = 509;

/// Origin signal that the download URL has expired.
pub const HTTP_URL_EXPIRED: u16 = 403;

/// Fixed user-configured HTTP proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxySettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Where the smart-proxy pool gets its candidates from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProxySource {
    Inline(Vec<String>),
    File(PathBuf),
    Url(String),
}

impl ProxySource {
    /// `http(s)://` means a remote list, anything else is a local file.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            ProxySource::Url(raw.to_string())
        } else {
            ProxySource::File(PathBuf::from(raw))
        }
    }
}

/// Everything one transfer needs to know about its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub download_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    /// Chunk size in bytes, normally `BASE_CHUNK_SIZE * multiplier`.
    pub chunk_size: u64,
    pub slots: usize,
    /// Global cap in bytes per second; `None` means unlimited.
    pub speed_cap: Option<u32>,
    pub proxy: Option<ProxySettings>,
    pub smart_proxy: bool,
    pub proxy_source: Option<ProxySource>,
    pub timeout: Duration,
    pub user_agent: String,
    /// Duration of one backoff "second"; shortened in tests.
    pub backoff_unit: Duration,
    /// Slot count to grow to once a smart proxy is first picked up. Zero or
    /// anything not above `slots` leaves the slot count alone.
    pub proxy_turbo_slots: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("downloads"),
            file_name: String::new(),
            file_size: 0,
            chunk_size: BASE_CHUNK_SIZE,
            slots: num_cpus::get().clamp(2, 8),
            speed_cap: None,
            proxy: None,
            smart_proxy: false,
            proxy_source: None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff_unit: Duration::from_secs(1),
            proxy_turbo_slots: 0,
        }
    }
}

impl TransferConfig {
    /// Smart proxies only kick in when no fixed proxy is configured.
    pub fn smart_proxy_active(&self) -> bool {
        self.smart_proxy && self.proxy.is_none()
    }

    /// Extra workers to start when proxied, if turbo is on.
    pub fn turbo_extra_slots(&self) -> usize {
        if !self.smart_proxy_active() {
            return 0;
        }
        self.proxy_turbo_slots.saturating_sub(self.slots.max(1))
    }
}
