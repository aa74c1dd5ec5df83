//! Per-transfer pool of smart proxies.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::{ProxySettings, ProxySource, PROXY_TIMEOUT_LIMIT, SLOW_PROXY_PERCENT};
use crate::error::ProxyError;

#[derive(Debug, Default)]
struct PoolState {
    /// Candidates in the order the source listed them.
    candidates: Vec<String>,
    blocked: HashSet<String>,
    speeds: HashMap<String, u64>,
    timeouts: HashMap<String, u32>,
    /// Set once a refresh found nothing new so we stop hammering the source.
    exhausted: bool,
}

/// Ranked proxy candidates for one transfer.
#[derive(Debug)]
pub struct ProxyPool {
    source: ProxySource,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(candidates: Vec<String>) -> Self {
        let candidates = dedup(candidates);
        Self {
            source: ProxySource::Inline(candidates.clone()),
            state: Mutex::new(PoolState { candidates, ..Default::default() }),
        }
    }

    /// Builds a pool and performs the initial load from `source`.
    pub async fn load(source: ProxySource) -> Result<Self, ProxyError> {
        let candidates = fetch_list(&source).await?;
        info!(count = candidates.len(), "loaded smart proxy list");
        Ok(Self { source, state: Mutex::new(PoolState { candidates, ..Default::default() }) })
    }

    /// Best non-blocked candidate. When everything is blocked, a file or URL
    /// backed pool reloads its source once and unblocks what comes back.
    pub async fn fastest(&self) -> Option<String> {
        if let Some(best) = self.pick() {
            return Some(best);
        }
        let exhausted = self.lock().exhausted;
        if exhausted || matches!(self.source, ProxySource::Inline(_)) {
            return None;
        }
        self.refresh().await;
        self.pick()
    }

    pub fn block(&self, address: &str) {
        let mut state = self.lock();
        if state.blocked.insert(address.to_string()) {
            warn!(proxy = address, "excluding proxy");
        }
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.lock().blocked.contains(address)
    }

    pub fn record_speed(&self, address: &str, bytes_per_sec: u64) {
        let mut state = self.lock();
        state.timeouts.remove(address);
        state.speeds.insert(address.to_string(), bytes_per_sec);
    }

    /// Counts a timeout through `address` and blocks it once the strikes add
    /// up. Returns whether it is now blocked.
    pub fn record_timeout(&self, address: &str) -> bool {
        let strikes = {
            let mut state = self.lock();
            let strikes = state.timeouts.entry(address.to_string()).or_insert(0);
            *strikes += 1;
            *strikes
        };
        if strikes >= PROXY_TIMEOUT_LIMIT {
            self.block(address);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.lock().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pick(&self) -> Option<String> {
        let state = self.lock();
        let mut measured: Vec<(&String, u64)> = state
            .candidates
            .iter()
            .filter(|c| !state.blocked.contains(*c))
            .filter_map(|c| state.speeds.get(c).map(|s| (c, *s)))
            .collect();
        measured.sort_by(|a, b| b.1.cmp(&a.1));
        if let Some((best, _)) = measured.first() {
            return Some((*best).clone());
        }
        state
            .candidates
            .iter()
            .find(|c| !state.blocked.contains(*c) && !state.speeds.contains_key(*c))
            .cloned()
    }

    async fn refresh(&self) {
        match fetch_list(&self.source).await {
            Ok(fresh) => {
                let mut state = self.lock();
                let mut revived = 0;
                for addr in &fresh {
                    if state.blocked.remove(addr) {
                        state.speeds.remove(addr);
                        state.timeouts.remove(addr);
                        revived += 1;
                    }
                }
                let known: HashSet<String> = state.candidates.iter().cloned().collect();
                let added: Vec<String> = fresh.into_iter().filter(|a| !known.contains(a)).collect();
                state.exhausted = revived == 0 && added.is_empty();
                debug!(revived, added = added.len(), "refreshed smart proxy list");
                state.candidates.extend(added);
            }
            Err(e) => {
                warn!("smart proxy refresh failed: {}", e);
                self.lock().exhausted = true;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whether a proxied chunk came in too slowly.
///
/// `active` must already exclude time spent paused. `reference_speed` is the
/// global cap or, without one, the best average the transfer has reached.
pub fn is_slow_proxy(chunk_size: u64, active: Duration, reference_speed: u64, active_slots: usize) -> bool {
    if reference_speed == 0 || active_slots == 0 {
        return false;
    }
    let chunk_speed = chunk_speed(chunk_size, active);
    let fair_share = reference_speed as f64 / active_slots as f64;
    (chunk_speed as f64) < (fair_share * SLOW_PROXY_PERCENT).round()
}

/// Bytes per second for `chunk_size` bytes moved in `active` time.
pub fn chunk_speed(chunk_size: u64, active: Duration) -> u64 {
    let secs = active.as_secs_f64();
    if secs <= 0.0 {
        return u64::MAX;
    }
    (chunk_size as f64 / secs).round() as u64
}

/// Validates `host:port`.
pub fn parse_address(raw: &str) -> Result<String, ProxyError> {
    let raw = raw.trim();
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| ProxyError::Malformed(raw.to_string()))?;
    if host.is_empty() || port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
        return Err(ProxyError::Malformed(raw.to_string()));
    }
    Ok(raw.to_string())
}

/// `host:port` per line; blank lines and `#` comments are skipped, malformed
/// lines are dropped with a warning.
pub fn parse_list(text: &str) -> Vec<String> {
    let parsed = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| match parse_address(l) {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("{}", e);
                None
            }
        })
        .collect();
    dedup(parsed)
}

/// Parses `host:port` into fixed proxy settings.
pub fn parse_settings(raw: &str, user: Option<String>, password: Option<String>) -> Result<ProxySettings, ProxyError> {
    let addr = parse_address(raw)?;
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| ProxyError::Malformed(addr.clone()))?;
    let port = port.parse().map_err(|_| ProxyError::Malformed(addr.clone()))?;
    Ok(ProxySettings { host: host.to_string(), port, user, password })
}

async fn fetch_list(source: &ProxySource) -> Result<Vec<String>, ProxyError> {
    match source {
        ProxySource::Inline(list) => Ok(dedup(list.clone())),
        ProxySource::File(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ProxyError::Load(format!("{}: {}", path.display(), e)))?;
            Ok(parse_list(&text))
        }
        ProxySource::Url(url) => {
            let client = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
            let resp = client.get(url).send().await?.error_for_status()?;
            let text = resp.text().await?;
            Ok(parse_list(&text))
        }
    }
}

fn dedup(list: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    list.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(addrs: &[&str]) -> ProxyPool {
        ProxyPool::new(addrs.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn unmeasured_candidates_in_list_order() {
        let pool = pool(&["a:1", "b:2", "c:3"]);
        assert_eq!(pool.fastest().await.as_deref(), Some("a:1"));
        pool.block("a:1");
        assert_eq!(pool.fastest().await.as_deref(), Some("b:2"));
    }

    #[tokio::test]
    async fn measured_speed_wins() {
        let pool = pool(&["a:1", "b:2", "c:3"]);
        pool.record_speed("b:2", 100);
        pool.record_speed("c:3", 900);
        assert_eq!(pool.fastest().await.as_deref(), Some("c:3"));
        pool.block("c:3");
        assert_eq!(pool.fastest().await.as_deref(), Some("b:2"));
    }

    #[tokio::test]
    async fn inline_pool_runs_dry() {
        let pool = pool(&["a:1", "b:2"]);
        pool.block("a:1");
        pool.block("b:2");
        assert!(pool.fastest().await.is_none());
        assert!(pool.is_blocked("a:1"));
    }

    #[test]
    fn repeated_timeouts_block_a_proxy() {
        let pool = pool(&["a:1", "b:2"]);
        assert!(!pool.record_timeout("a:1"));
        pool.record_speed("a:1", 500);
        assert!(!pool.record_timeout("a:1"));
        assert!(pool.record_timeout("a:1"));
        assert!(pool.is_blocked("a:1"));
        assert!(!pool.is_blocked("b:2"));
    }

    #[tokio::test]
    async fn file_pool_refreshes_when_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "# list\na:1\n\nb:2\n").unwrap();

        let pool = ProxyPool::load(ProxySource::File(path.clone())).await.unwrap();
        assert_eq!(pool.len(), 2);
        pool.block("a:1");
        pool.block("b:2");

        std::fs::write(&path, "b:2\nc:3\n").unwrap();
        let next = pool.fastest().await;
        assert_eq!(next.as_deref(), Some("b:2"));
        assert!(pool.is_blocked("a:1"));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn list_parsing_skips_garbage() {
        let list = parse_list("1.2.3.4:8080\nnot-a-proxy\nhost:0\nhost:99999\n1.2.3.4:8080\n[::1]:3128\n");
        assert_eq!(list, vec!["1.2.3.4:8080".to_string(), "[::1]:3128".to_string()]);
    }

    #[test]
    fn slow_proxy_threshold() {
        // Fair share is 1000 B/s per slot, the threshold half of that.
        let cap = 4000;
        assert!(is_slow_proxy(400, Duration::from_secs(1), cap, 4));
        assert!(!is_slow_proxy(600, Duration::from_secs(1), cap, 4));
        assert!(!is_slow_proxy(400, Duration::from_secs(1), 0, 4));
        assert_eq!(chunk_speed(1000, Duration::from_millis(500)), 2000);
    }

    #[test]
    fn fixed_proxy_settings() {
        let s = parse_settings("proxy.local:3128", Some("me".into()), Some("pw".into())).unwrap();
        assert_eq!(s.host, "proxy.local");
        assert_eq!(s.port, 3128);
        assert!(s.has_credentials());
        assert!(parse_settings("proxy.local", None, None).is_err());
    }
}
