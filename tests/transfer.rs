use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use chunkdl::assembler::assemble;
use chunkdl::utils::chunk_path;
use chunkdl::{
    ProxySource, StaticUrl, Supervisor, Throttle, TransferConfig, TransferCoordinator, TransferError, TransferEvent,
    TransferOutcome, UrlProvider,
};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const CHUNK: u64 = 1000;

/// One request as the stub saw it.
#[derive(Debug, Clone)]
struct Seen {
    /// Arrived in absolute form, i.e. through the stub acting as a proxy.
    proxied: bool,
    query: Option<String>,
    range: Option<(usize, usize)>,
}

type Policy = Arc<dyn Fn(&Seen) -> Option<StatusCode> + Send + Sync>;

/// How long to hold back the second half of a range body.
type Stall = Arc<dyn Fn(&Seen) -> Option<Duration> + Send + Sync>;

struct Stub {
    content: Arc<Vec<u8>>,
    policy: Policy,
    stall: Stall,
    seen: Mutex<Vec<Seen>>,
}

impl Stub {
    fn requests(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

async fn handle(State(stub): State<Arc<Stub>>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    let total = stub.content.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, total));
    let seen = Seen { proxied: uri.scheme().is_some(), query: uri.query().map(str::to_string), range };
    if method == Method::GET {
        stub.seen.lock().unwrap().push(seen.clone());
    }

    if let Some(status) = (stub.policy)(&seen) {
        return status.into_response();
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    match range {
        Some((start, end)) => {
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total)).unwrap(),
            );
            let slice = Bytes::copy_from_slice(&stub.content[start..=end]);
            let body = split_body(slice, (stub.stall)(&seen));
            (StatusCode::PARTIAL_CONTENT, response_headers, body).into_response()
        }
        None => {
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
            (StatusCode::OK, response_headers, Bytes::copy_from_slice(&stub.content)).into_response()
        }
    }
}

/// Sends the body in two frames with `stall` in between.
fn split_body(slice: Bytes, stall: Option<Duration>) -> Body {
    let Some(stall) = stall else {
        return Body::from(slice);
    };
    let mid = slice.len() / 2;
    let parts = vec![slice.slice(..mid), slice.slice(mid..)];
    let frames = futures::stream::iter(parts.into_iter().enumerate()).then(move |(i, part)| async move {
        if i > 0 {
            tokio::time::sleep(stall).await;
        }
        Ok::<_, std::io::Error>(part)
    });
    Body::from_stream(frames)
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    (start <= end && end < total).then_some((start, end))
}

async fn spawn_stub(content: Vec<u8>, policy: Policy) -> (Arc<Stub>, SocketAddr) {
    spawn_stalling_stub(content, policy, Arc::new(|_| None)).await
}

async fn spawn_stalling_stub(content: Vec<u8>, policy: Policy, stall: Stall) -> (Arc<Stub>, SocketAddr) {
    let stub = Arc::new(Stub { content: Arc::new(content), policy, stall, seen: Mutex::new(Vec::new()) });
    let app = Router::new().fallback(handle).with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (stub, addr)
}

fn serve_all() -> Policy {
    Arc::new(|_| None)
}

/// 509 for the first `n` direct requests, everything else is served.
fn rate_limit_direct(n: usize) -> Policy {
    let hits = Arc::new(AtomicUsize::new(0));
    Arc::new(move |seen| {
        let limited = !seen.proxied && hits.fetch_add(1, Ordering::SeqCst) < n;
        limited.then(|| StatusCode::from_u16(509).unwrap())
    })
}

fn stall_proxied(by: Duration) -> Stall {
    Arc::new(move |seen| seen.proxied.then_some(by))
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn config(dir: &TempDir, size: u64, slots: usize) -> TransferConfig {
    TransferConfig {
        download_path: dir.path().to_path_buf(),
        file_name: "file.bin".into(),
        file_size: size,
        chunk_size: CHUNK,
        slots,
        timeout: Duration::from_secs(5),
        backoff_unit: Duration::from_millis(1),
        ..Default::default()
    }
}

fn url(addr: SocketAddr) -> String {
    format!("http://{}/file.bin", addr)
}

async fn coordinator(config: TransferConfig, provider: Arc<dyn UrlProvider>) -> (TransferCoordinator, Arc<Supervisor>) {
    let supervisor = Arc::new(Supervisor::new(Throttle::new(config.speed_cap)));
    let coordinator = TransferCoordinator::new(config, provider, supervisor.clone()).await.unwrap();
    (coordinator, supervisor)
}

/// Runs the transfer and the assembler side by side.
async fn run_to_end(coordinator: &TransferCoordinator, output: &Path) -> (Result<String, TransferError>, TransferOutcome) {
    coordinator.start();
    let joined = async {
        tokio::join!(assemble(coordinator.transfer(), output, false), coordinator.wait())
    };
    let (assembled, outcome) = tokio::time::timeout(Duration::from_secs(30), joined).await.expect("transfer hung");
    (assembled.map(|a| a.sha256), outcome)
}

fn leftover_tmp_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".tmp"))
        .collect()
}

fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn wait_for(events: &mut tokio::sync::mpsc::UnboundedReceiver<TransferEvent>, wanted: TransferEvent) {
    let found = async {
        while let Some(event) = events.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("event channel closed before {:?}", wanted);
    };
    tokio::time::timeout(Duration::from_secs(10), found).await.expect("event never arrived");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downloads_every_chunk_and_assembles() {
    let data = content(4500);
    let (stub, addr) = spawn_stub(data.clone(), serve_all()).await;
    let dir = tempfile::tempdir().unwrap();

    let (coordinator, _) = coordinator(config(&dir, data.len() as u64, 2), Arc::new(StaticUrl(url(addr)))).await;
    let output = dir.path().join("file.bin");
    let (sha, outcome) = run_to_end(&coordinator, &output).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    assert_eq!(coordinator.progress(), data.len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), data);
    assert!(leftover_tmp_files(dir.path()).is_empty());
    assert!(!chunk_path(dir.path(), "file.bin", 0).exists());

    let mut ranges: Vec<_> = stub.requests().into_iter().filter_map(|s| s.range).collect();
    ranges.sort();
    assert_eq!(ranges, vec![(0, 999), (1000, 1999), (2000, 2999), (3000, 3999), (4000, 4499)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complete_chunk_on_disk_is_not_fetched_again() {
    let data = content(3000);
    let (stub, addr) = spawn_stub(data.clone(), serve_all()).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(chunk_path(dir.path(), "file.bin", 1), &data[1000..2000]).unwrap();
    // A truncated leftover is downloaded again.
    std::fs::write(chunk_path(dir.path(), "file.bin", 2), &data[2000..2100]).unwrap();

    let (coordinator, _) = coordinator(config(&dir, data.len() as u64, 1), Arc::new(StaticUrl(url(addr)))).await;
    let output = dir.path().join("file.bin");
    let (sha, outcome) = run_to_end(&coordinator, &output).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    assert_eq!(coordinator.progress(), 3000);
    let ranges: Vec<_> = stub.requests().into_iter().filter_map(|s| s.range).collect();
    assert!(!ranges.contains(&(1000, 1999)));
    assert!(ranges.contains(&(2000, 2999)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_errors_are_retried() {
    let data = content(2000);
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let policy: Policy = Arc::new(move |_| {
        (counter.fetch_add(1, Ordering::SeqCst) < 2).then_some(StatusCode::SERVICE_UNAVAILABLE)
    });
    let (_stub, addr) = spawn_stub(data.clone(), policy).await;
    let dir = tempfile::tempdir().unwrap();

    let (coordinator, _) = coordinator(config(&dir, data.len() as u64, 1), Arc::new(StaticUrl(url(addr)))).await;
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    assert!(failures.load(Ordering::SeqCst) >= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limit_switches_to_smart_proxy() {
    let data = content(3000);
    let direct_hits = Arc::new(AtomicUsize::new(0));
    let hits = direct_hits.clone();
    let policy: Policy = Arc::new(move |seen| {
        if !seen.proxied && hits.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(StatusCode::from_u16(509).unwrap())
        } else {
            None
        }
    });
    let (stub, addr) = spawn_stub(data.clone(), policy).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&dir, data.len() as u64, 1);
    config.smart_proxy = true;
    config.proxy_source = Some(ProxySource::Inline(vec![addr.to_string()]));
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    let requests = stub.requests();
    assert!(!requests[0].proxied);
    assert!(requests[1].proxied, "retry after 509 should go through the proxy");
    assert_eq!(requests[1].range, Some((0, 999)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limited_proxy_is_blocked() {
    let data = content(2000);
    let direct_hits = Arc::new(AtomicUsize::new(0));
    let hits = direct_hits.clone();
    let policy: Policy = Arc::new(move |seen| {
        let limited = seen.proxied || hits.fetch_add(1, Ordering::SeqCst) == 0;
        limited.then(|| StatusCode::from_u16(509).unwrap())
    });
    let (stub, addr) = spawn_stub(data.clone(), policy).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&dir, data.len() as u64, 1);
    config.smart_proxy = true;
    config.proxy_source = Some(ProxySource::Inline(vec![addr.to_string()]));
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    let pool = coordinator.proxy_pool().unwrap();
    assert!(pool.is_blocked(&addr.to_string()));
    assert_eq!(stub.requests().iter().filter(|s| s.proxied).count(), 1);
}

/// Hands out `?sig=<n>` links, counting how often it was asked.
struct SignedUrls {
    base: String,
    calls: AtomicUsize,
}

#[async_trait]
impl UrlProvider for SignedUrls {
    async fn download_url(&self) -> Result<String, TransferError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}?sig={}", self.base, n))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_url_is_refreshed() {
    let data = content(2000);
    let policy: Policy = Arc::new(|seen| (seen.query.as_deref() == Some("sig=1")).then_some(StatusCode::FORBIDDEN));
    let (stub, addr) = spawn_stub(data.clone(), policy).await;
    let dir = tempfile::tempdir().unwrap();

    let provider = Arc::new(SignedUrls { base: url(addr), calls: AtomicUsize::new(0) });
    let (coordinator, _) = coordinator(config(&dir, data.len() as u64, 1), provider.clone()).await;
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    assert!(stub.requests().iter().skip(1).all(|s| s.query.as_deref() == Some("sig=2")));
}

struct BrokenProvider;

#[async_trait]
impl UrlProvider for BrokenProvider {
    async fn download_url(&self) -> Result<String, TransferError> {
        Err(TransferError::InvalidUrl("gone".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn url_failure_stops_the_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _) = coordinator(config(&dir, 4000, 2), Arc::new(BrokenProvider)).await;
    let (assembled, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    match outcome {
        TransferOutcome::Stopped(reason) => assert!(reason.contains("download url"), "{}", reason),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(matches!(assembled, Err(TransferError::Stopped(_))));
    assert!(coordinator.is_stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_parks_workers_until_resume() {
    let data = content(4000);
    let (_stub, addr) = spawn_stub(data.clone(), serve_all()).await;
    let dir = tempfile::tempdir().unwrap();

    let (coordinator, supervisor) = coordinator(config(&dir, data.len() as u64, 2), Arc::new(StaticUrl(url(addr)))).await;
    let mut events = coordinator.subscribe();
    supervisor.pause_all();
    coordinator.start();

    wait_for(&mut events, TransferEvent::Paused).await;
    assert!(coordinator.is_paused());
    assert!(coordinator.progress() < data.len() as u64);

    supervisor.resume_all();
    coordinator.resume();
    assert!(!coordinator.is_paused());

    let output = dir.path().join("file.bin");
    let joined = async { tokio::join!(assemble(coordinator.transfer(), &output, false), coordinator.wait()) };
    let (assembled, outcome) = tokio::time::timeout(Duration::from_secs(30), joined).await.unwrap();
    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(assembled.unwrap().sha256, sha256_hex(&data));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_leaves_resumable_state() {
    let data = content(4000);
    let (_stub, addr) = spawn_stub(data.clone(), serve_all()).await;
    let dir = tempfile::tempdir().unwrap();

    let (coordinator, supervisor) = coordinator(config(&dir, data.len() as u64, 2), Arc::new(StaticUrl(url(addr)))).await;
    let mut events = coordinator.subscribe();
    supervisor.pause_all();
    coordinator.start();
    wait_for(&mut events, TransferEvent::Paused).await;

    coordinator.stop(Some("user request".into()));
    let outcome = tokio::time::timeout(Duration::from_secs(10), coordinator.wait()).await.unwrap();

    assert_eq!(outcome, TransferOutcome::Stopped("user request".into()));
    assert_eq!(coordinator.slot_count(), 0);
    assert!(leftover_tmp_files(dir.path()).is_empty());
    let output = dir.path().join("file.bin");
    assert!(matches!(assemble(coordinator.transfer(), &output, false).await, Err(TransferError::Stopped(_))));
    assert!(!output.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn head_request_reports_size_and_range_support() {
    let data = content(1234);
    let (_stub, addr) = spawn_stub(data, serve_all()).await;
    let client = reqwest::Client::new();

    let info = chunkdl::providers::probe(&client, &url(addr)).await.unwrap();
    assert_eq!(info.size, 1234);
    assert!(info.accepts_ranges);
    assert_eq!(info.url, url(addr));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn speed_cap_slows_but_does_not_time_out() {
    let data = content(3000);
    let (stub, addr) = spawn_stub(data.clone(), serve_all()).await;
    let dir = tempfile::tempdir().unwrap();

    // Admitting a chunk at 400 B/s takes longer than the read timeout.
    let mut config = config(&dir, data.len() as u64, 1);
    config.speed_cap = Some(400);
    config.timeout = Duration::from_secs(1);
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let started = std::time::Instant::now();
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    assert!(started.elapsed() >= Duration::from_secs(5));
    let ranges: Vec<_> = stub.requests().into_iter().filter_map(|s| s.range).collect();
    assert_eq!(ranges, vec![(0, 999), (1000, 1999), (2000, 2999)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_proxy_is_swapped_on_the_next_chunk() {
    let data = content(3000);
    let (slow, slow_addr) =
        spawn_stalling_stub(data.clone(), rate_limit_direct(1), stall_proxied(Duration::from_millis(300))).await;
    let (fast, fast_addr) = spawn_stub(data.clone(), serve_all()).await;
    let dir = tempfile::tempdir().unwrap();

    // With one slot the fair share is the whole cap; 1000 bytes in 300ms is far below half of it.
    let mut config = config(&dir, data.len() as u64, 1);
    config.smart_proxy = true;
    config.speed_cap = Some(1_000_000);
    config.proxy_source = Some(ProxySource::Inline(vec![slow_addr.to_string(), fast_addr.to_string()]));
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(slow_addr)))).await;
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    let pool = coordinator.proxy_pool().unwrap();
    assert!(pool.is_blocked(&slow_addr.to_string()));

    let through_slow: Vec<_> = slow.requests().into_iter().filter(|s| s.proxied).filter_map(|s| s.range).collect();
    assert_eq!(through_slow, vec![(0, 999)]);
    let through_fast: Vec<_> = fast.requests().into_iter().filter(|s| s.proxied).filter_map(|s| s.range).collect();
    assert_eq!(through_fast.first(), Some(&(1000, 1999)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_timing_out_twice_is_blocked() {
    let data = content(2000);
    let (stub, addr) =
        spawn_stalling_stub(data.clone(), rate_limit_direct(2), stall_proxied(Duration::from_secs(2))).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&dir, data.len() as u64, 1);
    config.smart_proxy = true;
    config.timeout = Duration::from_millis(300);
    config.proxy_source = Some(ProxySource::Inline(vec![addr.to_string()]));
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    assert!(coordinator.proxy_pool().unwrap().is_blocked(&addr.to_string()));
    assert_eq!(stub.requests().iter().filter(|s| s.proxied).count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeouts_retry_without_backoff() {
    let data = content(2000);
    let stalls = Arc::new(AtomicUsize::new(0));
    let counter = stalls.clone();
    let stall: Stall =
        Arc::new(move |_| (counter.fetch_add(1, Ordering::SeqCst) == 0).then_some(Duration::from_secs(1)));
    let (stub, addr) = spawn_stalling_stub(data.clone(), serve_all(), stall).await;
    let dir = tempfile::tempdir().unwrap();

    // A backoff at this unit would outlast the run.
    let mut config = config(&dir, data.len() as u64, 1);
    config.timeout = Duration::from_millis(300);
    config.backoff_unit = Duration::from_secs(60);
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let mut events = coordinator.subscribe();
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    let first_chunk = stub.requests().iter().filter(|s| s.range == Some((0, 999))).count();
    assert_eq!(first_chunk, 2);
    assert!(!drain(&mut events).iter().any(|e| matches!(e, TransferEvent::ErrorWait { waiting: true, .. })));
    assert_eq!(coordinator.progress(), data.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backoff_is_announced_with_error_wait() {
    let data = content(2000);
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let policy: Policy =
        Arc::new(move |_| (counter.fetch_add(1, Ordering::SeqCst) == 0).then_some(StatusCode::SERVICE_UNAVAILABLE));
    let (_stub, addr) = spawn_stub(data.clone(), policy).await;
    let dir = tempfile::tempdir().unwrap();

    let (coordinator, _) = coordinator(config(&dir, data.len() as u64, 1), Arc::new(StaticUrl(url(addr)))).await;
    let mut events = coordinator.subscribe();
    let (_, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;
    assert_eq!(outcome, TransferOutcome::Completed);

    let events = drain(&mut events);
    let waits: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::ErrorWait { slot, waiting } => Some((*slot, *waiting)),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![(1, true), (1, false)]);
    let waited = events.iter().position(|e| *e == TransferEvent::ErrorWait { slot: 1, waiting: false }).unwrap();
    let committed = events.iter().position(|e| matches!(e, TransferEvent::ChunkCommitted { .. })).unwrap();
    assert!(waited < committed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_inside_a_chunk_resumes_where_it_left_off() {
    let data = content(2000);
    let (stub, addr) =
        spawn_stalling_stub(data.clone(), rate_limit_direct(1), stall_proxied(Duration::from_millis(50))).await;
    let dir = tempfile::tempdir().unwrap();

    // Fair share is 10000 B/s. Counting the pause, the proxied chunk would come in under 1000 B/s.
    let mut config = config(&dir, data.len() as u64, 1);
    config.smart_proxy = true;
    config.speed_cap = Some(10_000);
    config.proxy_source = Some(ProxySource::Inline(vec![addr.to_string()]));
    let (coordinator, supervisor) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let mut events = coordinator.subscribe();
    supervisor.pause_all();
    coordinator.start();

    wait_for(&mut events, TransferEvent::Paused).await;
    let parked_at = coordinator.progress();
    assert!(parked_at > 0 && parked_at < CHUNK, "parked at {}", parked_at);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(coordinator.progress(), parked_at);

    supervisor.resume_all();
    coordinator.resume();
    let output = dir.path().join("file.bin");
    let joined = async { tokio::join!(assemble(coordinator.transfer(), &output, false), coordinator.wait()) };
    let (assembled, outcome) = tokio::time::timeout(Duration::from_secs(30), joined).await.unwrap();

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(assembled.unwrap().sha256, sha256_hex(&data));
    let proxied: Vec<_> = stub.requests().into_iter().filter(|s| s.proxied).filter_map(|s| s.range).collect();
    assert_eq!(proxied, vec![(0, 999)]);
    assert!(!coordinator.proxy_pool().unwrap().is_blocked(&addr.to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slots_are_counted_across_transfers() {
    let data = content(4000);
    let (_stub, addr) = spawn_stub(data.clone(), serve_all()).await;
    let supervisor = Arc::new(Supervisor::new(Throttle::new(Some(1_000_000))));
    let (first_dir, second_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let first = TransferCoordinator::new(
        config(&first_dir, data.len() as u64, 2),
        Arc::new(StaticUrl(url(addr))),
        supervisor.clone(),
    )
    .await
    .unwrap();
    let second = TransferCoordinator::new(
        config(&second_dir, data.len() as u64, 1),
        Arc::new(StaticUrl(url(addr))),
        supervisor.clone(),
    )
    .await
    .unwrap();
    let (mut first_events, mut second_events) = (first.subscribe(), second.subscribe());

    supervisor.pause_all();
    first.start();
    second.start();
    wait_for(&mut first_events, TransferEvent::Paused).await;
    wait_for(&mut second_events, TransferEvent::Paused).await;
    assert_eq!(supervisor.live_slots(), 3);

    first.stop(None);
    tokio::time::timeout(Duration::from_secs(10), first.wait()).await.unwrap();
    assert_eq!(supervisor.live_slots(), 1);
    second.stop(None);
    tokio::time::timeout(Duration::from_secs(10), second.wait()).await.unwrap();
    assert_eq!(supervisor.live_slots(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn turbo_adds_slots_once_proxied() {
    let data = content(6000);
    let (_stub, addr) =
        spawn_stalling_stub(data.clone(), rate_limit_direct(1), stall_proxied(Duration::from_millis(100))).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&dir, data.len() as u64, 1);
    config.smart_proxy = true;
    config.proxy_turbo_slots = 3;
    config.proxy_source = Some(ProxySource::Inline(vec![addr.to_string()]));
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let mut events = coordinator.subscribe();
    let (sha, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(sha.unwrap(), sha256_hex(&data));
    let most = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            TransferEvent::SlotsChanged(n) => Some(*n),
            _ => None,
        })
        .max();
    assert_eq!(most, Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn turbo_stays_off_without_a_proxy() {
    let data = content(3000);
    let (_stub, addr) = spawn_stub(data.clone(), serve_all()).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&dir, data.len() as u64, 1);
    config.smart_proxy = true;
    config.proxy_turbo_slots = 3;
    config.proxy_source = Some(ProxySource::Inline(vec![addr.to_string()]));
    let (coordinator, _) = coordinator(config, Arc::new(StaticUrl(url(addr)))).await;
    let mut events = coordinator.subscribe();
    let (_, outcome) = run_to_end(&coordinator, &dir.path().join("file.bin")).await;

    assert_eq!(outcome, TransferOutcome::Completed);
    assert!(!drain(&mut events).iter().any(|e| matches!(e, TransferEvent::SlotsChanged(n) if *n > 1)));
}
