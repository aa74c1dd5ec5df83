//! The per-slot download loop.
//!
//! Each iteration claims a chunk, picks a route (direct, fixed proxy or smart
//! proxy), streams the range into `<chunk>.tmp` and promotes it on success.
//! Failures roll back their progress, hand the index back to the allocator
//! and, depending on what went wrong, back off before the next attempt.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{header, Client, StatusCode};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::chunk::{self, ChunkRequest};
use crate::config::MAX_BACKOFF_SECS;
use crate::coordinator::{smart_proxy_client, Transfer, TransferEvent};
use crate::error::ChunkError;
use crate::proxy;
use crate::sync::SecureNotify;
use crate::throttle::ThrottledStream;
use crate::utils::{chunk_path, chunk_tmp_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    Connecting = 1,
    Transferring = 2,
    Paused = 3,
    Committed = 4,
    Rejected = 5,
    Stopped = 6,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerState::Connecting,
            2 => WorkerState::Transferring,
            3 => WorkerState::Paused,
            4 => WorkerState::Committed,
            5 => WorkerState::Rejected,
            6 => WorkerState::Stopped,
            _ => WorkerState::Running,
        }
    }
}

/// The handle the coordinator keeps for each slot.
#[derive(Debug)]
pub struct SlotControl {
    pub id: usize,
    exit: CancellationToken,
    pub(crate) wake: SecureNotify,
    error_wait: AtomicBool,
    state: AtomicU8,
}

impl SlotControl {
    pub(crate) fn new(id: usize, exit: CancellationToken) -> Self {
        Self {
            id,
            exit,
            wake: SecureNotify::new(),
            error_wait: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Running as u8),
        }
    }

    /// Asks the worker to leave at its next observation point.
    pub fn exit(&self) {
        self.exit.cancel();
        self.wake.secure_notify();
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.is_cancelled()
    }

    pub fn is_error_wait(&self) -> bool {
        self.error_wait.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Where a chunk request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    UserProxy,
    Smart(String),
}

/// Connection decision taken before each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePlan {
    UserProxy,
    /// Drop the current smart proxy (if any) and ask the pool for another.
    SwapSmartProxy,
    Direct,
}

pub fn plan_route(user_proxy: bool, smart_proxy: bool, rate_limited: bool, slow_proxy: bool) -> RoutePlan {
    if (rate_limited || slow_proxy) && smart_proxy && !user_proxy {
        RoutePlan::SwapSmartProxy
    } else if user_proxy {
        RoutePlan::UserProxy
    } else {
        RoutePlan::Direct
    }
}

/// Backoff in seconds before attempt `attempt` (1-based): 2, 4, 8, ... capped.
pub fn exp_backoff(attempt: u32) -> u64 {
    2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS)
}

/// Whether a failed attempt sleeps before the next one. Timeouts retry at
/// once; rate limits in smart mode and expired URLs have their own remedy.
pub fn should_back_off(error: &ChunkError, stopping: bool, smart_proxy: bool) -> bool {
    if stopping || error.is_timeout() {
        return false;
    }
    match error {
        ChunkError::RateLimited(_) => !smart_proxy,
        ChunkError::AuthExpired(_) => false,
        _ => true,
    }
}

/// Timing of a successful transfer, for the proxy benchmark.
#[derive(Debug, Clone, Copy)]
struct ChunkTiming {
    elapsed: Duration,
    paused: Duration,
}

impl ChunkTiming {
    fn active(&self) -> Duration {
        self.elapsed.saturating_sub(self.paused)
    }
}

pub struct ChunkWorker {
    transfer: Arc<Transfer>,
    control: Arc<SlotControl>,
    worker_url: Option<String>,
    smart_proxy: Option<(String, Client)>,
    route: Route,
    last_status: Option<u16>,
    slow_proxy: bool,
    /// The pool had nothing to offer on the last swap.
    no_proxy_left: bool,
    error_count: u32,
    chunk_reads: u64,
}

impl ChunkWorker {
    pub fn new(transfer: Arc<Transfer>, control: Arc<SlotControl>) -> Self {
        Self {
            transfer,
            control,
            worker_url: None,
            smart_proxy: None,
            route: Route::Direct,
            last_status: None,
            slow_proxy: false,
            no_proxy_left: false,
            error_count: 0,
            chunk_reads: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.control.id
    }

    /// Runs until the transfer stops, the slot is told to exit or the chunks
    /// run out. `Fatal` errors are for the coordinator to act on.
    pub async fn run(mut self) -> Result<(), ChunkError> {
        info!(slot = self.id(), "worker starting");
        let result = match self.work().await {
            Err(ChunkError::NoMoreChunks) => Ok(()),
            other => other,
        };
        if let Err(e) = &result {
            match e {
                ChunkError::Fatal(msg) => warn!(slot = self.id(), "worker failed: {}", msg),
                _ => debug!(slot = self.id(), "worker giving up: {}", e),
            }
        }
        self.set_state(WorkerState::Stopped);
        info!(slot = self.id(), "worker done");
        result
    }

    fn stopping(&self) -> bool {
        self.control.is_exiting() || self.transfer.is_stopped()
    }

    fn smart_mode(&self) -> bool {
        self.transfer.config.smart_proxy && self.transfer.config.proxy.is_none()
    }

    fn set_state(&self, state: WorkerState) {
        let prev = self.control.state.swap(state as u8, Ordering::SeqCst);
        if prev != state as u8 {
            trace!(slot = self.id(), from = ?WorkerState::from_u8(prev), to = ?state, "worker state");
        }
    }

    async fn work(&mut self) -> Result<(), ChunkError> {
        while !self.stopping() {
            self.set_state(WorkerState::Running);

            if self.worker_url.is_none() || self.last_status == Some(crate::config::HTTP_URL_EXPIRED) {
                let url = self
                    .transfer
                    .url_provider
                    .download_url()
                    .await
                    .map_err(|e| ChunkError::Fatal(format!("could not get a download url: {e}")))?;
                self.worker_url = Some(url);
                // Refresh once per expiry, not on every later 403.
                self.last_status = None;
            }

            let index = self.transfer.allocator.next_chunk_id()?;
            let (offset, size) = self.transfer.layout.locate(index)?;

            if self.recover_existing(index, size).await {
                continue;
            }

            let base = self.worker_url.clone().unwrap_or_default();
            let request = chunk::request(&base, self.transfer.layout.file_size, offset, size)?;
            let client = self.connect().await;

            self.chunk_reads = 0;
            self.slow_proxy = false;
            debug!(slot = self.id(), chunk = index, route = ?self.route, "downloading chunk");

            match self.download(&client, &request, index, offset, size).await {
                Ok(timing) => self.commit(index, size, timing).await,
                Err(e) => self.reject(index, e).await,
            }
        }
        Ok(())
    }

    /// Counts an already complete chunk file without touching the network.
    async fn recover_existing(&mut self, index: u64, size: u64) -> bool {
        let config = &self.transfer.config;
        let path = chunk_path(&config.download_path, &config.file_name, index);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() == size => {
                info!(slot = self.id(), chunk = index, "recovered previous chunk");
                self.transfer.add_progress(size as i64);
                self.transfer.chunk_committed(index, size);
                self.set_state(WorkerState::Committed);
                true
            }
            _ => false,
        }
    }

    /// Picks the client for the next request and records the route taken.
    async fn connect(&mut self) -> Client {
        self.set_state(WorkerState::Connecting);
        let plan = plan_route(
            self.transfer.config.proxy.is_some(),
            self.transfer.config.smart_proxy,
            self.last_status == Some(crate::config::HTTP_RATE_LIMITED),
            self.slow_proxy,
        );

        let client = match plan {
            RoutePlan::SwapSmartProxy => self.swap_smart_proxy().await,
            RoutePlan::UserProxy => {
                self.drop_smart_proxy();
                self.route = Route::UserProxy;
                self.transfer
                    .user_proxy_client
                    .clone()
                    .unwrap_or_else(|| self.transfer.direct_client.clone())
            }
            RoutePlan::Direct => {
                self.drop_smart_proxy();
                self.route = Route::Direct;
                self.transfer.direct_client.clone()
            }
        };

        if self.transfer.is_error509() {
            self.transfer.set_error509(false);
        }
        client
    }

    async fn swap_smart_proxy(&mut self) -> Client {
        let Some(pool) = self.transfer.proxy_pool.clone() else {
            self.no_proxy_left = true;
            self.route = Route::Direct;
            return self.transfer.direct_client.clone();
        };
        if let Some((previous, _)) = self.smart_proxy.take() {
            pool.block(&previous);
        }

        while let Some(address) = pool.fastest().await {
            match smart_proxy_client(&self.transfer.config, &address) {
                Ok(client) => {
                    debug!(slot = self.id(), proxy = %address, "using smart proxy");
                    self.smart_proxy = Some((address.clone(), client.clone()));
                    self.no_proxy_left = false;
                    self.route = Route::Smart(address);
                    self.transfer.emit(TransferEvent::SmartProxy { slot: self.id(), active: true });
                    self.transfer.request_turbo();
                    return client;
                }
                Err(e) => {
                    warn!(proxy = %address, "unusable smart proxy: {}", e);
                    pool.block(&address);
                }
            }
        }

        self.no_proxy_left = true;
        self.route = Route::Direct;
        self.transfer.emit(TransferEvent::SmartProxy { slot: self.id(), active: false });
        self.transfer.direct_client.clone()
    }

    fn drop_smart_proxy(&mut self) {
        if self.smart_proxy.take().is_some() {
            self.transfer.emit(TransferEvent::SmartProxy { slot: self.id(), active: false });
        }
    }

    async fn download(
        &mut self,
        client: &Client,
        request: &ChunkRequest,
        index: u64,
        offset: u64,
        size: u64,
    ) -> Result<ChunkTiming, ChunkError> {
        if self.stopping() {
            return Err(ChunkError::Transient("worker stopping".into()));
        }
        let timeout = self.transfer.config.timeout;
        let exit = self.control.exit.clone();

        let send = client.get(&request.url).header(header::RANGE, &request.range).send();
        let response = tokio::select! {
            _ = exit.cancelled() => return Err(ChunkError::Transient("worker stopping".into())),
            r = tokio::time::timeout(timeout, send) => {
                r.map_err(|_| ChunkError::Timeout("waiting for response headers"))??
            }
        };

        let status = response.status();
        // A plain 200 only lines up with our buffer when the range starts at 0.
        let usable = status == StatusCode::PARTIAL_CONTENT || (status == StatusCode::OK && offset == 0);
        if !usable {
            info!(slot = self.id(), chunk = index, status = status.as_u16(), "chunk request failed");
            let err = if status == StatusCode::OK {
                ChunkError::Transient("server ignored the range request".into())
            } else {
                ChunkError::from_status(status.as_u16())
            };
            if matches!(err, ChunkError::RateLimited(_)) && self.smart_mode() {
                self.transfer.set_error509(true);
            }
            return Err(err);
        }

        let config = &self.transfer.config;
        let tmp = chunk_tmp_path(&config.download_path, &config.file_name, index);
        let mut file = File::create(&tmp).await?;
        let mut stream = ThrottledStream::new(response.bytes_stream(), self.transfer.supervisor.throttle.clone());

        self.set_state(WorkerState::Transferring);
        let started = Instant::now();
        let mut paused = Duration::ZERO;

        while !self.stopping() && self.chunk_reads < size {
            // Only the network read is timed; waiting on the cap is not a stall.
            let next = tokio::select! {
                _ = exit.cancelled() => break,
                r = tokio::time::timeout(timeout, stream.fetch()) => {
                    r.map_err(|_| ChunkError::Timeout("reading the body"))?
                }
            };
            let Some(bytes) = next else { break };
            let bytes = bytes?;
            tokio::select! {
                _ = exit.cancelled() => break,
                _ = stream.admit(&bytes) => {}
            }
            let take = bytes.len().min((size - self.chunk_reads) as usize);
            file.write_all(&bytes[..take]).await?;
            self.chunk_reads += take as u64;
            self.transfer.add_network_bytes(take as u64);
            self.transfer.add_progress(take as i64);

            paused += self.pause_point().await;
        }
        file.flush().await?;
        drop(file);

        if self.chunk_reads != size {
            return Err(ChunkError::Transient(format!("short read: {} of {} bytes", self.chunk_reads, size)));
        }
        Ok(ChunkTiming { elapsed: started.elapsed(), paused })
    }

    /// Parks the worker while the transfer (or everything) is paused.
    /// Returns how long it was parked.
    async fn pause_point(&mut self) -> Duration {
        let transfer = self.transfer.clone();
        let must_pause = if transfer.is_paused() && !transfer.is_stopped() {
            true
        } else if !transfer.is_paused() && transfer.supervisor.is_paused_all() {
            transfer.pause();
            true
        } else {
            false
        };
        if !must_pause {
            return Duration::ZERO;
        }

        self.set_state(WorkerState::Paused);
        transfer.pause_worker();
        let parked = Instant::now();
        debug!(slot = self.id(), "worker paused");

        // A wake-up that does not clear the pause (a stale notify) parks again.
        while transfer.is_paused() && !self.stopping() {
            tokio::select! {
                _ = self.control.wake.secure_wait() => {}
                _ = self.control.exit.cancelled() => break,
            }
        }

        debug!(slot = self.id(), "worker resumed");
        self.set_state(WorkerState::Transferring);
        parked.elapsed()
    }

    async fn commit(&mut self, index: u64, size: u64, timing: ChunkTiming) {
        let config = &self.transfer.config;
        let tmp = chunk_tmp_path(&config.download_path, &config.file_name, index);
        let path = chunk_path(&config.download_path, &config.file_name, index);

        let promoted = async {
            if fs::try_exists(&path).await? {
                fs::remove_file(&path).await?;
            }
            fs::rename(&tmp, &path).await
        };
        if let Err(e) = promoted.await {
            self.reject(index, e.into()).await;
            return;
        }

        info!(slot = self.id(), chunk = index, "downloaded chunk");
        self.set_state(WorkerState::Committed);
        self.error_count = 0;
        self.last_status = None;
        self.transfer.chunk_committed(index, size);

        if let Route::Smart(address) = &self.route {
            let active = timing.active();
            let speed = proxy::chunk_speed(size, active);
            if let Some(pool) = &self.transfer.proxy_pool {
                pool.record_speed(address, speed);
            }
            let reference = self.transfer.reference_speed();
            if proxy::is_slow_proxy(size, active, reference, self.transfer.supervisor.live_slots()) {
                warn!(slot = self.id(), proxy = %address, speed, "proxy speed is slow");
                self.slow_proxy = true;
            }
        }
    }

    async fn reject(&mut self, index: u64, error: ChunkError) {
        self.set_state(WorkerState::Rejected);
        let stopping = self.stopping();
        if !stopping {
            info!(slot = self.id(), chunk = index, "failed downloading chunk: {}", error);
        }

        let config = &self.transfer.config;
        let tmp = chunk_tmp_path(&config.download_path, &config.file_name, index);
        if let Err(e) = fs::remove_file(&tmp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), "could not remove staging file: {}", e);
            }
        }

        if let (Route::Smart(address), true) = (&self.route, error.is_timeout()) {
            if let Some(pool) = &self.transfer.proxy_pool {
                pool.record_timeout(address);
            }
        }

        self.transfer.allocator.reject_chunk_id(index);
        if self.chunk_reads > 0 {
            self.transfer.add_progress(-(self.chunk_reads as i64));
            self.chunk_reads = 0;
        }
        self.last_status = error.http_status();

        // Without a proxy to switch to, a rate limit is waited out like any other error.
        if should_back_off(&error, stopping, self.smart_mode() && !self.no_proxy_left) {
            self.error_count += 1;
            let wait = self.transfer.config.backoff_unit * exp_backoff(self.error_count) as u32;
            self.set_error_wait(true);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.control.exit.cancelled() => {}
            }
            self.set_error_wait(false);
        }
    }

    fn set_error_wait(&self, waiting: bool) {
        self.control.error_wait.store(waiting, Ordering::SeqCst);
        self.transfer.emit(TransferEvent::ErrorWait { slot: self.id(), waiting });
    }
}
