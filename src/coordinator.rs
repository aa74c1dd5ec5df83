//! Owns the workers of one transfer and the state they share.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use reqwest::{Client, Proxy};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::ChunkAllocator;
use crate::chunk::ChunkLayout;
use crate::config::{ProxySettings, TransferConfig};
use crate::error::{ChunkError, ProxyError, TransferError};
use crate::providers::UrlProvider;
use crate::proxy::ProxyPool;
use crate::sync::SecureNotify;
use crate::throttle::Throttle;
use crate::worker::{ChunkWorker, SlotControl};

/// Process-wide state every transfer consults.
#[derive(Debug, Default)]
pub struct Supervisor {
    pub throttle: Throttle,
    paused_all: AtomicBool,
    /// Live worker slots across every transfer sharing this supervisor.
    live_slots: AtomicUsize,
}

impl Supervisor {
    pub fn new(throttle: Throttle) -> Self {
        Self { throttle, ..Default::default() }
    }

    /// Slots the global cap is shared between.
    pub fn live_slots(&self) -> usize {
        self.live_slots.load(Ordering::SeqCst)
    }

    fn slot_started(&self) {
        self.live_slots.fetch_add(1, Ordering::SeqCst);
    }

    fn slot_finished(&self) {
        let _ = self
            .live_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn pause_all(&self) {
        self.paused_all.store(true, Ordering::SeqCst);
    }

    pub fn resume_all(&self) {
        self.paused_all.store(false, Ordering::SeqCst);
    }

    pub fn is_paused_all(&self) -> bool {
        self.paused_all.load(Ordering::SeqCst)
    }
}

/// Signals for whatever renders the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { delta: i64, total: u64 },
    ErrorWait { slot: usize, waiting: bool },
    SmartProxy { slot: usize, active: bool },
    RateLimited(bool),
    ChunkCommitted { index: u64, size: u64 },
    SlotsChanged(usize),
    /// Every live worker is parked.
    Paused,
    Resumed,
    Finished,
    Stopped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Stopped(String),
    /// All workers are gone but bytes are missing.
    Incomplete { missing: u64 },
}

/// State shared by every worker of one transfer.
pub struct Transfer {
    pub config: TransferConfig,
    pub layout: ChunkLayout,
    pub allocator: ChunkAllocator,
    pub url_provider: Arc<dyn UrlProvider>,
    pub supervisor: Arc<Supervisor>,
    pub proxy_pool: Option<Arc<ProxyPool>>,
    pub(crate) direct_client: Client,
    pub(crate) user_proxy_client: Option<Client>,
    pub(crate) cancel: CancellationToken,
    progress: AtomicU64,
    network_bytes: AtomicU64,
    peak_speed: AtomicU64,
    started: Instant,
    stopped: AtomicBool,
    paused: AtomicBool,
    error509: AtomicBool,
    stop_reason: Mutex<Option<String>>,
    slots: Mutex<Vec<Arc<SlotControl>>>,
    slots_changed: Notify,
    paused_workers: AtomicUsize,
    chunk_done: SecureNotify,
    turbo: SecureNotify,
    turbo_requested: AtomicBool,
    events: Mutex<Option<UnboundedSender<TransferEvent>>>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("file_name", &self.config.file_name)
            .field("layout", &self.layout)
            .field("progress", &self.progress())
            .field("stopped", &self.is_stopped())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Transfer {
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_error509(&self) -> bool {
        self.error509.load(Ordering::SeqCst)
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn slot_count(&self) -> usize {
        self.lock_slots().len()
    }

    /// Adds (or, negative, removes) bytes from the shared progress counter.
    pub(crate) fn add_progress(&self, delta: i64) {
        let total = if delta >= 0 {
            self.progress.fetch_add(delta as u64, Ordering::SeqCst) + delta as u64
        } else {
            let amount = delta.unsigned_abs();
            self.progress.fetch_sub(amount, Ordering::SeqCst) - amount
        };
        self.emit(TransferEvent::Progress { delta, total });
    }

    pub(crate) fn add_network_bytes(&self, n: u64) {
        self.network_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Speed the slow-proxy check compares against: the global cap, or the
    /// best average this transfer has managed so far.
    pub fn reference_speed(&self) -> u64 {
        if let Some(cap) = self.supervisor.throttle.cap() {
            return cap as u64;
        }
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            let avg = (self.network_bytes.load(Ordering::Relaxed) as f64 / secs) as u64;
            self.peak_speed.fetch_max(avg, Ordering::Relaxed);
        }
        self.peak_speed.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(file = %self.config.file_name, "pausing transfer");
        }
    }

    /// Called by a worker right before it parks.
    pub(crate) fn pause_worker(&self) {
        let parked = self.paused_workers.fetch_add(1, Ordering::SeqCst) + 1;
        if parked >= self.slot_count() {
            self.emit(TransferEvent::Paused);
        }
    }

    pub(crate) fn set_error509(&self, on: bool) {
        if self.error509.swap(on, Ordering::SeqCst) != on {
            self.emit(TransferEvent::RateLimited(on));
        }
    }

    /// Called whenever a worker picks up a smart proxy; only the first call
    /// counts.
    pub(crate) fn request_turbo(&self) {
        if self.config.turbo_extra_slots() > 0 && !self.turbo_requested.swap(true, Ordering::SeqCst) {
            self.turbo.secure_notify();
        }
    }

    pub(crate) fn chunk_committed(&self, index: u64, size: u64) {
        self.emit(TransferEvent::ChunkCommitted { index, size });
        self.chunk_done.secure_notify();
    }

    /// Waits for the next chunk commit or worker exit.
    pub async fn wait_chunk_event(&self) {
        self.chunk_done.secure_wait().await;
    }

    /// Stops every worker. The first reason given wins.
    pub fn stop(&self, reason: Option<String>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.unwrap_or_else(|| "stopped by user".to_string());
        info!(file = %self.config.file_name, reason = %reason, "stopping transfer");
        *self.stop_reason.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason.clone());
        self.cancel.cancel();
        for slot in self.lock_slots().iter() {
            slot.wake.secure_notify();
        }
        self.chunk_done.secure_notify();
        self.emit(TransferEvent::Stopped(reason));
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(tx) = self.events.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn register_slot(&self, control: Arc<SlotControl>) -> usize {
        let count = {
            let mut slots = self.lock_slots();
            slots.push(control);
            self.supervisor.slot_started();
            slots.len()
        };
        self.emit(TransferEvent::SlotsChanged(count));
        count
    }

    fn deregister_slot(&self, id: usize) {
        let count = {
            let mut slots = self.lock_slots();
            slots.retain(|s| s.id != id);
            // Under the lock so waiters never see this transfer empty but still counted.
            self.supervisor.slot_finished();
            slots.len()
        };
        self.emit(TransferEvent::SlotsChanged(count));
        self.slots_changed.notify_waiters();
        self.chunk_done.secure_notify();
        if count == 0 {
            // Lets a pending turbo watcher see the transfer is over.
            self.turbo.secure_notify();
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Arc<SlotControl>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Starts, pauses, resumes and stops the workers of one transfer.
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    transfer: Arc<Transfer>,
    next_slot: Arc<AtomicUsize>,
}

impl TransferCoordinator {
    pub async fn new(
        config: TransferConfig,
        url_provider: Arc<dyn UrlProvider>,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self, TransferError> {
        if config.file_size == 0 {
            return Err(TransferError::UnknownSize(config.file_name.clone()));
        }
        let layout = ChunkLayout::new(config.file_size, config.chunk_size);

        let direct_client = http_client(&config, None)?;
        let user_proxy_client = config.proxy.as_ref().map(|p| http_client(&config, Some(p))).transpose()?;

        let proxy_pool = match (&config.proxy_source, config.smart_proxy_active()) {
            (Some(source), true) => Some(Arc::new(ProxyPool::load(source.clone()).await?)),
            (None, true) => {
                warn!("smart proxy mode enabled without a proxy list; connecting directly");
                None
            }
            _ => None,
        };

        let transfer = Transfer {
            allocator: ChunkAllocator::new(layout.total_chunks()),
            layout,
            url_provider,
            supervisor,
            proxy_pool,
            direct_client,
            user_proxy_client,
            cancel: CancellationToken::new(),
            progress: AtomicU64::new(0),
            network_bytes: AtomicU64::new(0),
            peak_speed: AtomicU64::new(0),
            started: Instant::now(),
            stopped: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            error509: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
            slots: Mutex::new(Vec::new()),
            slots_changed: Notify::new(),
            paused_workers: AtomicUsize::new(0),
            chunk_done: SecureNotify::new(),
            turbo: SecureNotify::new(),
            turbo_requested: AtomicBool::new(false),
            events: Mutex::new(None),
            config,
        };
        Ok(Self { transfer: Arc::new(transfer), next_slot: Arc::new(AtomicUsize::new(1)) })
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    /// Channel of [`TransferEvent`]s. Subscribing again replaces the old one.
    pub fn subscribe(&self) -> UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.transfer.events.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    /// Spawns the configured number of workers.
    pub fn start(&self) {
        let wanted = self.transfer.config.slots.max(1);
        info!(
            file = %self.transfer.config.file_name,
            size = self.transfer.layout.file_size,
            chunks = self.transfer.layout.total_chunks(),
            slots = wanted,
            "starting transfer"
        );
        for _ in 0..wanted {
            self.add_slot();
        }
        if self.transfer.config.turbo_extra_slots() > 0 {
            self.spawn_turbo();
        }
    }

    /// Waits for the first smart proxy pickup, then tops the slot count up.
    fn spawn_turbo(&self) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let transfer = coordinator.transfer.clone();
            tokio::select! {
                _ = transfer.turbo.secure_wait() => {}
                _ = transfer.cancel.cancelled() => return,
            }
            let extra = transfer.config.turbo_extra_slots();
            info!(file = %transfer.config.file_name, extra, "proxy turbo mode");
            for _ in 0..extra {
                if transfer.is_stopped() || transfer.slot_count() == 0 {
                    break;
                }
                coordinator.add_slot();
            }
        });
    }

    /// Starts one more worker and returns its slot id.
    pub fn add_slot(&self) -> usize {
        let id = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let control = Arc::new(SlotControl::new(id, self.transfer.cancel.child_token()));
        self.transfer.register_slot(control.clone());

        let transfer = self.transfer.clone();
        tokio::spawn(async move {
            let worker = ChunkWorker::new(transfer.clone(), control);
            let result = AssertUnwindSafe(worker.run()).catch_unwind().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(ChunkError::Fatal(msg))) => transfer.stop(Some(msg)),
                Ok(Err(e)) => debug!(slot = id, "worker ended: {}", e),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "worker panicked".to_string());
                    transfer.stop(Some(msg));
                }
            }
            transfer.deregister_slot(id);
        });
        id
    }

    /// Asks the most recently started worker to exit. Returns false when
    /// there is none left.
    pub fn remove_slot(&self) -> bool {
        let last = self.transfer.lock_slots().iter().rev().find(|s| !s.is_exiting()).cloned();
        match last {
            Some(slot) => {
                slot.exit();
                true
            }
            None => false,
        }
    }

    pub fn pause(&self) {
        self.transfer.pause();
    }

    pub fn resume(&self) {
        if !self.transfer.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(file = %self.transfer.config.file_name, "resuming transfer");
        self.transfer.paused_workers.store(0, Ordering::SeqCst);
        for slot in self.transfer.lock_slots().iter() {
            slot.wake.secure_notify();
        }
        self.transfer.emit(TransferEvent::Resumed);
    }

    pub fn stop(&self, reason: Option<String>) {
        self.transfer.stop(reason);
    }

    pub fn is_paused(&self) -> bool {
        self.transfer.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.transfer.is_stopped()
    }

    pub fn progress(&self) -> u64 {
        self.transfer.progress()
    }

    pub fn slot_count(&self) -> usize {
        self.transfer.slot_count()
    }

    pub fn proxy_pool(&self) -> Option<&Arc<ProxyPool>> {
        self.transfer.proxy_pool.as_ref()
    }

    /// Waits until every worker has exited and reports how it went.
    pub async fn wait(&self) -> TransferOutcome {
        loop {
            let changed = self.transfer.slots_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.transfer.slot_count() == 0 {
                break;
            }
            changed.await;
        }

        if self.transfer.is_stopped() {
            return TransferOutcome::Stopped(self.transfer.stop_reason().unwrap_or_default());
        }
        let done = self.transfer.progress();
        let size = self.transfer.layout.file_size;
        if done >= size && self.transfer.allocator.remaining() == 0 {
            info!(file = %self.transfer.config.file_name, "transfer finished");
            self.transfer.emit(TransferEvent::Finished);
            TransferOutcome::Completed
        } else {
            TransferOutcome::Incomplete { missing: size.saturating_sub(done) }
        }
    }
}

/// Client for direct or fixed-proxy connections.
pub(crate) fn http_client(config: &TransferConfig, proxy: Option<&ProxySettings>) -> Result<Client, ProxyError> {
    let builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.timeout);
    let builder = match proxy {
        Some(settings) => {
            let mut p = Proxy::all(format!("http://{}", settings.address()))?;
            if settings.has_credentials() {
                p = p.basic_auth(
                    settings.user.as_deref().unwrap_or_default(),
                    settings.password.as_deref().unwrap_or_default(),
                );
            }
            builder.proxy(p)
        }
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

/// Client routed through a smart proxy at `address`.
pub(crate) fn smart_proxy_client(config: &TransferConfig, address: &str) -> Result<Client, ProxyError> {
    let proxy = Proxy::all(format!("http://{}", address))?;
    Ok(Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.timeout)
        .proxy(proxy)
        .build()?)
}
