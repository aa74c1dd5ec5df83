use anyhow::{bail, Context, Result};
use chunkdl::assembler;
use chunkdl::chunk::ChunkLayout;
use chunkdl::config::{ProxySource, TransferConfig, DEFAULT_USER_AGENT};
use chunkdl::providers::{self, StaticUrl, UrlProvider};
use chunkdl::proxy;
use chunkdl::state::TransferManifest;
use chunkdl::utils::{file_name_from_url, manifest_path, parse_chunk_index};
use chunkdl::{Supervisor, Throttle, TransferCoordinator, TransferEvent, TransferOutcome};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::cli::VerifyMode;

/// Everything `run_download` needs from the command line.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub url: String,
    pub download_dir: PathBuf,
    pub name: Option<String>,
    pub slots: Option<usize>,
    pub rate_limit: Option<u32>,
    pub chunk_multiplier: u64,
    pub proxy: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_pass: Option<String>,
    pub smart_proxy: bool,
    pub proxy_list: Option<String>,
    pub turbo_slots: usize,
    pub timeout: u64,
    pub user_agent: Option<String>,
    pub follow_redirects: bool,
    pub sha256: Option<String>,
    pub verify_mode: VerifyMode,
    pub keep_chunks: bool,
    pub daemon: bool,
}

pub async fn run_download(opts: DownloadOptions) -> Result<()> {
    if opts.verify_mode == VerifyMode::On && opts.sha256.is_none() {
        bail!("--verify-hash on needs --sha256");
    }
    if !opts.download_dir.exists() {
        fs::create_dir_all(&opts.download_dir).await.context("Failed to create download directory")?;
    }

    let user_agent = opts.user_agent.clone().unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
    let client = reqwest::Client::builder()
        .user_agent(user_agent.clone())
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    println!("Calculating size...");
    let probe = providers::probe(&client, &opts.url).await.context("Failed to query file size")?;
    if !probe.accepts_ranges {
        warn!(url = %opts.url, "server does not advertise byte ranges; chunks may fail");
    }

    let file_name = opts.name.clone().unwrap_or_else(|| file_name_from_url(&probe.url));
    let output = opts.download_dir.join(&file_name);
    let has_manifest = manifest_path(&opts.download_dir, &file_name).exists();
    if output.exists() && !has_manifest {
        let existing = fs::metadata(&output).await?.len();
        if existing == probe.size {
            let sha256 = assembler::sha256_file(&output).await?;
            verify(&opts, &sha256, &output)?;
            println!("Skipping    {} (already downloaded, SHA256: {})", file_name, sha256);
            return Ok(());
        }
        warn!(file = %file_name, existing, expected = probe.size, "overwriting file of different size");
    }

    let layout = ChunkLayout::with_multiplier(probe.size, opts.chunk_multiplier);
    prepare_manifest(&opts, &file_name, layout).await?;

    let proxy = opts
        .proxy
        .as_deref()
        .map(|p| proxy::parse_settings(p, opts.proxy_user.clone(), opts.proxy_pass.clone()))
        .transpose()?;

    let defaults = TransferConfig::default();
    let config = TransferConfig {
        download_path: opts.download_dir.clone(),
        file_name: file_name.clone(),
        file_size: layout.file_size,
        chunk_size: layout.chunk_size,
        slots: opts.slots.unwrap_or(defaults.slots),
        speed_cap: opts.rate_limit,
        proxy,
        smart_proxy: opts.smart_proxy,
        proxy_source: opts.proxy_list.as_deref().map(ProxySource::parse),
        proxy_turbo_slots: opts.turbo_slots,
        timeout: Duration::from_secs(opts.timeout),
        user_agent,
        ..defaults
    };

    let url_provider: Arc<dyn UrlProvider> = if opts.follow_redirects {
        Arc::from(providers::for_url(&opts.url, true)?)
    } else {
        Arc::new(StaticUrl(probe.url.clone()))
    };
    let supervisor = Arc::new(Supervisor::new(Throttle::new(config.speed_cap)));
    let coordinator = TransferCoordinator::new(config, url_provider, supervisor.clone())
        .await
        .context("Failed to set up transfer")?;

    let events = coordinator.subscribe();
    let pb = progress_bar(layout.file_size, &file_name);
    let renderer = tokio::spawn(render_progress(events, pb.clone()));

    #[cfg(unix)]
    tokio::spawn(crate::daemon::listen_for_signals(coordinator.clone(), supervisor.clone()));
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coordinator.stop(Some("interrupted".to_string()));
            }
        });
    }

    coordinator.start();
    let (assembled, outcome) = tokio::join!(
        assembler::assemble(coordinator.transfer(), &output, opts.keep_chunks),
        coordinator.wait()
    );
    // No terminal event arrives for an incomplete transfer.
    renderer.abort();

    #[cfg(unix)]
    if opts.daemon {
        crate::daemon::cleanup_pid_file();
    }

    match outcome {
        TransferOutcome::Completed => {}
        TransferOutcome::Stopped(reason) => {
            pb.abandon_with_message(format!("Stopped     {} ({})", file_name, reason));
            println!("Chunks kept in {:?}; run the same command again to resume.", opts.download_dir);
            return Ok(());
        }
        TransferOutcome::Incomplete { missing } => {
            pb.abandon_with_message(format!("Incomplete  {}", file_name));
            bail!("Transfer ended with {} still missing", HumanBytes(missing));
        }
    }

    let assembled = assembled.context("Failed to assemble chunks")?;
    verify(&opts, &assembled.sha256, &assembled.path)?;
    let _ = fs::remove_file(manifest_path(&opts.download_dir, &file_name)).await;
    pb.finish_with_message(format!("Completed   {} (SHA256: {})", file_name, assembled.sha256));
    Ok(())
}

/// Writes the manifest, throwing away chunk files from an incompatible
/// earlier layout.
async fn prepare_manifest(opts: &DownloadOptions, file_name: &str, layout: ChunkLayout) -> Result<()> {
    let mut fresh = TransferManifest::new(opts.url.clone(), file_name.to_string(), layout);
    fresh.sha256 = opts.sha256.clone();
    match TransferManifest::load(&opts.download_dir, file_name).await {
        Ok(Some(previous)) if previous.is_compatible(&fresh) => {
            let done = previous.downloaded_bytes(&opts.download_dir).await;
            println!("Resuming {} ({} already on disk)", file_name, HumanBytes(done));
            return Ok(());
        }
        Ok(Some(_)) => {
            println!("Layout of {} changed, discarding old chunks", file_name);
            for path in chunk_files(&opts.download_dir, file_name)? {
                let _ = fs::remove_file(path).await;
            }
        }
        Ok(None) => {}
        Err(e) => warn!("ignoring unreadable manifest: {}", e),
    }
    fresh.save(&opts.download_dir).await.context("Failed to write manifest")?;
    Ok(())
}

/// Chunk and staging files belonging to `file_name`.
fn chunk_files(dir: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}.chunk[0-9]*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(file_name)
    );
    let paths = glob::glob(&pattern)?.filter_map(|p| p.ok()).collect();
    Ok(paths)
}

fn verify(opts: &DownloadOptions, computed: &str, path: &Path) -> Result<()> {
    if opts.verify_mode == VerifyMode::Off {
        return Ok(());
    }
    if let Some(expected) = &opts.sha256 {
        if !expected.eq_ignore_ascii_case(computed) {
            let _ = std::fs::remove_file(path);
            bail!("Hash mismatch: expected {}, got {}", expected, computed);
        }
        info!("hash verified");
    }
    Ok(())
}

fn progress_bar(total: u64, file_name: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    // Many slots report progress; cap the redraw rate.
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message(format!("Downloading {}", file_name));
    pb
}

/// Drives the progress bar from coordinator events until the channel closes
/// or the transfer ends.
async fn render_progress(mut events: UnboundedReceiver<TransferEvent>, pb: ProgressBar) {
    let mut waiting: HashSet<usize> = HashSet::new();
    let mut proxied: HashSet<usize> = HashSet::new();
    let mut slots = 0;
    let mut rate_limited = false;
    let mut paused = false;

    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Progress { total, .. } => pb.set_position(total),
            TransferEvent::ErrorWait { slot, waiting: on } => {
                if on {
                    waiting.insert(slot);
                } else {
                    waiting.remove(&slot);
                }
            }
            TransferEvent::SmartProxy { slot, active } => {
                if active {
                    proxied.insert(slot);
                } else {
                    proxied.remove(&slot);
                }
            }
            TransferEvent::RateLimited(on) => rate_limited = on,
            TransferEvent::SlotsChanged(n) => slots = n,
            TransferEvent::Paused => paused = true,
            TransferEvent::Resumed => paused = false,
            TransferEvent::ChunkCommitted { .. } => {}
            TransferEvent::Finished | TransferEvent::Stopped(_) => break,
        }

        let mut msg = format!("slots {}", slots);
        if !waiting.is_empty() {
            msg.push_str(&format!(" | {} retrying", waiting.len()));
        }
        if !proxied.is_empty() {
            msg.push_str(&format!(" | {} via proxy", proxied.len()));
        }
        if rate_limited {
            msg.push_str(" | rate limited");
        }
        if paused {
            msg.push_str(" | PAUSED");
        }
        pb.set_message(msg);
    }
}

pub async fn list_downloads(download_dir: PathBuf) -> Result<()> {
    if !download_dir.exists() {
        println!("Download directory '{:?}' does not exist.", download_dir);
        println!("Tip: If you used a custom directory, please specify it with --download-dir");
        return Ok(());
    }

    println!("{:<50} {:<12} {:<10} {:<12} {:<17}", "Filename", "Status", "Progress", "Size", "Started");
    println!("{:-<50} {:-<12} {:-<10} {:-<12} {:-<17}", "", "", "", "", "");

    let mut found_any = false;
    let mut active: HashSet<String> = HashSet::new();

    let pattern = download_dir.join("*.chunks.json");
    for path in glob::glob(&pattern.to_string_lossy())?.filter_map(|p| p.ok()) {
        let Ok(content) = fs::read_to_string(&path).await else { continue };
        let Ok(manifest) = serde_json::from_str::<TransferManifest>(&content) else { continue };
        let done = manifest.downloaded_bytes(&download_dir).await;
        let progress = if manifest.file_size > 0 { done as f64 / manifest.file_size as f64 * 100.0 } else { 0.0 };
        println!(
            "{:<50} {:<12} {:<10} {:<12} {:<17}",
            manifest.file_name,
            "Downloading",
            format!("{:.2}%", progress),
            format!("{}", HumanBytes(manifest.file_size)),
            manifest.created_at.format("%Y-%m-%d %H:%M")
        );
        active.insert(manifest.file_name);
        found_any = true;
    }

    let mut entries = fs::read_dir(&download_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else { continue };
        let is_sidecar = name.ends_with(".part")
            || name.ends_with(".chunks.json")
            || name.ends_with(".tmp")
            || active.iter().any(|f| parse_chunk_index(f, &path).is_some());
        if is_sidecar || name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
            println!(
                "{:<50} {:<12} {:<10} {:<12} {:<17}",
                name,
                "Completed",
                "100.00%",
                format!("{}", HumanBytes(metadata.len())),
                modified.format("%Y-%m-%d %H:%M")
            );
            found_any = true;
        }
    }

    if !found_any {
        println!("No active or completed downloads found in '{:?}'.", download_dir);
    }
    Ok(())
}

pub async fn follow_log(download_dir: PathBuf) -> Result<()> {
    loop {
        print!("\x1B[1;1H\x1B[0J");
        list_downloads(download_dir.clone()).await?;
        println!("\n(Press Ctrl+C to exit view)");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
