mod cli;
mod commands;
mod daemon;

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::cli::VerifyMode;
use crate::commands::DownloadOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to download
    #[arg(index = 1)]
    url: Option<String>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Output file name (defaults to the last URL segment)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Number of parallel workers (defaults to number of logical CPUs, 2..=8)
    #[arg(short = 's', long)]
    slots: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Chunk size as a multiple of 1 MiB
    #[arg(short = 'm', long = "chunk-multiplier", default_value_t = 1)]
    chunk_multiplier: u64,

    /// Fixed HTTP proxy, host:port
    #[arg(long)]
    proxy: Option<String>,

    #[arg(long = "proxy-user")]
    proxy_user: Option<String>,

    #[arg(long = "proxy-pass")]
    proxy_pass: Option<String>,

    /// Switch to the fastest known proxy when the server rate limits (509)
    #[arg(long = "smart-proxy")]
    smart_proxy: bool,

    /// Proxy list for --smart-proxy: a file or an http(s) URL, one host:port per line
    #[arg(long = "proxy-list")]
    proxy_list: Option<String>,

    /// Grow to this many workers once a smart proxy is in use (0 = off)
    #[arg(long = "turbo-slots", default_value_t = 0)]
    turbo_slots: usize,

    /// Connect and read timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[arg(long = "user-agent")]
    user_agent: Option<String>,

    /// Resolve the URL through its redirects again whenever it expires (403)
    #[arg(long = "follow-redirects")]
    follow_redirects: bool,

    /// Expected SHA-256 of the finished file
    #[arg(long)]
    sha256: Option<String>,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    verify_hash: VerifyMode,

    /// Leave chunk files in place after assembly
    #[arg(long = "keep-chunks")]
    keep_chunks: bool,

    /// Run in background (daemon mode) [Unix only]
    #[arg(short = 'D', long)]
    daemon: bool,

    /// Follow the download table, refreshing it like tail -f
    #[arg(short = 'f', long)]
    follow: bool,

    /// Stop the daemon process [Unix only]
    #[arg(short = 'x', long)]
    stop: bool,

    /// Pause the daemon process [Unix only]
    #[arg(short = 'p', long)]
    pause: bool,

    /// Resume the daemon process [Unix only]
    #[arg(short = 'u', long)]
    resume: bool,

    /// List all downloads and their status
    #[arg(short = 'l', long)]
    list: bool,
}

fn init_logging(daemon: bool) {
    let default = if daemon { "chunkdl=info" } else { "chunkdl=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let mut args = Args::parse();

    // Resolve before daemonizing; the daemon may run from another directory
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    // Control commands never start a transfer
    if args.list || args.stop || args.pause || args.resume || args.follow {
        init_logging(false);
        let rt = tokio::runtime::Runtime::new()?;
        return rt.block_on(async { handle_sync_commands(&args).await });
    }

    let Some(url) = args.url.clone() else {
        bail!("No URL given. Run with --help for usage.");
    };

    #[cfg(unix)]
    if args.daemon {
        crate::daemon::start_daemon()?;
    }
    // After the fork, so the subscriber writes to the daemon log
    init_logging(args.daemon);

    let opts = DownloadOptions {
        url,
        download_dir: args.download_dir,
        name: args.name,
        slots: args.slots,
        rate_limit: args.rate_limit,
        chunk_multiplier: args.chunk_multiplier,
        proxy: args.proxy,
        proxy_user: args.proxy_user,
        proxy_pass: args.proxy_pass,
        smart_proxy: args.smart_proxy,
        proxy_list: args.proxy_list,
        turbo_slots: args.turbo_slots,
        timeout: args.timeout,
        user_agent: args.user_agent,
        follow_redirects: args.follow_redirects,
        sha256: args.sha256,
        verify_mode: args.verify_hash,
        keep_chunks: args.keep_chunks,
        daemon: args.daemon,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(crate::commands::run_download(opts))
}

async fn handle_sync_commands(args: &Args) -> Result<()> {
    if args.list {
        return crate::commands::list_downloads(args.download_dir.clone()).await;
    }
    if args.follow {
        return crate::commands::follow_log(args.download_dir.clone()).await;
    }

    #[cfg(unix)]
    {
        if args.stop {
            return crate::daemon::stop_daemon();
        }

        if args.pause {
            return crate::daemon::pause_daemon();
        }

        if args.resume {
            return crate::daemon::resume_daemon();
        }
    }
    Ok(())
}
