use anyhow::{Context, Result};

#[cfg(unix)]
use chunkdl::{Supervisor, TransferCoordinator};
#[cfg(unix)]
use daemonize::Daemonize;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::fs::File;
#[cfg(unix)]
use std::sync::Arc;
#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};
#[cfg(unix)]
use tracing::info;

pub const LOG_FILE: &str = "chunkdl.log";
pub const PID_FILE: &str = "chunkdl.pid";

#[cfg(unix)]
pub fn start_daemon() -> Result<()> {
    // stdout and stderr share one file so --follow sees everything
    let stdout = File::create(LOG_FILE).context("Failed to create log file")?;
    let stderr = stdout.try_clone().context("Failed to clone log file handle")?;

    let daemonize = Daemonize::new()
        .pid_file(PID_FILE)
        .chown_pid_file(true)
        .working_directory(".")
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => {
            println!("Success, daemonized");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Error starting daemon: {}", e)),
    }
}

#[cfg(unix)]
pub fn get_daemon_pid() -> Result<Option<i32>> {
    if !std::path::Path::new(PID_FILE).exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(PID_FILE)?;
    let pid = content.trim().parse::<i32>()?;
    Ok(Some(pid))
}

#[cfg(unix)]
pub fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    signal::kill(Pid::from_raw(pid), signal)?;
    Ok(())
}

#[cfg(unix)]
fn signal_daemon(signal: Signal, done: &str) -> Result<bool> {
    match get_daemon_pid()? {
        Some(pid) => {
            send_signal(pid, signal)?;
            println!("{} daemon (PID: {})", done, pid);
            Ok(true)
        }
        None => {
            println!("Daemon is not running.");
            Ok(false)
        }
    }
}

/// SIGTERM: workers stop, chunk files stay for a later resume.
#[cfg(unix)]
pub fn stop_daemon() -> Result<()> {
    if signal_daemon(Signal::SIGTERM, "Stopped")? {
        cleanup_pid_file();
    }
    Ok(())
}

/// SIGUSR1: workers park at their next read.
#[cfg(unix)]
pub fn pause_daemon() -> Result<()> {
    signal_daemon(Signal::SIGUSR1, "Paused").map(|_| ())
}

/// SIGUSR2: parked workers carry on.
#[cfg(unix)]
pub fn resume_daemon() -> Result<()> {
    signal_daemon(Signal::SIGUSR2, "Resumed").map(|_| ())
}

#[cfg(unix)]
pub fn cleanup_pid_file() {
    let _ = std::fs::remove_file(PID_FILE);
}

/// Maps control signals onto the running transfer until it stops.
#[cfg(unix)]
pub async fn listen_for_signals(coordinator: TransferCoordinator, supervisor: Arc<Supervisor>) -> Result<()> {
    let mut pause = unix_signal(SignalKind::user_defined1())?;
    let mut resume = unix_signal(SignalKind::user_defined2())?;
    let mut terminate = unix_signal(SignalKind::terminate())?;

    while !coordinator.is_stopped() {
        tokio::select! {
            Some(()) = pause.recv() => {
                info!("pause requested");
                supervisor.pause_all();
                coordinator.pause();
            }
            Some(()) = resume.recv() => {
                info!("resume requested");
                supervisor.resume_all();
                coordinator.resume();
            }
            Some(()) = terminate.recv() => {
                info!("stop requested");
                coordinator.stop(Some("terminated".to_string()));
            }
            else => break,
        }
    }
    Ok(())
}
