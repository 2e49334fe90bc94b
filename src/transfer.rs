// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! File transfer over the ssh session
//!
//! Files move in fixed 1 MiB chunks. Progress is reported to the caller only
//! at every 20% and at completion to keep logs readable on multi-GB archives,
//! and a watchdog warns (without aborting) when no chunk moved for 30 seconds.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::remote::RemoteShell;

pub const CHUNK_SIZE: usize = 1024 * 1024;
pub const PROGRESS_STEP_PERCENT: u64 = 20;
pub const STALL_THRESHOLD: Duration = Duration::from_secs(30);

/// Fixed allowance plus one second per MiB (assumes at least ~1 MiB/s)
const BASE_TRANSFER_TIMEOUT_SECS: u64 = 600;

pub fn transfer_timeout(size: u64) -> Duration {
    Duration::from_secs(BASE_TRANSFER_TIMEOUT_SECS + size / (1024 * 1024))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes: u64,
    /// The watchdog flagged at least one stall during the transfer
    pub stalled: bool,
}

/// Calls the user callback only when a new 20% step is crossed, and once at the end
pub struct ProgressReporter<'a> {
    total: u64,
    next_percent: u64,
    finished: bool,
    callback: &'a mut (dyn FnMut(u64, u64) + Send),
}

impl<'a> ProgressReporter<'a> {
    pub fn new(total: u64, callback: &'a mut (dyn FnMut(u64, u64) + Send)) -> Self {
        Self { total, next_percent: PROGRESS_STEP_PERCENT, finished: false, callback }
    }

    pub fn update(&mut self, transferred: u64) {
        if self.finished {
            return;
        }
        if self.total == 0 || transferred >= self.total {
            self.finish(transferred);
            return;
        }
        let percent = transferred * 100 / self.total;
        if percent >= self.next_percent {
            (self.callback)(transferred, self.total);
            self.next_percent = (percent / PROGRESS_STEP_PERCENT + 1) * PROGRESS_STEP_PERCENT;
        }
    }

    pub fn finish(&mut self, transferred: u64) {
        if !self.finished {
            self.finished = true;
            (self.callback)(transferred, self.total.max(transferred));
        }
    }
}

/// Background check that something is still moving
pub struct StallWatchdog {
    last_progress: Arc<Mutex<Instant>>,
    stalled: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl StallWatchdog {
    pub fn start(label: String, threshold: Duration) -> Self {
        let last_progress = Arc::new(Mutex::new(Instant::now()));
        let stalled = Arc::new(AtomicBool::new(false));
        let (last, flag) = (last_progress.clone(), stalled.clone());
        let check_every = (threshold / 4).max(Duration::from_millis(10));
        let task = tokio::spawn(async move {
            let mut warned = false;
            loop {
                tokio::time::sleep(check_every).await;
                let idle = last.lock().map(|t| t.elapsed()).unwrap_or_default();
                if idle > threshold {
                    if !warned {
                        warn!("{}: no progress for {}s, transfer may be stalled", label, idle.as_secs());
                        warned = true;
                    }
                    flag.store(true, Ordering::Release);
                } else {
                    warned = false;
                }
            }
        });
        Self { last_progress, stalled, task }
    }

    pub fn tick(&self) {
        if let Ok(mut t) = self.last_progress.lock() {
            *t = Instant::now();
        }
    }

    /// Stop watching; returns whether a stall was ever flagged
    pub fn stop(self) -> bool {
        self.task.abort();
        self.stalled.load(Ordering::Acquire)
    }
}

fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    local.with_file_name(name)
}

/// Copy a remote file to `local`, writing to `<local>.part` and renaming on success
pub async fn download(
    shell: &dyn RemoteShell,
    remote: &str,
    local: &Path,
    on_progress: &mut (dyn FnMut(u64, u64) + Send),
) -> Result<TransferStats> {
    download_with_threshold(shell, remote, local, on_progress, STALL_THRESHOLD).await
}

pub async fn download_with_threshold(
    shell: &dyn RemoteShell,
    remote: &str,
    local: &Path,
    on_progress: &mut (dyn FnMut(u64, u64) + Send),
    stall_threshold: Duration,
) -> Result<TransferStats> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let (size, mut reader) = shell.open_read(remote).await?;
    info!("Downloading {} ({} bytes) -> {}", remote, size, local.display());

    let part = partial_path(local);
    let watchdog = StallWatchdog::start(format!("download {}", remote), stall_threshold);
    let copy = async {
        let mut file = tokio::fs::File::create(&part).await?;
        let mut reporter = ProgressReporter::new(size, on_progress);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            let n = reader.read_chunk(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            transferred += n as u64;
            watchdog.tick();
            reporter.update(transferred);
        }
        file.flush().await?;
        reader.finish().await?;
        if transferred != size {
            return Err(Error::transfer(format!(
                "{}: expected {} bytes, received {}", remote, size, transferred
            )));
        }
        reporter.finish(transferred);
        Ok(transferred)
    };

    let result = match tokio::time::timeout(transfer_timeout(size), copy).await {
        Ok(r) => r,
        Err(_) => Err(Error::transfer(format!("download of {} timed out", remote))),
    };
    let stalled = watchdog.stop();
    match result {
        Ok(bytes) => {
            tokio::fs::rename(&part, local).await?;
            Ok(TransferStats { bytes, stalled })
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}

/// Copy `local` to a remote path; remote parent directories are created by the session
pub async fn upload(
    shell: &dyn RemoteShell,
    local: &Path,
    remote: &str,
    on_progress: &mut (dyn FnMut(u64, u64) + Send),
) -> Result<TransferStats> {
    let mut file = tokio::fs::File::open(local).await?;
    let size = file.metadata().await?.len();
    info!("Uploading {} ({} bytes) -> {}", local.display(), size, remote);

    let mut writer = shell.open_write(remote).await?;
    let watchdog = StallWatchdog::start(format!("upload {}", remote), STALL_THRESHOLD);
    let copy = async {
        let mut reporter = ProgressReporter::new(size, on_progress);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&buf[..n]).await?;
            transferred += n as u64;
            watchdog.tick();
            reporter.update(transferred);
        }
        writer.finish().await?;
        reporter.finish(transferred);
        Ok::<u64, Error>(transferred)
    };

    let result = match tokio::time::timeout(transfer_timeout(size), copy).await {
        Ok(r) => r,
        Err(_) => Err(Error::transfer(format!("upload to {} timed out", remote))),
    };
    let stalled = watchdog.stop();
    result.map(|bytes| TransferStats { bytes, stalled })
}

/// Progress callback that logs each step
pub fn log_progress(label: String) -> impl FnMut(u64, u64) + Send {
    move |done, total| {
        let percent = if total > 0 { done * 100 / total } else { 100 };
        info!("{}: {}% ({} / {} MiB)", label, percent, done / (1024 * 1024), total / (1024 * 1024));
    }
}
