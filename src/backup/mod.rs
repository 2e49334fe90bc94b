// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Backup creation — runs vzdump on the Proxmox host
//!
//! Refuses to start while another vzdump is running, discovers guests when
//! none are configured, and collects the archive paths vzdump announces on
//! its output while the job streams.

use tracing::{debug, info, warn};

use crate::archive::archive_path_from_line;
use crate::config::{BackupConfig, UnselectedArchives};
use crate::error::{Error, Result};
use crate::remote::{RemoteShell, classify_failure, shell_quote};

/// Probe for a running job; exits 0 when one exists
const BUSY_PROBE: &str = "pgrep -x vzdump";

/// Trailing output kept for classifying a failed job
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    /// Empty means every guest on the host
    pub guest_ids: Vec<String>,
    pub mode: String,
    pub compression: String,
    pub storage: String,
    pub download_all: bool,
    pub unselected: UnselectedArchives,
}

impl BackupRequest {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            guest_ids: config.guest_ids.clone(),
            mode: config.mode.clone(),
            compression: config.compression.clone(),
            storage: config.storage.clone(),
            download_all: config.download_all,
            unselected: config.unselected_archives,
        }
    }
}

/// What a vzdump run left on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupResult {
    pub guest_ids: Vec<String>,
    /// Archives to download, in the order vzdump produced them
    pub archives: Vec<String>,
    /// Produced but not selected (latest-only mode)
    pub unselected: Vec<String>,
}

pub struct BackupCreator<'a> {
    shell: &'a dyn RemoteShell,
}

impl<'a> BackupCreator<'a> {
    pub fn new(shell: &'a dyn RemoteShell) -> Self {
        Self { shell }
    }

    /// Fail with `Busy` while another vzdump is running on the host
    pub async fn ensure_idle(&self) -> Result<()> {
        let out = self.shell.exec(BUSY_PROBE).await?;
        match out.exit_code {
            0 => {
                let pids = out.stdout.split_whitespace().collect::<Vec<_>>().join(", ");
                warn!("vzdump already running on host (pid {})", pids);
                Err(Error::Busy)
            }
            1 => Ok(()),
            code => Err(classify_failure(code, &out.stdout, &out.stderr)),
        }
    }

    /// All VM ids, or all container ids when the host has no VMs
    pub async fn discover_guests(&self) -> Result<Vec<String>> {
        let vms = parse_guest_ids(&self.shell.exec("qm list").await?.check()?.stdout);
        if !vms.is_empty() {
            info!("Discovered {} VMs: {}", vms.len(), vms.join(", "));
            return Ok(vms);
        }
        let cts = parse_guest_ids(&self.shell.exec("pct list").await?.check()?.stdout);
        if !cts.is_empty() {
            info!("Discovered {} containers: {}", cts.len(), cts.join(", "));
            return Ok(cts);
        }
        Err(Error::NoGuests)
    }

    pub async fn create(&self, request: &BackupRequest) -> Result<BackupResult> {
        self.ensure_idle().await?;

        let guest_ids = if request.guest_ids.is_empty() {
            self.discover_guests().await?
        } else {
            request.guest_ids.clone()
        };

        let command = vzdump_command(&guest_ids, request);
        info!("Starting backup of {}: {}", guest_ids.join(", "), command);

        let mut produced: Vec<String> = Vec::new();
        let mut tail: Vec<String> = Vec::with_capacity(OUTPUT_TAIL_LINES);
        let mut on_line = |line: &str| {
            if let Some(path) = archive_path_from_line(line) {
                info!("vzdump is writing {}", path);
                produced.push(path);
            } else if line.contains("ERROR") {
                warn!("vzdump: {}", line);
            } else {
                debug!("vzdump: {}", line);
            }
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line.to_string());
        };
        let out = self.shell.exec_streaming(&command, &mut on_line).await?;

        if !out.success() {
            return Err(classify_failure(out.exit_code, &tail.join("\n"), &out.stderr));
        }
        if produced.is_empty() {
            return Err(Error::NoArchive);
        }

        let (archives, unselected) = select_archives(produced, request.download_all);
        if !unselected.is_empty() {
            self.handle_unselected(&unselected, request.unselected).await;
        }
        Ok(BackupResult { guest_ids, archives, unselected })
    }

    async fn handle_unselected(&self, paths: &[String], policy: UnselectedArchives) {
        match policy {
            UnselectedArchives::Retain => {
                info!("Leaving {} unselected archives on the host: {}", paths.len(), paths.join(", "));
            }
            UnselectedArchives::Discard => {
                let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
                match self.shell.exec(&format!("rm -f {}", quoted.join(" "))).await {
                    Ok(out) if out.success() => info!("Discarded {} unselected archives on the host", paths.len()),
                    Ok(out) => warn!("Failed to discard unselected archives: {}", out.stderr.trim()),
                    Err(e) => warn!("Failed to discard unselected archives: {}", e),
                }
            }
        }
    }
}

pub fn vzdump_command(guest_ids: &[String], request: &BackupRequest) -> String {
    format!(
        "vzdump {} --compress {} --mode {} --storage {}",
        guest_ids.join(" "),
        shell_quote(&request.compression),
        shell_quote(&request.mode),
        shell_quote(&request.storage),
    )
}

/// Split produced archives into (to download, left alone). Latest-only keeps the last one.
pub fn select_archives(mut produced: Vec<String>, download_all: bool) -> (Vec<String>, Vec<String>) {
    if download_all || produced.len() <= 1 {
        return (produced, Vec::new());
    }
    let last = produced.split_off(produced.len() - 1);
    (last, produced)
}

/// First column of `qm list` / `pct list`, skipping the header
pub fn parse_guest_ids(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeShell;

    fn request(ids: &[&str]) -> BackupRequest {
        BackupRequest {
            guest_ids: ids.iter().map(|s| s.to_string()).collect(),
            mode: "snapshot".into(),
            compression: "zstd".into(),
            storage: "local".into(),
            download_all: true,
            unselected: UnselectedArchives::Retain,
        }
    }

    const QM_LIST: &[&str] = &[
        "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID",
        "       100 web                  running    2048              32.00 1234",
        "       110 db                   stopped    4096              64.00 0",
    ];

    #[tokio::test]
    async fn test_busy_host_refuses() {
        let shell = FakeShell::new().on("pgrep -x vzdump", &["4242"], "", 0);
        let err = BackupCreator::new(&shell).create(&request(&["101"])).await.unwrap_err();
        assert!(matches!(err, Error::Busy));
        assert!(!err.is_retryable());
        assert_eq!(shell.ran("vzdump 101"), 0);
    }

    #[tokio::test]
    async fn test_single_archive() {
        let shell = FakeShell::new()
            .on("pgrep", &[], "", 1)
            .on("vzdump 101", &[
                "INFO: starting new backup job: vzdump 101 --compress zstd",
                "INFO: creating vzdump archive '/var/lib/vz/dump/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst'",
                "INFO: Finished Backup of VM 101 (00:00:12)",
            ], "", 0);
        let result = BackupCreator::new(&shell).create(&request(&["101"])).await.unwrap();
        assert_eq!(result.archives, vec!["/var/lib/vz/dump/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst"]);
        assert_eq!(result.guest_ids, vec!["101"]);
        assert_eq!(shell.ran("vzdump 101 --compress 'zstd' --mode 'snapshot' --storage 'local'"), 1);
    }

    #[tokio::test]
    async fn test_discovers_vms_first() {
        let shell = FakeShell::new()
            .on("pgrep", &[], "", 1)
            .on("qm list", QM_LIST, "", 0)
            .on("vzdump 100 110", &[
                "INFO: creating vzdump archive '/d/vzdump-qemu-100-2024_06_01-03_00_00.vma.zst'",
                "INFO: creating vzdump archive '/d/vzdump-qemu-110-2024_06_01-03_05_00.vma.zst'",
            ], "", 0);
        let result = BackupCreator::new(&shell).create(&request(&[])).await.unwrap();
        assert_eq!(result.guest_ids, vec!["100", "110"]);
        assert_eq!(result.archives.len(), 2);
        assert_eq!(shell.ran("pct list"), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_containers_then_fails() {
        let shell = FakeShell::new()
            .on("qm list", &[QM_LIST[0]], "", 0)
            .on("pct list", &["VMID       Status     Lock         Name", "101        running                 ct1"], "", 0);
        assert_eq!(BackupCreator::new(&shell).discover_guests().await.unwrap(), vec!["101"]);

        let empty = FakeShell::new()
            .on("qm list", &[QM_LIST[0]], "", 0)
            .on("pct list", &[], "", 0);
        assert!(matches!(BackupCreator::new(&empty).discover_guests().await, Err(Error::NoGuests)));
    }

    #[tokio::test]
    async fn test_interrupted_job() {
        let shell = FakeShell::new()
            .on("pgrep", &[], "", 1)
            .on("vzdump", &["INFO: status: 40%"], "unexpected control message", 1);
        let err = BackupCreator::new(&shell).create(&request(&["101"])).await.unwrap_err();
        assert!(matches!(err, Error::Interrupted(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_failure_uses_streamed_output() {
        let shell = FakeShell::new()
            .on("pgrep", &[], "", 1)
            .on("vzdump", &["ERROR: Backup of VM 101 failed - storage 'nas' is not online"], "", 2);
        let err = BackupCreator::new(&shell).create(&request(&["101"])).await.unwrap_err();
        match err {
            Error::Command { code, stderr } => {
                assert_eq!(code, 2);
                assert!(stderr.contains("not online"));
            }
            other => panic!("expected Command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_archive_announced() {
        let shell = FakeShell::new()
            .on("pgrep", &[], "", 1)
            .on("vzdump", &["INFO: nothing to do"], "", 0);
        let err = BackupCreator::new(&shell).create(&request(&["101"])).await.unwrap_err();
        assert!(matches!(err, Error::NoArchive));
    }

    #[tokio::test]
    async fn test_latest_only_discards_when_configured() {
        let shell = FakeShell::new()
            .on("pgrep", &[], "", 1)
            .on("vzdump", &[
                "INFO: creating vzdump archive '/d/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst'",
                "INFO: creating vzdump archive '/d/vzdump-lxc-102-2024_06_01-03_02_00.tar.zst'",
            ], "", 0);
        let mut req = request(&["101", "102"]);
        req.download_all = false;
        req.unselected = UnselectedArchives::Discard;

        let result = BackupCreator::new(&shell).create(&req).await.unwrap();
        assert_eq!(result.archives, vec!["/d/vzdump-lxc-102-2024_06_01-03_02_00.tar.zst"]);
        assert_eq!(result.unselected, vec!["/d/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst"]);
        assert_eq!(shell.ran("rm -f '/d/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst'"), 1);
    }

    #[test]
    fn test_select_archives_retain_default() {
        let paths = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(select_archives(paths.clone(), true), (paths.clone(), vec![]));
        assert_eq!(
            select_archives(paths, false),
            (vec!["c".to_string()], vec!["a".to_string(), "b".to_string()])
        );
    }
}
