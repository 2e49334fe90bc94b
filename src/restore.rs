// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Restore — put an archive back onto the Proxmox host as a guest
//!
//! The archive comes from the local directory or the WebDAV tier, is
//! uploaded to a temp path on the host and restored with `pct restore` or
//! `qmrestore`. An existing guest with the target id is left alone, reported
//! as a conflict, or stopped and destroyed first, depending on policy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::archive::{GuestType, base_name, parse_archive_name};
use crate::error::{Error, Result};
use crate::remote::{RemoteShell, classify_failure, shell_quote};
use crate::retry::{RetryPolicy, retry};
use crate::transfer::{self, log_progress};
use crate::webdav::WebDavClient;

/// Archives are staged here on the host before the restore command reads them
pub const REMOTE_STAGING_DIR: &str = "/var/tmp/wolfbackup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RestoreSource {
    Local,
    #[value(name = "webdav")]
    #[serde(rename = "webdav")]
    WebDav,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Archive file name, or an absolute local path
    pub filename: String,
    pub source: RestoreSource,
    /// Overrides the id parsed from the filename
    pub target_id: Option<String>,
    pub storage: String,
    pub force: bool,
    pub skip_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { target_id: String },
    /// The target existed and skip-existing was set; nothing destructive ran
    Skipped { target_id: String },
}

impl RestoreOutcome {
    pub fn target_id(&self) -> &str {
        match self {
            Self::Restored { target_id } | Self::Skipped { target_id } => target_id,
        }
    }
}

/// Where the archive is restored to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub guest_type: GuestType,
    pub guest_id: String,
}

/// Guest type and id for an archive, the explicit id taking precedence
pub fn resolve_target(filename: &str, explicit_id: Option<&str>) -> Result<RestoreTarget> {
    let parsed = parse_archive_name(filename)
        .ok_or_else(|| Error::UnresolvedTarget(filename.to_string()))?;
    let guest_id = match explicit_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) if id.chars().all(|c| c.is_ascii_digit()) => id.to_string(),
        Some(id) => return Err(Error::UnresolvedTarget(format!("{} (invalid target id '{}')", filename, id))),
        None => parsed.guest_id,
    };
    Ok(RestoreTarget { guest_type: parsed.guest_type, guest_id })
}

pub fn restore_command(target: &RestoreTarget, remote_path: &str, storage: &str) -> String {
    match target.guest_type {
        GuestType::Container => format!(
            "pct restore {} {} --storage {}",
            target.guest_id, shell_quote(remote_path), shell_quote(storage)
        ),
        GuestType::VirtualMachine => format!(
            "qmrestore {} {} --storage {}",
            shell_quote(remote_path), target.guest_id, shell_quote(storage)
        ),
    }
}

pub struct RestoreEngine<'a> {
    shell: &'a dyn RemoteShell,
    webdav: Option<&'a WebDavClient>,
    local_dir: &'a Path,
    policy: RetryPolicy,
}

impl<'a> RestoreEngine<'a> {
    /// Uploads get a single attempt until `with_retry` says otherwise
    pub fn new(shell: &'a dyn RemoteShell, webdav: Option<&'a WebDavClient>, local_dir: &'a Path) -> Self {
        let policy = RetryPolicy { max_attempts: 1, interval: std::time::Duration::ZERO };
        Self { shell, webdav, local_dir, policy }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let name = base_name(&request.filename).to_string();
        let target = resolve_target(&name, request.target_id.as_deref())?;
        info!("Restoring {} as {} {}", name, target.guest_type, target.guest_id);

        if let Some(existing) = self.existing_guest(&target.guest_id).await? {
            if request.skip_existing {
                info!("Guest {} already exists, skipping restore of {}", target.guest_id, name);
                return Ok(RestoreOutcome::Skipped { target_id: target.guest_id });
            }
            if !request.force {
                return Err(Error::Conflict(target.guest_id));
            }
            // Archive must be in hand before the guest is destroyed
            let (local, staged) = self.obtain_archive(request, &name).await?;
            if let Err(e) = self.destroy_guest(existing, &target.guest_id).await {
                discard_staging(staged.as_deref()).await;
                return Err(e);
            }
            return self.restore_from(&target, &name, &local, staged.as_deref(), &request.storage).await;
        }

        let (local, staged) = self.obtain_archive(request, &name).await?;
        self.restore_from(&target, &name, &local, staged.as_deref(), &request.storage).await
    }

    /// Local path of the archive, plus the staging file to remove afterwards when one was downloaded
    async fn obtain_archive(&self, request: &RestoreRequest, name: &str) -> Result<(PathBuf, Option<PathBuf>)> {
        match request.source {
            RestoreSource::Local => {
                let path = if Path::new(&request.filename).is_absolute() {
                    PathBuf::from(&request.filename)
                } else {
                    self.local_dir.join(name)
                };
                if !path.is_file() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("archive {} not found", path.display()),
                    )));
                }
                Ok((path, None))
            }
            RestoreSource::WebDav => {
                let webdav = self.webdav
                    .ok_or_else(|| Error::config("restore from WebDAV requested but webdav.url is not set"))?;
                let staged = self.local_dir.join(".restore").join(name);
                webdav.download(name, &staged).await?;
                Ok((staged.clone(), Some(staged)))
            }
        }
    }

    /// Which CLI currently owns `guest_id`, if any. Only a "does not exist"
    /// answer counts as absent; any other failure aborts the restore.
    async fn existing_guest(&self, guest_id: &str) -> Result<Option<GuestType>> {
        for guest_type in [GuestType::Container, GuestType::VirtualMachine] {
            let out = self.shell.exec(&format!("{} status {}", guest_type.cli(), guest_id)).await?;
            if out.success() {
                debug!("Guest {} exists as a {}", guest_id, guest_type);
                return Ok(Some(guest_type));
            }
            if !vanished(&out.stderr) && !vanished(&out.stdout) {
                return Err(classify_failure(out.exit_code, &out.stdout, &out.stderr));
            }
        }
        Ok(None)
    }

    async fn destroy_guest(&self, guest_type: GuestType, guest_id: &str) -> Result<()> {
        let cli = guest_type.cli();
        warn!("Force restore: stopping and destroying existing {} {}", guest_type, guest_id);

        let stop = self.shell.exec(&format!("{} stop {}", cli, guest_id)).await?;
        if !stop.success() {
            debug!("{} stop {}: {}", cli, guest_id, stop.stderr.trim());
        }

        let destroy = self.shell.exec(&format!("{} destroy {} --purge", cli, guest_id)).await?;
        if destroy.success() || vanished(&destroy.stderr) || vanished(&destroy.stdout) {
            return Ok(());
        }
        Err(classify_failure(destroy.exit_code, &destroy.stdout, &destroy.stderr))
    }

    async fn restore_from(
        &self,
        target: &RestoreTarget,
        name: &str,
        local: &Path,
        staged: Option<&Path>,
        storage: &str,
    ) -> Result<RestoreOutcome> {
        let remote_path = format!("{}/{}", REMOTE_STAGING_DIR, name);
        let label = format!("Upload {}", name);
        let (shell, label_ref, remote) = (self.shell, label.as_str(), remote_path.as_str());
        let uploaded = retry(&self.policy, label_ref, move |_| async move {
            let mut progress = log_progress(label_ref.to_string());
            transfer::upload(shell, local, remote, &mut progress).await
        }).await;
        if let Err(e) = uploaded {
            // A partial file may be sitting in the staging dir
            self.remove_remote(&remote_path).await;
            discard_staging(staged).await;
            return Err(e);
        }

        let command = restore_command(target, &remote_path, storage);
        info!("Running {}", command);
        let mut on_line = |line: &str| debug!("restore: {}", line);
        let result = self.shell.exec_streaming(&command, &mut on_line).await;

        self.remove_remote(&remote_path).await;
        discard_staging(staged).await;

        let out = result?;
        if !out.success() {
            return Err(classify_failure(out.exit_code, &out.stdout, &out.stderr));
        }
        info!("Restored {} as {} {}", name, target.guest_type, target.guest_id);
        Ok(RestoreOutcome::Restored { target_id: target.guest_id.clone() })
    }

    async fn remove_remote(&self, path: &str) {
        match self.shell.exec(&format!("rm -f {}", shell_quote(path))).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("Failed to remove {} on host: {}", path, out.stderr.trim()),
            Err(e) => warn!("Failed to remove {} on host: {}", path, e),
        }
    }
}

fn vanished(output: &str) -> bool {
    output.contains("does not exist")
}

async fn discard_staging(staged: Option<&Path>) {
    if let Some(path) = staged {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove staging file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebDavConfig;
    use crate::remote::fake::FakeShell;
    use crate::webdav::transport::DavResponse;
    use crate::webdav::transport::fake::FakeTransport;
    use std::sync::Arc;
    use tempfile::tempdir;

    const CT_ARCHIVE: &str = "vzdump-lxc-101-2024_06_01-03_00_00.tar.zst";
    const MISSING: &str = "Configuration file 'nodes/pve/lxc/101.conf' does not exist";

    fn request(filename: &str) -> RestoreRequest {
        RestoreRequest {
            filename: filename.to_string(),
            source: RestoreSource::Local,
            target_id: None,
            storage: "local-lvm".to_string(),
            force: false,
            skip_existing: false,
        }
    }

    fn local_dir_with(name: &str) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(name), b"archive-bytes").unwrap();
        dir
    }

    #[test]
    fn test_resolve_target() {
        let t = resolve_target(CT_ARCHIVE, None).unwrap();
        assert_eq!((t.guest_type, t.guest_id.as_str()), (GuestType::Container, "101"));
        let t = resolve_target("vzdump-qemu-210-2024_06_01-03_00_00.vma.zst", Some("310")).unwrap();
        assert_eq!((t.guest_type, t.guest_id.as_str()), (GuestType::VirtualMachine, "310"));
        assert!(matches!(resolve_target("manual.tar.zst", Some("100")), Err(Error::UnresolvedTarget(_))));
        assert!(matches!(resolve_target(CT_ARCHIVE, Some("abc")), Err(Error::UnresolvedTarget(_))));
    }

    #[test]
    fn test_restore_commands() {
        let ct = RestoreTarget { guest_type: GuestType::Container, guest_id: "101".into() };
        assert_eq!(
            restore_command(&ct, "/var/tmp/wolfbackup/a.tar.zst", "local-lvm"),
            "pct restore 101 '/var/tmp/wolfbackup/a.tar.zst' --storage 'local-lvm'"
        );
        let vm = RestoreTarget { guest_type: GuestType::VirtualMachine, guest_id: "200".into() };
        assert_eq!(
            restore_command(&vm, "/var/tmp/wolfbackup/b.vma.zst", "zfs"),
            "qmrestore '/var/tmp/wolfbackup/b.vma.zst' 200 --storage 'zfs'"
        );
    }

    #[tokio::test]
    async fn test_skip_existing_runs_nothing_destructive() {
        let dir = local_dir_with(CT_ARCHIVE);
        // Unscripted commands succeed, so `pct status 101` reports the guest as present
        let shell = FakeShell::new();
        let mut req = request(CT_ARCHIVE);
        req.skip_existing = true;
        req.force = true;

        let outcome = RestoreEngine::new(&shell, None, dir.path()).restore(&req).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::Skipped { target_id: "101".into() });
        assert_eq!(shell.ran("destroy"), 0);
        assert_eq!(shell.ran("restore"), 0);
        assert_eq!(shell.ran("write "), 0);
    }

    #[tokio::test]
    async fn test_existing_without_policy_is_conflict() {
        let dir = local_dir_with(CT_ARCHIVE);
        let shell = FakeShell::new();
        let err = RestoreEngine::new(&shell, None, dir.path()).restore(&request(CT_ARCHIVE)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(ref id) if id == "101"));
        assert_eq!(shell.ran("destroy"), 0);
    }

    #[tokio::test]
    async fn test_fresh_restore_uploads_and_cleans_up() {
        let dir = local_dir_with(CT_ARCHIVE);
        let shell = FakeShell::new().on("status 101", &[], MISSING, 2);

        let outcome = RestoreEngine::new(&shell, None, dir.path()).restore(&request(CT_ARCHIVE)).await.unwrap();

        assert_eq!(outcome.target_id(), "101");
        assert_eq!(shell.ran("write /var/tmp/wolfbackup/vzdump-lxc-101-2024_06_01-03_00_00.tar.zst"), 1);
        assert_eq!(shell.ran("pct restore 101 '/var/tmp/wolfbackup/vzdump-lxc-101"), 1);
        assert!(shell.files.lock().unwrap().is_empty(), "remote temp file left behind");
        // The local tier's own copy is never removed
        assert!(dir.path().join(CT_ARCHIVE).exists());
    }

    #[tokio::test]
    async fn test_force_replaces_existing_vm() {
        let name = "vzdump-qemu-200-2024_06_01-03_00_00.vma.zst";
        let dir = local_dir_with(name);
        let shell = FakeShell::new()
            .on("pct status 200", &[], "does not exist", 2)
            .on("qm destroy 200", &[], "VM 200 does not exist", 2);
        let mut req = request(name);
        req.force = true;

        let outcome = RestoreEngine::new(&shell, None, dir.path()).restore(&req).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored { target_id: "200".into() });
        assert_eq!(shell.ran("qm stop 200"), 1);
        assert_eq!(shell.ran("qm destroy 200 --purge"), 1);
        assert_eq!(shell.ran("qmrestore '/var/tmp/wolfbackup/vzdump-qemu-200"), 1);
    }

    #[tokio::test]
    async fn test_restore_failure_is_reported() {
        let dir = local_dir_with(CT_ARCHIVE);
        let shell = FakeShell::new()
            .on("status 101", &[], MISSING, 2)
            .on("pct restore", &[], "unable to restore CT 101 - storage 'local-lvm' does not support container directories", 25);
        let err = RestoreEngine::new(&shell, None, dir.path()).restore(&request(CT_ARCHIVE)).await.unwrap_err();
        assert!(matches!(err, Error::Command { code: 25, .. }), "{:?}", err);
        assert_eq!(shell.ran("rm -f '/var/tmp/wolfbackup/"), 1);
    }

    #[tokio::test]
    async fn test_missing_local_archive() {
        let dir = tempdir().unwrap();
        let shell = FakeShell::new().on("status", &[], MISSING, 2);
        let err = RestoreEngine::new(&shell, None, dir.path()).restore(&request(CT_ARCHIVE)).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(shell.ran("write "), 0);
    }

    #[tokio::test]
    async fn test_restore_from_webdav_removes_staging() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(|req| {
            Ok(match req.method {
                "PROPFIND" => DavResponse::new(207),
                "GET" => DavResponse::new(200),
                _ => DavResponse::new(404),
            })
        }));
        let webdav = WebDavClient::new(
            WebDavConfig { url: "http://nas".into(), ..Default::default() },
            transport,
        );
        let shell = FakeShell::new().on("status 101", &[], MISSING, 2);
        let mut req = request(CT_ARCHIVE);
        req.source = RestoreSource::WebDav;

        let outcome = RestoreEngine::new(&shell, Some(&webdav), dir.path()).restore(&req).await.unwrap();

        assert_eq!(outcome.target_id(), "101");
        assert_eq!(shell.ran("pct restore 101"), 1);
        assert!(!dir.path().join(".restore").join(CT_ARCHIVE).exists());
    }

    #[tokio::test]
    async fn test_webdav_source_requires_client() {
        let dir = tempdir().unwrap();
        let shell = FakeShell::new().on("status", &[], MISSING, 2);
        let mut req = request(CT_ARCHIVE);
        req.source = RestoreSource::WebDav;
        let err = RestoreEngine::new(&shell, None, dir.path()).restore(&req).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_status_error_is_not_taken_as_absent() {
        let dir = local_dir_with(CT_ARCHIVE);
        let shell = FakeShell::new().on("pct status 101", &[], "bash: pct: command not found", 127);

        let err = RestoreEngine::new(&shell, None, dir.path()).restore(&request(CT_ARCHIVE)).await.unwrap_err();

        assert!(matches!(err, Error::Command { code: 127, .. }), "{:?}", err);
        assert_eq!(shell.ran("qm status"), 0);
        assert_eq!(shell.ran("write "), 0);
        assert_eq!(shell.ran("restore 101"), 0);
    }

    #[tokio::test]
    async fn test_upload_is_retried() {
        let dir = local_dir_with(CT_ARCHIVE);
        let shell = FakeShell::new().on("status 101", &[], MISSING, 2).failing_writes(1);
        let policy = RetryPolicy { max_attempts: 2, interval: std::time::Duration::ZERO };

        let outcome = RestoreEngine::new(&shell, None, dir.path())
            .with_retry(policy)
            .restore(&request(CT_ARCHIVE))
            .await
            .unwrap();

        assert_eq!(outcome.target_id(), "101");
        assert_eq!(shell.ran("write /var/tmp/wolfbackup/"), 2);
        assert_eq!(shell.ran("pct restore 101"), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_removes_remote_staging() {
        let dir = local_dir_with(CT_ARCHIVE);
        let shell = FakeShell::new().on("status 101", &[], MISSING, 2).failing_writes(1);

        let err = RestoreEngine::new(&shell, None, dir.path()).restore(&request(CT_ARCHIVE)).await.unwrap_err();

        assert!(matches!(err, Error::Transfer(_)), "{:?}", err);
        assert_eq!(shell.ran("write "), 1);
        assert_eq!(shell.ran("rm -f '/var/tmp/wolfbackup/vzdump-lxc-101"), 1);
        assert_eq!(shell.ran("pct restore"), 0);
    }
}
