// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Task orchestration — one backup or restore from trigger to history record
//!
//! Each entry point takes its coordinator lock first; a trigger that loses
//! the race is dropped without touching the host or the history. A task that
//! does run ends in exactly one history record and one notification, written
//! while its lock is still held.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::archive::{RemoteArchive, base_name};
use crate::backup::{BackupCreator, BackupRequest};
use crate::config::Config;
use crate::coordinator::TaskCoordinator;
use crate::error::{Error, Result};
use crate::history::{BackupRecord, HistoryStore, JsonFileStore, RestoreRecord};
use crate::notify::{self, Notifier, Severity};
use crate::remote::{Connector, RemoteShell, SshConnector, shell_quote};
use crate::restore::{RestoreEngine, RestoreOutcome, RestoreRequest, resolve_target};
use crate::retention::{list_local, prune_local};
use crate::retry::retry;
use crate::transfer::{self, log_progress};
use crate::webdav::WebDavClient;
use crate::webdav::transport::{DavTransport, ReqwestTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Idle,
    Acquiring,
    Connecting,
    Executing,
    Transferring,
    Cleaning,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Backup,
    Restore,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// Lost the race for the lock: no remote command, no history record
    Dropped,
    Done(T),
    Skipped(T),
    Failed(Error),
}

impl<T> TaskOutcome<T> {
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub guest_ids: Vec<String>,
    /// Local copies of the downloaded archives
    pub archives: Vec<PathBuf>,
    /// WebDAV URLs that accepted an upload
    pub uploaded: Vec<String>,
    /// Secondary failures that did not undo the local backup
    pub warnings: Vec<String>,
}

/// Archives available to restore, newest first
#[derive(Debug, Clone, Default)]
pub struct ArchiveListing {
    pub local: Vec<RemoteArchive>,
    pub webdav: Vec<RemoteArchive>,
    /// Set when the WebDAV tier is configured but could not be listed
    pub webdav_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub local_deleted: usize,
    pub webdav_deleted: usize,
}

pub struct Engine {
    config: Config,
    coordinator: TaskCoordinator,
    history: HistoryStore,
    notifier: Arc<dyn Notifier>,
    connector: Arc<dyn Connector>,
    dav_transport: Arc<dyn DavTransport>,
    backup_phase: Mutex<TaskPhase>,
    restore_phase: Mutex<TaskPhase>,
}

impl Engine {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        dav_transport: Arc<dyn DavTransport>,
        history: HistoryStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            coordinator: TaskCoordinator::new(),
            history,
            notifier,
            connector,
            dav_transport,
            backup_phase: Mutex::new(TaskPhase::Idle),
            restore_phase: Mutex::new(TaskPhase::Idle),
        }
    }

    /// Production wiring: system ssh, reqwest, JSON history under `state.dir`
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new().map_err(|e| Error::webdav(e.to_string()))?;
        let history = HistoryStore::new(Arc::new(JsonFileStore::new(config.state.dir.clone())));
        let notifier: Arc<dyn Notifier> = Arc::from(notify::from_config(&config.notify));
        Ok(Self::new(config, Arc::new(SshConnector), Arc::new(transport), history, notifier))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.coordinator
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn phase(&self, kind: TaskKind) -> TaskPhase {
        let slot = match kind {
            TaskKind::Backup => &self.backup_phase,
            TaskKind::Restore => &self.restore_phase,
        };
        *slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, kind: TaskKind, phase: TaskPhase) {
        let slot = match kind {
            TaskKind::Backup => &self.backup_phase,
            TaskKind::Restore => &self.restore_phase,
        };
        let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
        debug!("{} task: {:?} -> {:?}", kind, *current, phase);
        *current = phase;
    }

    /// A fresh client per task, so endpoint negotiation happens once per run
    fn webdav_client(&self) -> Option<WebDavClient> {
        self.config.webdav.is_enabled()
            .then(|| WebDavClient::new(self.config.webdav.clone(), self.dav_transport.clone()))
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteShell>> {
        let policy = self.config.retry.policy();
        let connector = &self.connector;
        let ssh = &self.config.ssh;
        retry(&policy, "SSH connect", move |_| async move { connector.connect(ssh).await }).await
    }

    // ─── Backup ───

    pub async fn run_backup(&self) -> TaskOutcome<BackupSummary> {
        let Some(_guard) = self.coordinator.backup_guard() else {
            info!("Backup trigger dropped: a backup or restore is already active");
            return TaskOutcome::Dropped;
        };
        self.set_phase(TaskKind::Backup, TaskPhase::Acquiring);
        let started = Utc::now();
        let mut guest_ids = self.config.backup.guest_ids.clone();

        let result = self.backup_flow(&mut guest_ids).await;

        match result {
            Ok(summary) => {
                let names: Vec<String> = summary.archives.iter()
                    .map(|p| base_name(&p.to_string_lossy()).to_string())
                    .collect();
                let mut message = format!("Backed up {} archive(s): {}", names.len(), names.join(", "));
                if !summary.warnings.is_empty() {
                    message.push_str(&format!(" (warnings: {})", summary.warnings.join("; ")));
                }
                self.record_backup(BackupRecord {
                    timestamp: started,
                    success: true,
                    filenames: names,
                    message: message.clone(),
                    guest_ids: summary.guest_ids.clone(),
                });
                let severity = if summary.warnings.is_empty() { Severity::Success } else { Severity::Warning };
                self.notifier.notify("Backup complete", &message, severity).await;
                self.set_phase(TaskKind::Backup, TaskPhase::Done);
                TaskOutcome::Done(summary)
            }
            Err(e) => {
                self.record_backup(BackupRecord {
                    timestamp: started,
                    success: false,
                    filenames: Vec::new(),
                    message: e.to_string(),
                    guest_ids,
                });
                self.notifier.notify("Backup failed", &e.to_string(), Severity::Error).await;
                self.set_phase(TaskKind::Backup, TaskPhase::Failed);
                TaskOutcome::Failed(e)
            }
        }
    }

    fn record_backup(&self, record: BackupRecord) {
        if let Err(e) = self.history.record_backup(record) {
            error!("Failed to write backup history: {}", e);
        }
    }

    /// `guest_ids` ends up holding the guests this run targeted, discovered or configured
    async fn backup_flow(&self, guest_ids: &mut Vec<String>) -> Result<BackupSummary> {
        self.set_phase(TaskKind::Backup, TaskPhase::Connecting);
        let shell = self.connect().await?;
        let result = self.backup_on(shell.as_ref(), guest_ids).await;
        shell.close().await;
        result
    }

    async fn backup_on(&self, shell: &dyn RemoteShell, guest_ids: &mut Vec<String>) -> Result<BackupSummary> {
        let policy = self.config.retry.policy();
        let cfg = &self.config.backup;

        self.set_phase(TaskKind::Backup, TaskPhase::Executing);
        let mut request = BackupRequest::from_config(cfg);
        if request.guest_ids.is_empty() {
            request.guest_ids = retry(&policy, "Guest discovery", move |_| async move {
                BackupCreator::new(shell).discover_guests().await
            }).await?;
        }
        guest_ids.clone_from(&request.guest_ids);
        let req = &request;
        let created = retry(&policy, "vzdump", move |_| async move {
            BackupCreator::new(shell).create(req).await
        }).await?;

        if !created.unselected.is_empty() {
            debug!("{} archive(s) not selected for download", created.unselected.len());
        }

        self.set_phase(TaskKind::Backup, TaskPhase::Transferring);
        tokio::fs::create_dir_all(&cfg.local_dir).await?;
        let mut summary = BackupSummary { guest_ids: created.guest_ids.clone(), ..Default::default() };
        for remote in &created.archives {
            let local = cfg.local_dir.join(base_name(remote));
            self.download_archive(shell, remote, &local).await?;
            summary.archives.push(local);
        }

        let webdav = self.webdav_client();
        if let Some(webdav) = &webdav {
            for local in &summary.archives {
                let name = base_name(&local.to_string_lossy()).to_string();
                match webdav.upload(local, &name).await {
                    Ok(url) => summary.uploaded.push(url),
                    Err(e) => {
                        warn!("WebDAV upload of {} failed, local copy kept: {}", name, e);
                        summary.warnings.push(format!("WebDAV upload of {} failed: {}", name, e));
                    }
                }
            }
        }

        self.set_phase(TaskKind::Backup, TaskPhase::Cleaning);
        if cfg.delete_after_download {
            for remote in &created.archives {
                self.delete_remote(shell, remote, &mut summary.warnings).await;
            }
        }
        match prune_local(&cfg.local_dir, cfg.keep_count) {
            Ok(_) => {}
            Err(e) => summary.warnings.push(format!("Local retention failed: {}", e)),
        }
        if let Some(webdav) = webdav.as_ref().filter(|_| !summary.uploaded.is_empty()) {
            if let Err(e) = webdav.cleanup(self.config.webdav.keep_count).await {
                summary.warnings.push(format!("WebDAV retention failed: {}", e));
            }
        }
        Ok(summary)
    }

    async fn download_archive(&self, shell: &dyn RemoteShell, remote: &str, local: &Path) -> Result<()> {
        let policy = self.config.retry.policy();
        let label = format!("Download {}", base_name(remote));
        let label_ref = label.as_str();
        let stats = retry(&policy, label_ref, move |_| async move {
            let mut progress = log_progress(label_ref.to_string());
            transfer::download(shell, remote, local, &mut progress).await
        }).await?;
        if stats.stalled {
            warn!("{} stalled at least once but completed", label);
        }
        info!("Downloaded {} ({} bytes) to {}", base_name(remote), stats.bytes, local.display());
        Ok(())
    }

    async fn delete_remote(&self, shell: &dyn RemoteShell, remote: &str, warnings: &mut Vec<String>) {
        let stem = crate::archive::ARCHIVE_EXTENSIONS
            .iter()
            .find_map(|ext| remote.strip_suffix(ext))
            .unwrap_or(remote);
        let command = format!("rm -f {} {}", shell_quote(remote), shell_quote(&format!("{}.log", stem)));
        match shell.exec(&command).await {
            Ok(out) if out.success() => info!("Deleted {} from the host", remote),
            Ok(out) => warnings.push(format!("Could not delete {} on host: {}", remote, out.stderr.trim())),
            Err(e) => warnings.push(format!("Could not delete {} on host: {}", remote, e)),
        }
    }

    // ─── Restore ───

    pub async fn run_restore(&self, request: RestoreRequest) -> TaskOutcome<String> {
        let Some(_guard) = self.coordinator.restore_guard() else {
            info!("Restore trigger dropped: a backup or restore is already active");
            return TaskOutcome::Dropped;
        };
        self.set_phase(TaskKind::Restore, TaskPhase::Acquiring);
        let started = Utc::now();
        let filename = base_name(&request.filename).to_string();

        let result = self.restore_flow(&request).await;

        match result {
            Ok(outcome) => {
                let target_id = outcome.target_id().to_string();
                let skipped = matches!(outcome, RestoreOutcome::Skipped { .. });
                let (title, message, severity, phase) = if skipped {
                    let message = format!("Guest {} already exists, {} not restored", target_id, filename);
                    ("Restore skipped", message, Severity::Info, TaskPhase::Skipped)
                } else {
                    let message = format!("Restored {} as guest {}", filename, target_id);
                    ("Restore complete", message, Severity::Success, TaskPhase::Done)
                };
                self.record_restore(RestoreRecord {
                    timestamp: started,
                    success: true,
                    filename,
                    target_id: Some(target_id.clone()),
                    message: message.clone(),
                });
                self.notifier.notify(title, &message, severity).await;
                self.set_phase(TaskKind::Restore, phase);
                if skipped { TaskOutcome::Skipped(target_id) } else { TaskOutcome::Done(target_id) }
            }
            Err(e) => {
                let target_id = resolve_target(&filename, request.target_id.as_deref())
                    .ok()
                    .map(|t| t.guest_id);
                self.record_restore(RestoreRecord {
                    timestamp: started,
                    success: false,
                    filename,
                    target_id,
                    message: e.to_string(),
                });
                self.notifier.notify("Restore failed", &e.to_string(), Severity::Error).await;
                self.set_phase(TaskKind::Restore, TaskPhase::Failed);
                TaskOutcome::Failed(e)
            }
        }
    }

    fn record_restore(&self, record: RestoreRecord) {
        if let Err(e) = self.history.record_restore(record) {
            error!("Failed to write restore history: {}", e);
        }
    }

    async fn restore_flow(&self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        self.set_phase(TaskKind::Restore, TaskPhase::Connecting);
        let shell = self.connect().await?;
        self.set_phase(TaskKind::Restore, TaskPhase::Executing);
        let webdav = self.webdav_client();
        let result = RestoreEngine::new(shell.as_ref(), webdav.as_ref(), &self.config.backup.local_dir)
            .with_retry(self.config.retry.policy())
            .restore(request)
            .await;
        shell.close().await;
        result
    }

    /// A restore request filled from the `restore` config section
    pub fn restore_request(&self, filename: &str, source: crate::restore::RestoreSource) -> RestoreRequest {
        RestoreRequest {
            filename: filename.to_string(),
            source,
            target_id: None,
            storage: self.config.restore.storage.clone(),
            force: self.config.restore.force,
            skip_existing: self.config.restore.skip_existing,
        }
    }

    // ─── Listing ───

    /// Read-only, so it takes no lock
    pub async fn list_archives(&self) -> Result<ArchiveListing> {
        let mut listing = ArchiveListing {
            local: list_local(&self.config.backup.local_dir)?,
            ..Default::default()
        };
        if let Some(webdav) = self.webdav_client() {
            match webdav.list().await {
                Ok(archives) => listing.webdav = archives,
                Err(e) => listing.webdav_error = Some(e.to_string()),
            }
        }
        listing.local.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        listing.webdav.sort_by(|a, b| b.modified.unwrap_or(b.timestamp).cmp(&a.modified.unwrap_or(a.timestamp)));
        Ok(listing)
    }

    // ─── Retention on demand ───

    /// Apply both retention policies outside a backup; shares the backup lock
    pub async fn prune(&self) -> TaskOutcome<PruneSummary> {
        let Some(_guard) = self.coordinator.backup_guard() else {
            info!("Prune dropped: a backup or restore is active");
            return TaskOutcome::Dropped;
        };
        let cfg = &self.config;
        let local_deleted = match prune_local(&cfg.backup.local_dir, cfg.backup.keep_count) {
            Ok(n) => n,
            Err(e) => return TaskOutcome::Failed(e),
        };
        let webdav_deleted = match self.webdav_client() {
            Some(webdav) => match webdav.cleanup(cfg.webdav.keep_count).await {
                Ok(n) => n,
                Err(e) => return TaskOutcome::Failed(e),
            },
            None => 0,
        };
        info!("Prune finished: {} local, {} WebDAV archives removed", local_deleted, webdav_deleted);
        TaskOutcome::Done(PruneSummary { local_deleted, webdav_deleted })
    }
}
