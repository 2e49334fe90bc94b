// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Instance configuration — one remote Proxmox host per config file
//!
//! Persisted as TOML at /etc/wolfbackup/config.toml. Keys are camelCase so the
//! file mirrors the option names the plugin form exposes (`backup.keepCount`,
//! `retry.intervalSeconds`, ...).

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wolfbackup/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub ssh: SshConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub webdav: WebDavConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub username: String,
    /// Password auth (needs sshpass on this machine)
    #[serde(default)]
    pub password: Option<String>,
    /// Private key auth, takes precedence over password
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_ssh_port() -> u16 { 22 }
fn default_ssh_user() -> String { "root".to_string() }
fn default_connect_timeout() -> u64 { 10 }

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "root".to_string(),
            password: None,
            key_file: None,
            connect_timeout_seconds: 10,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.max(1))
    }
}

/// What happens to archives vzdump produced but the latest-only policy did not download
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnselectedArchives {
    /// Leave them on the host untouched
    #[default]
    Retain,
    /// Remove them from the host once the selected archive is downloaded
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Empty means "every VM, or every container if there are no VMs"
    #[serde(default, deserialize_with = "guest_ids_from_list_or_csv")]
    pub guest_ids: Vec<String>,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
    #[serde(default)]
    pub delete_after_download: bool,
    #[serde(default = "default_true")]
    pub download_all: bool,
    #[serde(default)]
    pub unselected_archives: UnselectedArchives,
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
    /// Daily run time (HH:MM) for daemon mode
    #[serde(default)]
    pub schedule: Option<String>,
}

fn default_storage() -> String { "local".to_string() }
fn default_mode() -> String { "snapshot".to_string() }
fn default_compression() -> String { "zstd".to_string() }
fn default_keep_count() -> usize { 3 }
fn default_true() -> bool { true }
fn default_local_dir() -> PathBuf { PathBuf::from("/var/lib/wolfbackup/archives") }

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            guest_ids: Vec::new(),
            storage: default_storage(),
            mode: default_mode(),
            compression: default_compression(),
            keep_count: default_keep_count(),
            delete_after_download: false,
            download_all: true,
            unselected_archives: UnselectedArchives::Retain,
            local_dir: default_local_dir(),
            schedule: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_webdav_path")]
    pub path: String,
    #[serde(default = "default_webdav_keep")]
    pub keep_count: usize,
}

fn default_webdav_path() -> String { "/pve-backups".to_string() }
fn default_webdav_keep() -> usize { 7 }

impl Default for WebDavConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            path: default_webdav_path(),
            keep_count: default_webdav_keep(),
        }
    }
}

impl WebDavConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreConfig {
    #[serde(default = "default_restore_storage")]
    pub storage: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub skip_existing: bool,
}

fn default_restore_storage() -> String { "local-lvm".to_string() }

impl Default for RestoreConfig {
    fn default() -> Self {
        Self { storage: default_restore_storage(), force: false, skip_existing: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_retry_count")]
    pub count: u32,
    #[serde(default = "default_retry_interval")]
    pub interval_seconds: u64,
}

fn default_retry_count() -> u32 { 3 }
fn default_retry_interval() -> u64 { 30 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self { count: default_retry_count(), interval_seconds: default_retry_interval() }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.count.max(1),
            interval: Duration::from_secs(self.interval_seconds),
        }
    }
}

/// Notification channels, all optional. Log output is always produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyConfig {
    #[serde(default)]
    pub discord_webhook: String,
    #[serde(default)]
    pub slack_webhook: String,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
}

impl NotifyConfig {
    pub fn has_channels(&self) -> bool {
        !self.discord_webhook.is_empty()
            || !self.slack_webhook.is_empty()
            || (!self.telegram_bot_token.is_empty() && !self.telegram_chat_id.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateConfig {
    /// Where history lists are persisted
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf { PathBuf::from("/var/lib/wolfbackup") }

impl Default for StateConfig {
    fn default() -> Self {
        Self { dir: default_state_dir() }
    }
}

/// Accept `guestIds = ["101", 102]` as well as the form field style `guestIds = "101,102"`
fn guest_ids_from_list_or_csv<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Ids {
        Csv(String),
        List(Vec<Id>),
    }

    let ids = match Ids::deserialize(deserializer)? {
        Ids::Csv(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Ids::List(list) => list
            .into_iter()
            .map(|id| match id {
                Id::Text(s) => s.trim().to_string(),
                Id::Number(n) => n.to_string(),
            })
            .filter(|p| !p.is_empty())
            .collect(),
    };
    Ok(ids)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ssh.host.trim().is_empty() {
            return Err(Error::config("ssh.host is required"));
        }
        if self.ssh.password.is_none() && self.ssh.key_file.is_none() {
            return Err(Error::config("either ssh.password or ssh.keyFile must be set"));
        }
        if let Some(bad) = self.backup.guest_ids.iter().find(|id| !id.chars().all(|c| c.is_ascii_digit())) {
            return Err(Error::config(format!("backup.guestIds contains a non-numeric id: {}", bad)));
        }
        if self.backup.keep_count == 0 {
            return Err(Error::config("backup.keepCount must be at least 1"));
        }
        if self.webdav.is_enabled() {
            if !self.webdav.url.starts_with("http://") && !self.webdav.url.starts_with("https://") {
                return Err(Error::config("webdav.url must start with http:// or https://"));
            }
            if self.webdav.keep_count == 0 {
                return Err(Error::config("webdav.keepCount must be at least 1"));
            }
        }
        if let Some(time) = &self.backup.schedule {
            if chrono::NaiveTime::parse_from_str(time, "%H:%M").is_err() {
                return Err(Error::config(format!("backup.schedule must be HH:MM, got '{}'", time)));
            }
        }
        Ok(())
    }
}
