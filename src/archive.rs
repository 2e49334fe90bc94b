// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! vzdump archive naming — parsing filenames and vzdump output
//!
//! Archives follow `vzdump-{lxc|qemu}-{vmid}-{YYYY_MM_DD-HH_MM_SS}.{tar|vma}[.zst|.gz|.lzo]`.
//! Older hosts write the time part without underscores (`030000`).

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// `<prefix>-<kind>-<vmid>-<timestamp>.<ext>`
pub const ARCHIVE_NAME_PATTERN: &str =
    r"^(?P<prefix>[A-Za-z0-9_.]+)-(?P<kind>lxc|openvz|qemu)-(?P<id>\d+)-";

/// `2024_06_01-03_00_00` or `2024_06_01-030000`
pub const ARCHIVE_TIMESTAMP_PATTERN: &str =
    r"(\d{4})_(\d{2})_(\d{2})-(\d{2})_?(\d{2})_?(\d{2})";

/// vzdump progress line announcing the archive it writes
pub const CREATING_ARCHIVE_PATTERN: &str = r"creating (?:vzdump )?archive '([^']+)'";

/// Extensions vzdump produces, longest first so suffix matching is unambiguous
pub const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.zst", ".tar.gz", ".tar.lzo", ".tgz", ".tar",
    ".vma.zst", ".vma.gz", ".vma.lzo", ".vma",
];

static ARCHIVE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ARCHIVE_NAME_PATTERN).expect("archive name pattern"));
static ARCHIVE_TIMESTAMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ARCHIVE_TIMESTAMP_PATTERN).expect("archive timestamp pattern"));
static CREATING_ARCHIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CREATING_ARCHIVE_PATTERN).expect("creating archive pattern"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum GuestType {
    Container,
    VirtualMachine,
}

impl std::fmt::Display for GuestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::VirtualMachine => write!(f, "virtual-machine"),
        }
    }
}

impl GuestType {
    /// The Proxmox CLI that manages this guest type
    pub fn cli(&self) -> &'static str {
        match self {
            Self::Container => "pct",
            Self::VirtualMachine => "qm",
        }
    }
}

/// What a vzdump filename tells us about its guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub guest_type: GuestType,
    pub guest_id: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An archive sitting somewhere we can list: the WebDAV tier or a local directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArchive {
    pub path: String,
    pub name: String,
    pub guest_type: Option<GuestType>,
    pub guest_id: Option<String>,
    /// From the filename, or the storage's modification time when the name has none
    pub timestamp: DateTime<Utc>,
    /// Modification time as reported by the storage
    pub modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl RemoteArchive {
    pub fn new(path: impl Into<String>, name: &str, modified: Option<DateTime<Utc>>, size: Option<u64>) -> Self {
        let parsed = parse_archive_name(name);
        Self {
            path: path.into(),
            name: name.to_string(),
            guest_type: parsed.as_ref().map(|p| p.guest_type),
            guest_id: parsed.as_ref().map(|p| p.guest_id.clone()),
            timestamp: timestamp_from_name(name)
                .or(modified)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            modified,
            size,
        }
    }
}

pub fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Last path component of a remote or local path
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

pub fn parse_archive_name(name: &str) -> Option<ArchiveName> {
    let name = base_name(name);
    let caps = ARCHIVE_NAME_RE.captures(name)?;
    let guest_type = match &caps["kind"] {
        "lxc" | "openvz" => GuestType::Container,
        _ => GuestType::VirtualMachine,
    };
    Some(ArchiveName {
        guest_type,
        guest_id: caps["id"].to_string(),
        timestamp: timestamp_from_name(name),
    })
}

/// vzdump stamps names in the host's local time; we treat it as UTC since only ordering matters
pub fn timestamp_from_name(name: &str) -> Option<DateTime<Utc>> {
    let caps = ARCHIVE_TIMESTAMP_RE.captures(base_name(name))?;
    let num = |i: usize| caps[i].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(caps[1].parse().ok()?, num(2)?, num(3)?)?;
    let time: NaiveDateTime = date.and_hms_opt(num(4)?, num(5)?, num(6)?)?;
    Some(Utc.from_utc_datetime(&time))
}

/// Extract the archive path from one line of vzdump output
pub fn archive_path_from_line(line: &str) -> Option<String> {
    CREATING_ARCHIVE_RE.captures(line).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_container_archive_name() {
        let parsed = parse_archive_name("vzdump-lxc-105-2024_01_01-00_00_00.tar.zst").unwrap();
        assert_eq!(parsed.guest_id, "105");
        assert_eq!(parsed.guest_type, GuestType::Container);
        assert_eq!(parsed.guest_type.to_string(), "container");
        let ts = parsed.timestamp.unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 1, 1));
    }

    #[test]
    fn test_vm_archive_name() {
        let parsed = parse_archive_name("vzdump-qemu-210-2024_03_15-22_10_05.vma.zst").unwrap();
        assert_eq!(parsed.guest_id, "210");
        assert_eq!(parsed.guest_type, GuestType::VirtualMachine);
        assert_eq!(parsed.guest_type.to_string(), "virtual-machine");
        assert_eq!(parsed.guest_type.cli(), "qm");
    }

    #[test]
    fn test_full_path_and_compact_time() {
        let parsed = parse_archive_name("/dump/vzdump-lxc-101-2024_06_01-030000.tar.zst").unwrap();
        assert_eq!(parsed.guest_id, "101");
        let ts = parsed.timestamp.unwrap();
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (3, 0, 0));
    }

    #[test]
    fn test_unrelated_names() {
        assert!(parse_archive_name("notes.txt").is_none());
        assert!(parse_archive_name("vzdump-docker-1-2024_01_01-00_00_00.tar").is_none());
        assert!(timestamp_from_name("vzdump-lxc-1-latest.tar.zst").is_none());
        assert!(timestamp_from_name("vzdump-lxc-1-2024_13_40-00_00_00.tar").is_none());
    }

    #[test]
    fn test_archive_extensions() {
        assert!(is_archive_name("vzdump-qemu-100-2024_01_01-00_00_00.vma.zst"));
        assert!(is_archive_name("vzdump-lxc-100-2024_01_01-00_00_00.tar.gz"));
        assert!(is_archive_name("VZDUMP-LXC-100.TAR.ZST"));
        assert!(!is_archive_name("vzdump-lxc-100-2024_01_01-00_00_00.log"));
        assert!(!is_archive_name("vzdump-lxc-100-2024_01_01-00_00_00.tar.zst.notes"));
    }

    #[test]
    fn test_creating_archive_line() {
        assert_eq!(
            archive_path_from_line("INFO: creating archive '/dump/vzdump-lxc-101-2024_06_01-030000.tar.zst'"),
            Some("/dump/vzdump-lxc-101-2024_06_01-030000.tar.zst".to_string())
        );
        assert_eq!(
            archive_path_from_line("INFO: creating vzdump archive '/var/lib/vz/dump/vzdump-qemu-100-2024_06_01-03_00_00.vma.zst'"),
            Some("/var/lib/vz/dump/vzdump-qemu-100-2024_06_01-03_00_00.vma.zst".to_string())
        );
        assert_eq!(archive_path_from_line("INFO: status: 45%"), None);
    }

    #[test]
    fn test_remote_archive_falls_back_to_modified_time() {
        let modified = Utc.with_ymd_and_hms(2023, 5, 5, 5, 5, 5).unwrap();
        let stamped = RemoteArchive::new("/d/a", "vzdump-lxc-9-2024_01_02-03_04_05.tar.zst", Some(modified), None);
        assert_eq!(stamped.timestamp, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(stamped.guest_id.as_deref(), Some("9"));
        let unstamped = RemoteArchive::new("/d/b", "manual-copy.tar.zst", Some(modified), Some(10));
        assert_eq!(unstamped.timestamp, modified);
        assert_eq!(unstamped.guest_type, None);
        let bare = RemoteArchive::new("/d/c", "manual.tar", None, None);
        assert_eq!(bare.timestamp, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/a/b/c.tar"), "c.tar");
        assert_eq!(base_name("c.tar"), "c.tar");
        assert_eq!(base_name("/dav/dir/"), "dir");
    }
}
