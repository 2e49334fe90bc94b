// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Retention — keep the N most recent archives, delete the rest
//!
//! The same selection runs over the local archive directory and the WebDAV
//! listing. Deleting is best-effort: one file that will not go away is logged
//! and skipped so the rest of the pass still happens.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::archive::{RemoteArchive, is_archive_name};
use crate::error::Result;

/// Sort newest first and return everything past `keep_count`
pub fn select_expired<T, F>(mut items: Vec<T>, keep_count: usize, timestamp: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.sort_by(|a, b| timestamp(b).cmp(&timestamp(a)));
    if items.len() <= keep_count {
        return Vec::new();
    }
    items.split_off(keep_count)
}

/// List archives in a local directory, timestamped from the name or the file mtime
pub fn list_local(dir: &Path) -> Result<Vec<RemoteArchive>> {
    let mut archives = Vec::new();
    if !dir.exists() {
        return Ok(archives);
    }
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_file() || !is_archive_name(&name) {
            continue;
        }
        let meta = entry.metadata().ok();
        let modified = meta.as_ref()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        archives.push(RemoteArchive::new(
            path.to_string_lossy().to_string(),
            &name,
            modified,
            meta.map(|m| m.len()),
        ));
    }
    Ok(archives)
}

/// Enforce `keep_count` on a local directory, returning how many files were removed
pub fn prune_local(dir: &Path, keep_count: usize) -> Result<usize> {
    let archives = list_local(dir)?;
    let total = archives.len();
    let expired = select_expired(archives, keep_count, |a| a.timestamp);
    let mut deleted = 0;
    for archive in &expired {
        match fs::remove_file(&archive.path) {
            Ok(()) => {
                deleted += 1;
                // vzdump writes a .log (and sometimes .notes) next to each archive
                remove_sidecars(Path::new(&archive.path));
            }
            Err(e) => warn!("Failed to delete old backup {}: {}", archive.path, e),
        }
    }
    if deleted > 0 {
        info!("Pruned {} of {} local backups in {} (keeping {})", deleted, total, dir.display(), keep_count);
    }
    Ok(deleted)
}

fn remove_sidecars(archive: &Path) {
    let name = archive.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let _ = fs::remove_file(archive.with_file_name(format!("{}.notes", name)));
    if let Some(stem) = crate::archive::ARCHIVE_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
    {
        let _ = fs::remove_file(archive.with_file_name(format!("{}.log", stem)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    #[test]
    fn test_select_expired_keeps_most_recent() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let items: Vec<(u32, DateTime<Utc>)> = (0..6)
            .map(|i| (i, base + Duration::days(i as i64)))
            .collect();
        let mut expired: Vec<u32> = select_expired(items, 2, |(_, t)| *t)
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        expired.sort();
        assert_eq!(expired, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_select_expired_under_limit() {
        let now = Utc::now();
        assert!(select_expired(vec![now, now], 5, |t| *t).is_empty());
        assert!(select_expired(Vec::<DateTime<Utc>>::new(), 1, |t| *t).is_empty());
    }

    #[test]
    fn test_prune_local_by_filename_timestamp() {
        let dir = tempdir().unwrap();
        let names = [
            "vzdump-lxc-101-2024_01_01-03_00_00.tar.zst",
            "vzdump-lxc-101-2024_01_03-03_00_00.tar.zst",
            "vzdump-qemu-200-2024_01_02-03_00_00.vma.zst",
            "vzdump-lxc-101-2024_01_04-03_00_00.tar.zst",
            "vzdump-lxc-101-2024_01_05-03_00_00.tar.zst",
        ];
        for name in names {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::write(dir.path().join("vzdump-lxc-101-2024_01_01-03_00_00.log"), b"log").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"keep me").unwrap();

        let deleted = prune_local(dir.path(), 3).unwrap();

        assert_eq!(deleted, 2);
        let mut left: Vec<String> = std::fs::read_dir(dir.path()).unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec![
            "readme.txt",
            "vzdump-lxc-101-2024_01_03-03_00_00.tar.zst",
            "vzdump-lxc-101-2024_01_04-03_00_00.tar.zst",
            "vzdump-lxc-101-2024_01_05-03_00_00.tar.zst",
        ]);
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = tempdir().unwrap();
        assert_eq!(prune_local(&dir.path().join("absent"), 1).unwrap(), 0);
    }
}
