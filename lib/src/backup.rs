//! BackupStore: a per-entry directory of timestamped copies, pruned to a
//! retention bound.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use fn_error_context::context;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::GlobalConfig;
use crate::registry::ConfigEntry;

/// Build the regex that matches valid backup filenames for a given entry's basename.
fn backup_name_pattern(basename: &str) -> anyhow::Result<Regex> {
    let escaped = regex::escape(basename);
    Regex::new(&format!(
        r"^{escaped}\.bak\.(?:[0-9]{{8}}_[0-9]{{6}}|[0-9]{{14}}|[0-9]+)$"
    ))
    .map_err(|e| anyhow::anyhow!("building backup name regex: {e}"))
}

fn basename(entry: &ConfigEntry) -> anyhow::Result<String> {
    entry
        .path
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("entry path {} has no file name", entry.path))
}

/// Create the entry's backup directory (mode `0750`) if it is missing and
/// the global auto-create flag is set; otherwise report it as missing.
pub fn ensure_dir(cfg: &GlobalConfig, entry: &ConfigEntry) -> anyhow::Result<()> {
    if entry.backup_dir.exists() {
        return Ok(());
    }
    if !cfg.auto_create_backups {
        anyhow::bail!("backup directory {} does not exist", entry.backup_dir);
    }
    std::fs::create_dir_all(&entry.backup_dir)?;
    set_mode(&entry.backup_dir, 0o750)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(p: &Utf8Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(p, perms)?;
    Ok(())
}

/// Copy the target file to a new timestamped snapshot, then prune older
/// snapshots beyond `maxBackups`. A no-op if the target file does not exist.
#[context("Snapshotting {}", entry.name)]
pub fn snapshot(cfg: &GlobalConfig, entry: &ConfigEntry) -> anyhow::Result<Option<Utf8PathBuf>> {
    if !entry.path.exists() {
        return Ok(None);
    }
    ensure_dir(cfg, entry)?;
    let base = basename(entry)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let dest = entry.backup_dir.join(format!("{base}.bak.{stamp}"));
    std::fs::copy(&entry.path, &dest)?;
    debug!(entry = entry.name, dest = %dest, "BackupStore: snapshot written");
    prune(cfg, entry)?;
    Ok(Some(dest))
}

/// List every snapshot filename for `entry`, newest-first (descending lexical).
pub fn list(entry: &ConfigEntry) -> anyhow::Result<Vec<String>> {
    if !entry.backup_dir.exists() {
        return Ok(Vec::new());
    }
    let base = basename(entry)?;
    let pattern = backup_name_pattern(&base)?;
    let mut names = Vec::new();
    for dirent in std::fs::read_dir(&entry.backup_dir)? {
        let dirent = dirent?;
        let Ok(name) = dirent.file_name().into_string() else {
            continue;
        };
        if pattern.is_match(&name) {
            names.push(name);
        }
    }
    names.sort_by(|a, b| b.cmp(a));
    Ok(names)
}

fn prune(cfg: &GlobalConfig, entry: &ConfigEntry) -> anyhow::Result<()> {
    let names = list(entry)?;
    for stale in names.iter().skip(cfg.max_backups) {
        let path = entry.backup_dir.join(stale);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path, error = %e, "BackupStore: failed to prune stale snapshot");
        }
    }
    Ok(())
}

/// Validate `filename` against the entry's naming pattern and return its raw bytes.
pub fn read(entry: &ConfigEntry, filename: &str) -> anyhow::Result<Vec<u8>> {
    let base = basename(entry)?;
    let pattern = backup_name_pattern(&base)?;
    if !pattern.is_match(filename) {
        anyhow::bail!("malformed backup filename: {filename}");
    }
    let path = entry.backup_dir.join(filename);
    Ok(std::fs::read(path)?)
}

/// Same filename check as [`read`]; copy the backup over the target path.
/// Meta-application is the caller's responsibility, invoked after this returns.
pub fn restore(entry: &ConfigEntry, filename: &str) -> anyhow::Result<()> {
    let base = basename(entry)?;
    let pattern = backup_name_pattern(&base)?;
    if !pattern.is_match(filename) {
        anyhow::bail!("malformed backup filename: {filename}");
    }
    let src = entry.backup_dir.join(filename);
    std::fs::copy(&src, &entry.path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConfigEntry;
    use std::collections::BTreeMap;

    fn cfg(max_backups: usize) -> GlobalConfig {
        GlobalConfig {
            listen: "127.0.0.1:0".into(),
            ssl_enable: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            api_token: None,
            allowed_ips: vec![],
            allowed_roots: vec![],
            trusted_proxies: vec![],
            allow_origins: vec![],
            logfile: None,
            backup_root: Utf8PathBuf::from("/unused"),
            tmp_dir: Utf8PathBuf::from("/tmp"),
            max_backups,
            path_guard: crate::config::PathGuardMode::Off,
            apply_meta: false,
            auto_create_backups: true,
            systemctl_bin: Utf8PathBuf::from("/usr/bin/systemctl"),
            systemctl_flags: vec![],
        }
    }

    fn entry(dir: &tempfile::TempDir) -> ConfigEntry {
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let target = root.join("svcA.conf");
        let backup_dir = root.join("backups");
        ConfigEntry {
            name: "svcA".into(),
            path: target,
            service: "svcA".into(),
            category: "uncategorized".into(),
            actions: BTreeMap::new(),
            user: None,
            group: None,
            mode: None,
            apply_meta: None,
            backup_dir,
        }
    }

    #[test]
    fn snapshot_and_prune_bounds_retention() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry(&dir);
        let cfg = cfg(2);

        std::fs::write(&e.path, b"v1\n").unwrap();
        snapshot(&cfg, &e).unwrap();
        std::thread::sleep(std::time::Duration::from_secs(1));
        std::fs::write(&e.path, b"v2\n").unwrap();
        snapshot(&cfg, &e).unwrap();
        std::thread::sleep(std::time::Duration::from_secs(1));
        std::fs::write(&e.path, b"v3\n").unwrap();
        snapshot(&cfg, &e).unwrap();

        let names = list(&e).unwrap();
        assert_eq!(names.len(), 2);
        // newest-first
        assert!(names[0] > names[1]);
    }

    #[test]
    fn read_rejects_malformed_filename() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry(&dir);
        std::fs::create_dir_all(&e.backup_dir).unwrap();
        let err = read(&e, "svcA.conf.bak.not-a-stamp").unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn restore_copies_backup_onto_target() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry(&dir);
        let cfg = cfg(5);
        std::fs::write(&e.path, b"old\n").unwrap();
        let backup = snapshot(&cfg, &e).unwrap().unwrap();
        std::fs::write(&e.path, b"new\n").unwrap();
        let filename = backup.file_name().unwrap();
        restore(&e, filename).unwrap();
        assert_eq!(std::fs::read(&e.path).unwrap(), b"old\n");
    }
}
