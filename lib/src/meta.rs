//! MetaEnforcer: after a write or restore, set owner, group, and mode to
//! declared values.

use camino::Utf8Path;
use rustix::fs::{chmod, chown, Gid, Mode, Uid};
use tracing::warn;

use crate::config::GlobalConfig;
use crate::registry::ConfigEntry;

/// The observed result of applying (or skipping) metadata enforcement,
/// reported back to the client truthfully regardless of whether the
/// underlying chown/chmod calls succeeded.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppliedMeta {
    /// Resolved UID, if ownership was touched.
    pub uid: Option<u32>,
    /// Resolved GID, if group was touched.
    pub gid: Option<u32>,
    /// Applied mode bits, if mode was touched.
    pub mode: Option<u32>,
}

fn should_apply(cfg: &GlobalConfig, entry: &ConfigEntry) -> bool {
    if let Some(v) = entry.apply_meta {
        return v;
    }
    if cfg.apply_meta {
        return true;
    }
    entry.user.is_some() || entry.group.is_some() || entry.mode.is_some()
}

fn parse_mode(s: &str) -> anyhow::Result<u32> {
    if !(s.len() == 3 || s.len() == 4) || !s.chars().all(|c| c.is_digit(8)) {
        anyhow::bail!("invalid mode {s:?}: expected 3 or 4 octal digits");
    }
    u32::from_str_radix(s, 8).map_err(|e| anyhow::anyhow!("invalid mode {s:?}: {e}"))
}

// Safety: getpwnam returns a pointer into a static buffer owned by libc;
// it is read immediately and never stored or returned.
#[allow(unsafe_code)]
fn resolve_user(name: &str) -> anyhow::Result<u32> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    let cname = std::ffi::CString::new(name)?;
    let pwd = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pwd.is_null() {
        anyhow::bail!("unknown user {name:?}");
    }
    Ok(unsafe { (*pwd).pw_uid })
}

// Safety: getgrnam returns a pointer into a static buffer owned by libc;
// it is read immediately and never stored or returned.
#[allow(unsafe_code)]
fn resolve_group(name: &str) -> anyhow::Result<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    let cname = std::ffi::CString::new(name)?;
    let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
    if grp.is_null() {
        anyhow::bail!("unknown group {name:?}");
    }
    Ok(unsafe { (*grp).gr_gid })
}

fn is_symlink(p: &Utf8Path) -> bool {
    std::fs::symlink_metadata(p)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn stat_owner(path: &Utf8Path) -> (Option<u32>, Option<u32>, Option<u32>) {
    match std::fs::metadata(path) {
        Ok(meta) => {
            use std::os::unix::fs::MetadataExt;
            (
                Some(meta.uid()),
                Some(meta.gid()),
                Some(meta.mode() & 0o7777),
            )
        }
        Err(_) => (None, None, None),
    }
}

/// No-op unless the per-entry override, the global flag, or a declared
/// `user`/`group`/`mode` says so. Errors are logged as warnings, never
/// elevated to the enclosing request — the file write already succeeded
/// by the time this runs. Returns the post-attempt observed
/// ownership/mode regardless of outcome.
pub fn apply(cfg: &GlobalConfig, entry: &ConfigEntry, path: &Utf8Path) -> AppliedMeta {
    if !should_apply(cfg, entry) {
        let (uid, gid, mode) = stat_owner(path);
        return AppliedMeta { uid, gid, mode };
    }
    if is_symlink(path) {
        warn!(path = %path, "MetaEnforcer: refusing to touch symlink target");
        let (uid, gid, mode) = stat_owner(path);
        return AppliedMeta { uid, gid, mode };
    }

    let uid = match &entry.user {
        Some(u) => match resolve_user(u) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path = %path, error = %e, "MetaEnforcer: user resolution failed");
                None
            }
        },
        None => None,
    };
    let gid = match &entry.group {
        Some(g) => match resolve_group(g) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path = %path, error = %e, "MetaEnforcer: group resolution failed");
                None
            }
        },
        None => None,
    };

    if uid.is_some() || gid.is_some() {
        let ouid = uid.map(Uid::from_raw);
        let ogid = gid.map(Gid::from_raw);
        if let Err(e) = chown(path.as_std_path(), ouid, ogid) {
            warn!(path = %path, error = %e, "MetaEnforcer: chown failed");
        }
    }

    let mode = match &entry.mode {
        Some(m) => match parse_mode(m) {
            Ok(v) => {
                if let Err(e) = chmod(path.as_std_path(), Mode::from_raw_mode(v)) {
                    warn!(path = %path, error = %e, "MetaEnforcer: chmod failed");
                }
                Some(v)
            }
            Err(e) => {
                warn!(path = %path, error = %e, "MetaEnforcer: invalid declared mode");
                None
            }
        },
        None => None,
    };

    let (observed_uid, observed_gid, observed_mode) = stat_owner(path);
    AppliedMeta {
        uid: observed_uid.or(uid),
        gid: observed_gid.or(gid),
        mode: observed_mode.or(mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mode_accepts_three_and_four_digits() {
        assert_eq!(parse_mode("644").unwrap(), 0o644);
        assert_eq!(parse_mode("0640").unwrap(), 0o640);
        assert!(parse_mode("999").is_err());
        assert!(parse_mode("64").is_err());
    }

    #[test]
    fn apply_sets_mode_when_declared() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("f.conf")).unwrap();
        std::fs::write(&path, b"x").unwrap();

        let cfg = crate::config::GlobalConfig {
            listen: "x".into(),
            ssl_enable: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            api_token: None,
            allowed_ips: vec![],
            allowed_roots: vec![],
            trusted_proxies: vec![],
            allow_origins: vec![],
            logfile: None,
            backup_root: camino::Utf8PathBuf::from("/tmp"),
            tmp_dir: camino::Utf8PathBuf::from("/tmp"),
            max_backups: 1,
            path_guard: crate::config::PathGuardMode::Off,
            apply_meta: false,
            auto_create_backups: false,
            systemctl_bin: camino::Utf8PathBuf::from("/usr/bin/systemctl"),
            systemctl_flags: vec![],
        };
        let entry = crate::registry::ConfigEntry {
            name: "f".into(),
            path: path.clone(),
            service: "f".into(),
            category: "uncategorized".into(),
            actions: Default::default(),
            user: None,
            group: None,
            mode: Some("640".into()),
            apply_meta: Some(true),
            backup_dir: camino::Utf8PathBuf::from("/tmp"),
        };

        let applied = apply(&cfg, &entry, &path);
        assert_eq!(applied.mode, Some(0o640));
    }

    #[test]
    fn apply_is_noop_without_overrides_or_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("f.conf")).unwrap();
        std::fs::write(&path, b"x").unwrap();
        let cfg = crate::config::GlobalConfig {
            listen: "x".into(),
            ssl_enable: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            api_token: None,
            allowed_ips: vec![],
            allowed_roots: vec![],
            trusted_proxies: vec![],
            allow_origins: vec![],
            logfile: None,
            backup_root: camino::Utf8PathBuf::from("/tmp"),
            tmp_dir: camino::Utf8PathBuf::from("/tmp"),
            max_backups: 1,
            path_guard: crate::config::PathGuardMode::Off,
            apply_meta: false,
            auto_create_backups: false,
            systemctl_bin: camino::Utf8PathBuf::from("/usr/bin/systemctl"),
            systemctl_flags: vec![],
        };
        let entry = crate::registry::ConfigEntry {
            name: "f".into(),
            path: path.clone(),
            service: "f".into(),
            category: "uncategorized".into(),
            actions: Default::default(),
            user: None,
            group: None,
            mode: None,
            apply_meta: None,
            backup_dir: camino::Utf8PathBuf::from("/tmp"),
        };
        let before = stat_owner(&path);
        let applied = apply(&cfg, &entry, &path);
        assert_eq!((applied.uid, applied.gid, applied.mode), before);
    }
}
