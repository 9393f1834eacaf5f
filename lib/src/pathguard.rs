//! PathGuard: canonicalise a filesystem path and verify containment within
//! an allow-list of roots, rejecting symlinks.

use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tracing::{debug, warn};

use crate::config::{GlobalConfig, PathGuardMode};

/// Resolve the real path of `p` if it exists, else of its parent directory;
/// normalise to a string ending in `/`.
#[context("Canonicalising {p}")]
pub fn canonicalise(p: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    let resolved = if p.exists() {
        std::fs::canonicalize(p)?
    } else {
        let parent = p.parent().unwrap_or(Utf8Path::new("/"));
        let parent = std::fs::canonicalize(parent)?;
        let name = p
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("path has no file name"))?;
        parent.join(name)
    };
    let mut resolved = Utf8PathBuf::try_from(resolved)?;
    if !resolved.as_str().ends_with('/') {
        let mut s = resolved.into_string();
        s.push('/');
        resolved = Utf8PathBuf::from(s);
    }
    Ok(resolved)
}

fn is_symlink(p: &Utf8Path) -> bool {
    std::fs::symlink_metadata(p)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Evaluate whether `p` may be written to, per the allow-list and guard mode.
pub fn is_allowed(cfg: &GlobalConfig, p: &Utf8Path) -> bool {
    if is_symlink(p) {
        debug!(path = %p, "PathGuard: rejecting symlink");
        return false;
    }
    if cfg.path_guard == PathGuardMode::Off {
        return true;
    }

    let canon = match canonicalise(p) {
        Ok(c) => c,
        Err(e) => {
            return if cfg.path_guard == PathGuardMode::Audit {
                warn!(path = %p, error = %e, "PathGuard: resolution error, allowing (audit mode)");
                true
            } else {
                false
            };
        }
    };
    // canon ends in "/", points at the resolved target's own directory
    // (the directory component of canonicalise's output), but since
    // canonicalise resolves the *directory* for non-existent targets and
    // the full realpath for existent ones, take the containing directory
    // explicitly for the comparison.
    let canon_dir = if p.exists() {
        let mut d = canon.clone();
        d.pop();
        let mut s = d.into_string();
        if !s.ends_with('/') {
            s.push('/');
        }
        Utf8PathBuf::from(s)
    } else {
        canon.clone()
    };

    if cfg.allowed_roots.is_empty() {
        return if cfg.path_guard == PathGuardMode::Audit {
            warn!(path = %p, "PathGuard: no roots configured, allowing (audit mode)");
            true
        } else {
            false
        };
    }

    let matched = cfg.allowed_roots.iter().any(|root| {
        let root = ensure_trailing_slash(root);
        canon_dir.as_str() == root.as_str() || canon_dir.as_str().starts_with(root.as_str())
    });

    if matched {
        true
    } else if cfg.path_guard == PathGuardMode::Audit {
        warn!(path = %p, "PathGuard: outside allow-list, allowing (audit mode)");
        true
    } else {
        false
    }
}

fn ensure_trailing_slash(p: &Utf8Path) -> Utf8PathBuf {
    let s = p.as_str();
    if s.ends_with('/') {
        p.to_path_buf()
    } else {
        Utf8PathBuf::from(format!("{s}/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathGuardMode;

    fn base_cfg(roots: Vec<Utf8PathBuf>, mode: PathGuardMode) -> GlobalConfig {
        GlobalConfig {
            listen: "127.0.0.1:0".into(),
            ssl_enable: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            api_token: None,
            allowed_ips: vec![],
            allowed_roots: roots,
            trusted_proxies: vec![],
            allow_origins: vec![],
            logfile: None,
            backup_root: Utf8PathBuf::from("/tmp/backups"),
            tmp_dir: Utf8PathBuf::from("/tmp"),
            max_backups: 10,
            path_guard: mode,
            apply_meta: false,
            auto_create_backups: true,
            systemctl_bin: Utf8PathBuf::from("/usr/bin/systemctl"),
            systemctl_flags: vec![],
        }
    }

    #[test]
    fn off_mode_allows_anything() {
        let cfg = base_cfg(vec![], PathGuardMode::Off);
        assert!(is_allowed(&cfg, Utf8Path::new("/etc/shadow")));
    }

    #[test]
    fn on_mode_rejects_sibling_with_prefix_collision() {
        let dir = tempfile::tempdir().unwrap();
        let etc = Utf8PathBuf::try_from(dir.path().join("etc")).unwrap();
        std::fs::create_dir_all(&etc).unwrap();
        let foobar = etc.join("foobar.conf");
        std::fs::write(&foobar, b"x").unwrap();
        let foo_root = etc.join("foo");
        std::fs::create_dir_all(&foo_root).unwrap();

        let cfg = base_cfg(vec![foo_root], PathGuardMode::On);
        assert!(!is_allowed(&cfg, &foobar));
    }

    #[test]
    fn on_mode_allows_within_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let target = root.join("app.conf");
        std::fs::write(&target, b"x").unwrap();
        let cfg = base_cfg(vec![root], PathGuardMode::On);
        assert!(is_allowed(&cfg, &target));
    }

    #[test]
    fn on_mode_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let real = root.join("real.conf");
        std::fs::write(&real, b"x").unwrap();
        let link = root.join("link.conf");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let cfg = base_cfg(vec![root], PathGuardMode::On);
        assert!(!is_allowed(&cfg, &link));
    }
}
