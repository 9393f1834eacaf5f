//! AtomicWriter: same-directory temporary file plus rename, falling back
//! to a direct write when the directory is not writable.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

/// Which strategy [`write`] actually used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMethod {
    /// Temp file in the same directory, then renamed over the target.
    Atomic,
    /// Direct write to the target path.
    Plain,
}

fn dir_writable(dir: &Utf8Path) -> bool {
    let probe = dir.join(format!(".configd_probe.{}", std::process::id()));
    match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Write `bytes` to `path`. Tries a same-directory temp-file-and-rename
/// first; falls back to a direct write on any error during that path, or
/// immediately when the directory is not writable but the file itself is.
pub fn write(path: &Utf8Path, bytes: &[u8]) -> anyhow::Result<WriteMethod> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{path} has no parent directory"))?;
    let basename = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{path} has no file name"))?;

    if dir.exists() && dir_writable(dir) {
        match write_atomic(dir, basename, path, bytes) {
            Ok(()) => return Ok(WriteMethod::Atomic),
            Err(e) => {
                warn!(path = %path, error = %e, "AtomicWriter: atomic path failed, falling back to plain write");
            }
        }
    }
    write_plain(path, bytes)?;
    Ok(WriteMethod::Plain)
}

fn write_atomic(dir: &Utf8Path, basename: &str, target: &Utf8Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp_name = format!(".tmp_{basename}.{}", std::process::id());
    let tmp_path = dir.join(tmp_name);
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        use std::io::Write;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, target).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp_path);
    })?;
    debug!(target = %target, "AtomicWriter: renamed temp file into place");
    Ok(())
}

fn write_plain(path: &Utf8Path, bytes: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = Utf8PathBuf::try_from(dir.path().join("app.conf")).unwrap();
        std::fs::write(&target, b"old\n").unwrap();
        let method = write(&target, b"new\n").unwrap();
        assert_eq!(method, WriteMethod::Atomic);
        assert_eq!(std::fs::read(&target).unwrap(), b"new\n");
        // no leftover temp file
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_creates_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = Utf8PathBuf::try_from(dir.path().join("new.conf")).unwrap();
        let method = write(&target, b"hello\n").unwrap();
        assert_eq!(method, WriteMethod::Atomic);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello\n");
    }
}
