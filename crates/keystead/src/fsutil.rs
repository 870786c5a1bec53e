use eyre::Context as _;
use rand::Rng as _;
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write as _},
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

fn refuse_symlink(p: &Path) -> eyre::Result<()> {
    match fs::symlink_metadata(p) {
        Ok(md) if md.file_type().is_symlink() => {
            eyre::bail!("refusing to follow symlink: {}", p.display())
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("stat {}", p.display())),
    }
}

/// Create `dir` (and parents) if needed and clamp it to owner-only access.
pub fn ensure_private_dir(dir: &Path) -> eyre::Result<()> {
    refuse_symlink(dir)?;
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }
    let md = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
    if !md.is_dir() {
        eyre::bail!("expected directory at {}", dir.display());
    }

    #[cfg(unix)]
    if md.permissions().mode() & 0o077 != 0 {
        fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))
            .with_context(|| format!("chmod {MODE_DIR_PRIVATE:o} {}", dir.display()))?;
    }

    Ok(())
}

fn sibling_tmp(path: &Path) -> eyre::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state");
    let mut suffix = [0_u8; 8];
    rand::rng().fill_bytes(&mut suffix);
    Ok(parent.join(format!(".{base}.tmp.{}", hex::encode(suffix))))
}

/// Replace `path` with `bytes` in one step: a fresh private temp file is
/// written, fsynced and renamed over the target. Readers never see a torn file.
pub fn replace_atomic(path: &Path, bytes: &[u8]) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    refuse_symlink(path)?;

    let tmp = sibling_tmp(path)?;
    let mut opts = OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    opts.mode(MODE_FILE_PRIVATE);
    let mut f = opts
        .open(&tmp)
        .with_context(|| format!("open temp {}", tmp.display()))?;

    f.write_all(bytes)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    #[cfg(windows)]
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove existing {}", path.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))
}

pub fn read_if_exists(path: &Path) -> eyre::Result<Option<Vec<u8>>> {
    refuse_symlink(path)?;
    match fs::read(path) {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

pub fn remove_if_exists(path: &Path) -> eyre::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
