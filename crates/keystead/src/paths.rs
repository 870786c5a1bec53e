use base64::Engine as _;
use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use rand::Rng as _;
use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write as _},
    path::PathBuf,
};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt as _;

#[derive(Debug, Clone)]
pub struct KeysteadPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl KeysteadPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("KEYSTEAD_DATA_DIR"),
            std::env::var("KEYSTEAD_CONFIG_DIR"),
        ) {
            return Ok(Self::at(PathBuf::from(config_dir), PathBuf::from(data_dir)));
        }

        let proj =
            ProjectDirs::from("", "", "keystead").context("failed to resolve project dirs")?;
        Ok(Self::at(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    fn at(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let log_file = data_dir.join("keystead.log.jsonl");
        Self {
            config_dir,
            data_dir,
            log_file,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Directory of the per-key wallet state files.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("keystead.sock")
    }

    pub fn daemon_lock_path(&self) -> PathBuf {
        self.data_dir.join("keystead-daemon.lock")
    }

    pub fn auth_token_path(&self) -> PathBuf {
        self.config_dir.join("daemon_auth_token.txt")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        crate::fsutil::ensure_private_dir(&self.state_dir())?;
        Ok(())
    }

    /// Read the daemon auth token, creating it on first use. A racing creator
    /// loses on `create_new` and reads the winner's token instead.
    pub fn ensure_auth_token(&self) -> eyre::Result<String> {
        self.ensure_private_dirs()?;
        let p = self.auth_token_path();

        for _ in 0_u8..3 {
            if let Some(bytes) = crate::fsutil::read_if_exists(&p)? {
                let tok = String::from_utf8_lossy(&bytes).trim().to_owned();
                if !tok.is_empty() {
                    return Ok(tok);
                }
                // Killed mid-create; start over.
                crate::fsutil::remove_if_exists(&p)?;
                continue;
            }

            let mut raw = [0_u8; 32];
            rand::rng().fill_bytes(&mut raw);
            let tok = base64::engine::general_purpose::STANDARD.encode(raw);

            let mut oo = OpenOptions::new();
            oo.create_new(true).write(true);
            #[cfg(unix)]
            oo.mode(crate::fsutil::MODE_FILE_PRIVATE);
            match oo.open(&p) {
                Ok(mut f) => {
                    f.write_all(format!("{tok}\n").as_bytes())
                        .with_context(|| format!("write {}", p.display()))?;
                    f.sync_all()
                        .with_context(|| format!("fsync {}", p.display()))?;
                    return Ok(tok);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).with_context(|| format!("create {}", p.display())),
            }
        }

        eyre::bail!("failed to create/read auth token file: {}", p.display())
    }
}
