use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use std::{fs, path::Path, path::PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt as _;

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

const LOG_FILE_NAME: &str = "crossquote.log.jsonl";

#[derive(Debug, Clone)]
pub struct CrossQuotePaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl CrossQuotePaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("CROSSQUOTE_DATA_DIR"),
            std::env::var("CROSSQUOTE_CONFIG_DIR"),
        ) {
            let data_dir = PathBuf::from(data_dir);
            return Ok(Self {
                config_dir: PathBuf::from(config_dir),
                log_file: data_dir.join(LOG_FILE_NAME),
                data_dir,
            });
        }

        // macOS: ~/Library/Application Support/crossquote
        // Linux: ~/.config/crossquote
        let proj =
            ProjectDirs::from("", "", "crossquote").context("failed to resolve project dirs")?;
        let data_dir = proj.data_dir().to_path_buf();

        Ok(Self {
            config_dir: proj.config_dir().to_path_buf(),
            log_file: data_dir.join(LOG_FILE_NAME),
            data_dir,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        ensure_private_dir(&self.config_dir)?;
        ensure_private_dir(&self.data_dir)?;
        Ok(())
    }
}

pub fn ensure_private_dir(dir: &Path) -> eyre::Result<()> {
    if dir.exists() {
        let md = fs::symlink_metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
        if md.file_type().is_symlink() {
            eyre::bail!("refusing to use symlinked directory: {}", dir.display());
        }
        if !md.is_dir() {
            eyre::bail!("expected directory at {}", dir.display());
        }
    } else {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }

    // Config may carry API keys; clamp group/other bits.
    #[cfg(unix)]
    {
        let md = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
        if (md.permissions().mode() & 0o077) != 0 {
            fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))
                .with_context(|| format!("chmod {MODE_DIR_PRIVATE:o} {}", dir.display()))?;
        }
    }

    Ok(())
}
