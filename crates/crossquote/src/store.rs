use crate::{
    config::{ensure_https_or_loopback, CrossQuoteConfig},
    paths::{ensure_private_dir, CrossQuotePaths, MODE_FILE_PRIVATE},
};
use eyre::Context as _;
use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt as _;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

/// API keys are read from the environment only and never persisted.
#[derive(Debug, Clone, Default)]
struct EnvKeys {
    alchemy: Option<String>,
    helius: Option<String>,
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Apply environment variable overrides to the config (HTTP endpoints, etc.).
fn apply_env_overrides(cfg: &mut CrossQuoteConfig) {
    fn apply_env(var: &str, setter: impl FnOnce(&str)) {
        if let Some(v) = non_empty_env(var) {
            setter(&v);
        }
    }

    apply_env("CROSSQUOTE_SOLANA_RPC_URL", |v| {
        v.clone_into(&mut cfg.rpc.solana_rpc_url);
    });
    apply_env("CROSSQUOTE_LIFI_BASE_URL", |v| {
        v.clone_into(&mut cfg.http.token_service_base_url);
        v.clone_into(&mut cfg.http.quote_service_base_url);
    });
    apply_env("CROSSQUOTE_LIFI_API_KEY", |v| {
        cfg.http.lifi_api_key = Some(v.to_owned());
    });
    apply_env("CROSSQUOTE_BITCOIN_API_BASE_URL", |v| {
        v.clone_into(&mut cfg.http.bitcoin_api_base_url);
    });
    if let Some(n) = non_empty_env("CROSSQUOTE_QUOTE_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
        cfg.quote.debounce_ms = n;
    }

    let keys = EnvKeys {
        alchemy: non_empty_env("CROSSQUOTE_ALCHEMY_API_KEY"),
        helius: non_empty_env("CROSSQUOTE_HELIUS_API_KEY"),
    };
    cfg.apply_api_keys(keys.alchemy.as_deref(), keys.helius.as_deref());
}

fn validate(cfg: &CrossQuoteConfig) -> eyre::Result<()> {
    ensure_https_or_loopback(&cfg.http.token_service_base_url, "http.token_service_base_url")?;
    ensure_https_or_loopback(&cfg.http.quote_service_base_url, "http.quote_service_base_url")?;
    ensure_https_or_loopback(&cfg.http.bitcoin_api_base_url, "http.bitcoin_api_base_url")?;
    ensure_https_or_loopback(&cfg.rpc.solana_rpc_url, "rpc.solana_rpc_url")?;
    for (name, chain) in &cfg.rpc.evm {
        ensure_https_or_loopback(&chain.rpc_url, &format!("rpc.evm.{name}.rpc_url"))?;
    }
    if cfg.quote.retry.attempts == 0 {
        eyre::bail!("quote.retry.attempts must be at least 1");
    }
    Ok(())
}

fn write_atomic_private(path: &Path, s: &str) -> eyre::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    ensure_private_dir(parent)?;

    let tmp = parent.join(format!(".config.toml.tmp.{:016x}", rand::random::<u64>()));
    let mut oo = OpenOptions::new();
    oo.create_new(true).write(true);
    #[cfg(unix)]
    {
        oo.mode(MODE_FILE_PRIVATE);
    }
    let mut f = oo
        .open(&tmp)
        .with_context(|| format!("open temp {}", tmp.display()))?;
    f.write_all(s.as_bytes())
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

impl ConfigStore {
    pub fn new(paths: &CrossQuotePaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the effective config without touching disk when no file exists yet.
    pub fn load(&self) -> eyre::Result<CrossQuoteConfig> {
        let mut cfg = if self.path.exists() {
            let s = fs::read_to_string(&self.path).context("read config.toml")?;
            toml::from_str(&s).context("parse config.toml")?
        } else {
            CrossQuoteConfig::default()
        };
        apply_env_overrides(&mut cfg);
        validate(&cfg)?;
        Ok(cfg)
    }

    /// Write the default config (without API keys) if none exists, then load.
    pub fn load_or_init_default(&self) -> eyre::Result<CrossQuoteConfig> {
        if !self.path.exists() {
            self.save(&CrossQuoteConfig::default())?;
        }
        self.load()
    }

    pub fn save(&self, cfg: &CrossQuoteConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        write_atomic_private(&self.path, &s).context("write config.toml")
    }
}
