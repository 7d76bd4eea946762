use crate::{config::CrossQuoteConfig, paths::CrossQuotePaths, store::ConfigStore};
use eyre::Context as _;
use serde_json::json;
use std::{fs, path::Path, path::PathBuf};

/// Env vars reported by name only; values may carry API keys.
const SECRET_ENV: [&str; 3] = [
    "CROSSQUOTE_ALCHEMY_API_KEY",
    "CROSSQUOTE_HELIUS_API_KEY",
    "CROSSQUOTE_LIFI_API_KEY",
];

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn try_parse_config(path: &Path) -> eyre::Result<CrossQuoteConfig> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CrossQuoteConfig = toml::from_str(&s).context("parse config.toml")?;
    Ok(cfg)
}

struct ConfigReport {
    path: PathBuf,
    exists: bool,
    parse_ok: bool,
    error: Option<String>,
}

struct EffectiveReport {
    ok: bool,
    error: Option<String>,
    evm_chains: Vec<u64>,
    solana: bool,
    token_service_base_url: Option<String>,
}

struct DoctorReport {
    version: &'static str,
    paths: CrossQuotePaths,
    config: ConfigReport,
    effective: EffectiveReport,
    env: serde_json::Value,
}

fn collect(paths: &CrossQuotePaths) -> DoctorReport {
    let store = ConfigStore::new(paths);
    let config_path = store.path().to_path_buf();
    let exists = config_path.exists();
    let (parse_ok, error) = if exists {
        match try_parse_config(&config_path) {
            Ok(_) => (true, None),
            Err(e) => (false, Some(format!("{e:#}"))),
        }
    } else {
        (false, None)
    };

    // Defaults plus env overrides, as the data commands would see them.
    let effective = match store.load() {
        Ok(cfg) => {
            let ids = cfg.supported_chain_ids();
            EffectiveReport {
                ok: true,
                error: None,
                evm_chains: ids.iter().filter(|id| !id.is_solana()).map(|id| id.0).collect(),
                solana: ids.iter().any(|id| id.is_solana()),
                token_service_base_url: Some(cfg.http.token_service_base_url),
            }
        }
        Err(e) => EffectiveReport {
            ok: false,
            error: Some(format!("{e:#}")),
            evm_chains: vec![],
            solana: false,
            token_service_base_url: None,
        },
    };

    let mut env = serde_json::Map::new();
    for key in ["CROSSQUOTE_CONFIG_DIR", "CROSSQUOTE_DATA_DIR", "CROSSQUOTE_LIFI_BASE_URL"] {
        env.insert(key.to_owned(), json!(env_opt(key)));
    }
    for key in SECRET_ENV {
        env.insert(format!("{key}_set"), json!(env_opt(key).is_some()));
    }

    DoctorReport {
        version: env!("CARGO_PKG_VERSION"),
        paths: paths.clone(),
        config: ConfigReport {
            path: config_path,
            exists,
            parse_ok,
            error,
        },
        effective,
        env: serde_json::Value::Object(env),
    }
}

fn print_json(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(&json!({
      "ok": true,
      "version": r.version,
      "paths": {
        "config_dir": r.paths.config_dir,
        "data_dir": r.paths.data_dir,
        "log_file": r.paths.log_file,
      },
      "config": {
        "path": r.config.path,
        "exists": r.config.exists,
        "parse_ok": r.config.parse_ok,
        "error": r.config.error,
      },
      "effective": {
        "ok": r.effective.ok,
        "error": r.effective.error,
        "evm_chains": r.effective.evm_chains,
        "solana": r.effective.solana,
        "token_service_base_url": r.effective.token_service_base_url,
      },
      "env": r.env,
      "hints": [
        "EVM chains need CROSSQUOTE_ALCHEMY_API_KEY (or explicit rpc.evm.*.rpc_url entries) before they are listed.",
        "Run `crossquote config init` to write an editable config.toml.",
      ]
    }))
    .context("serialize doctor json")?;
    writeln!(out, "{s}").context("write doctor json")?;
    Ok(())
}

fn print_human(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    writeln!(out, "crossquote doctor (v{})", r.version).context("write header")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Paths:").context("write paths header")?;
    writeln!(out, "  config_dir: {}", r.paths.config_dir.display()).context("write paths")?;
    writeln!(out, "  data_dir:   {}", r.paths.data_dir.display()).context("write paths")?;
    writeln!(out, "  log_file:   {}", r.paths.log_file.display()).context("write paths")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Config:").context("write config header")?;
    writeln!(out, "  config.toml: {}", r.config.path.display()).context("write config")?;
    if !r.config.exists {
        writeln!(out, "  status: missing (defaults in use)").context("write config")?;
    } else if r.config.parse_ok {
        writeln!(out, "  status: ok").context("write config")?;
    } else {
        writeln!(out, "  status: parse failed").context("write config")?;
        if let Some(e) = &r.config.error {
            let first = e.lines().next().unwrap_or("parse error");
            writeln!(out, "  error: {first}").context("write config")?;
        }
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Chains:").context("write chains header")?;
    if r.effective.ok {
        writeln!(out, "  evm: {:?}", r.effective.evm_chains).context("write chains")?;
        writeln!(out, "  solana: {}", r.effective.solana).context("write chains")?;
    } else if let Some(e) = &r.effective.error {
        let first = e.lines().next().unwrap_or("invalid config");
        writeln!(out, "  unavailable: {first}").context("write chains")?;
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Env (redacted):").context("write env header")?;
    if let Some(env) = r.env.as_object() {
        for (k, v) in env {
            writeln!(out, "  {k}: {v}").context("write env")?;
        }
    }
    Ok(())
}

pub fn run(as_json: bool) -> eyre::Result<()> {
    let paths = CrossQuotePaths::discover()?;
    let report = collect(&paths);
    let mut out = std::io::stdout().lock();
    if as_json {
        print_json(&mut out, &report)?;
    } else {
        print_human(&mut out, &report)?;
    }
    Ok(())
}
