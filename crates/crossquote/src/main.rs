#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand, ValueEnum};
use eyre::Context as _;
use std::time::Duration;
use tracing_subscriber::prelude::*;

use crossquote::{
    cli_output,
    commands::{self, QuoteArgs, Services},
    doctor,
    paths,
    types::{Account, ChainId},
};

#[derive(Parser, Debug)]
#[command(name = "crossquote", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliChainKind {
    Evm,
    Solana,
    Bitcoin,
}

/// An account to read native balances for.
#[derive(clap::Args, Debug)]
struct AccountArgs {
    #[arg(long)]
    address: String,

    #[arg(long, value_enum, default_value_t = CliChainKind::Evm)]
    kind: CliChainKind,

    /// EVM network id. Ignored for Solana and Bitcoin.
    #[arg(long, default_value = "1")]
    chain: ChainId,
}

impl AccountArgs {
    fn account(&self) -> Account {
        match self.kind {
            CliChainKind::Evm => Account::evm(self.address.clone(), self.chain),
            CliChainKind::Solana => Account::solana(self.address.clone()),
            CliChainKind::Bitcoin => Account::bitcoin(self.address.clone()),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Data(DataCommand),

    /// Print resolved paths (useful for debugging).
    Paths,

    /// Print a quick self-diagnostic report (safe to paste; contains no secrets).
    Doctor {
        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Manage the config file.
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

/// Commands that talk to chains or the token/quote service.
#[derive(Subcommand, Debug)]
enum DataCommand {
    /// Print the token catalog for a chain (`sol` for Solana).
    Tokens {
        #[arg(long)]
        chain: ChainId,
    },

    /// Print non-zero token balances held by an address.
    Balances {
        #[arg(long)]
        chain: ChainId,
        #[arg(long)]
        address: String,
    },

    /// Print the catalog with balances overlaid, plus the native balance.
    Portfolio {
        #[command(flatten)]
        account: AccountArgs,

        /// Skip the native balance lookup.
        #[arg(long, default_value_t = false)]
        no_native: bool,
    },

    /// Print the native currency balance of an account.
    Native {
        #[command(flatten)]
        account: AccountArgs,
    },

    /// Follow the native balance of an account, one JSON line per change, until ctrl-c.
    WatchNative {
        #[command(flatten)]
        account: AccountArgs,

        /// Poll interval; defaults to `cache.native_poll_interval_ms`.
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Request a cross-chain swap quote.
    Quote {
        #[arg(long)]
        from_chain: ChainId,
        /// Token address on the source chain.
        #[arg(long)]
        from_token: String,
        #[arg(long)]
        from_address: String,
        #[arg(long)]
        to_chain: ChainId,
        #[arg(long)]
        to_token: String,
        /// Defaults to `--from-address`.
        #[arg(long)]
        to_address: Option<String>,
        /// Human-readable amount of the source token, e.g. `1.5`.
        #[arg(long)]
        amount: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the default config.toml (API keys stay in the environment).
    Init {
        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn init_logging(paths: &paths::CrossQuotePaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("crossquote.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = paths::CrossQuotePaths::discover()?;
    std::fs::create_dir_all(&paths.data_dir).context("create data dir")?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Paths => cli_output::print_json(&serde_json::json!({
          "config_dir": paths.config_dir,
          "data_dir": paths.data_dir,
          "log_file": paths.log_file,
          "config_file": paths.config_file(),
        })),
        Command::Doctor { json } => doctor::run(json).context("doctor failed"),
        Command::Config {
            cmd: ConfigCommand::Init { force },
        } => commands::config_init(&paths, force).context("config init failed"),
        Command::Data(cmd) => {
            let services = Services::load(&paths)?;
            run_data_command(&services, cmd).await
        }
    }
}

async fn run_data_command(s: &Services, cmd: DataCommand) -> eyre::Result<()> {
    match cmd {
        DataCommand::Tokens { chain } => commands::report(commands::tokens(s, chain).await),
        DataCommand::Balances { chain, address } => {
            commands::report(commands::balances(s, &address, chain).await)
        }
        DataCommand::Portfolio { account, no_native } => {
            commands::report(commands::portfolio(s, &account.account(), !no_native).await)
        }
        DataCommand::Native { account } => {
            commands::report(commands::native(s, &account.account()).await)
        }
        DataCommand::WatchNative {
            account,
            interval_ms,
        } => {
            commands::watch_native(s, account.account(), interval_ms.map(Duration::from_millis))
                .await
        }
        DataCommand::Quote {
            from_chain,
            from_token,
            from_address,
            to_chain,
            to_token,
            to_address,
            amount,
        } => commands::report(
            commands::quote(
                s,
                QuoteArgs {
                    from_chain,
                    from_token,
                    from_address,
                    to_chain,
                    to_token,
                    to_address,
                    amount,
                },
            )
            .await,
        ),
    }
}
