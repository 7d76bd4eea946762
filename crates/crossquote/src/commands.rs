use eyre::Context as _;
use serde::Serialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    aggregator::{BalanceAggregator, BalanceSource},
    amount::{format_base_to_ui, parse_amount_ui_to_base},
    catalog::{LiFiTokenService, TokenCatalog},
    chains::{http_client, AdapterRegistry},
    cli_output,
    config::CrossQuoteConfig,
    errors::CoreError,
    feed::NativeBalanceSource,
    paths::CrossQuotePaths,
    portfolio::PortfolioLoader,
    quote::{LiFiQuoteService, QuoteOrchestrator},
    session::{AddressConnector, ConnectOutcome, SessionEvent, WalletSession},
    store::ConfigStore,
    types::{Account, ChainId, NativeBalance, QuoteChain, QuoteParams},
};

/// Everything the data commands need, wired from one config.
pub struct Services {
    pub cfg: CrossQuoteConfig,
    pub registry: Arc<AdapterRegistry>,
    pub catalog: Arc<TokenCatalog>,
    pub balances: Arc<BalanceAggregator>,
    pub portfolio: PortfolioLoader,
    pub quotes: QuoteOrchestrator,
}

impl Services {
    pub fn from_config(cfg: CrossQuoteConfig) -> Result<Self, CoreError> {
        let client = http_client(cfg.http.timeout())?;
        let registry = Arc::new(AdapterRegistry::from_config(&cfg)?);

        let tokens = LiFiTokenService::new(
            &cfg.http.token_service_base_url,
            cfg.http.lifi_api_key.clone(),
            client.clone(),
        )?;
        let catalog = Arc::new(TokenCatalog::new(
            Arc::new(tokens),
            cfg.cache.catalog_ttl(),
            cfg.retry.backoff(),
        ));
        let balances = Arc::new(BalanceAggregator::new(
            Arc::clone(&registry) as Arc<dyn BalanceSource>,
            cfg.cache.balance_ttl(),
        ));
        let portfolio = PortfolioLoader::new(Arc::clone(&catalog), Arc::clone(&balances));

        let quote_source = LiFiQuoteService::new(
            &cfg.http.quote_service_base_url,
            cfg.http.lifi_api_key.clone(),
            client,
        )?;
        let quotes = QuoteOrchestrator::new(
            Arc::new(quote_source),
            cfg.quote.retry.backoff(),
            cfg.quote.debounce(),
        );

        tracing::debug!(chains = registry.chain_ids().len(), "services ready");
        Ok(Self {
            cfg,
            registry,
            catalog,
            balances,
            portfolio,
            quotes,
        })
    }

    pub fn load(paths: &CrossQuotePaths) -> eyre::Result<Self> {
        let cfg = ConfigStore::new(paths).load().context("load config")?;
        Self::from_config(cfg).context("build services")
    }
}

/// Print `res` on success, or the error view followed by a non-zero exit.
pub fn report<T: Serialize>(res: Result<T, CoreError>) -> eyre::Result<()> {
    match res {
        Ok(v) => cli_output::print_json(&v),
        Err(e) => {
            cli_output::print_error(&e)?;
            Err(eyre::Report::new(e))
        }
    }
}

pub fn native_json(account: &Account, balance: &NativeBalance) -> Result<Value, CoreError> {
    Ok(json!({
        "kind": account.kind,
        "address": account.address,
        "chain_id": account.chain_id,
        "amount": format_base_to_ui(balance.amount, balance.decimals)?,
        "decimals": balance.decimals,
        "display": balance.display()?,
    }))
}

pub async fn tokens(s: &Services, chain_id: ChainId) -> Result<Value, CoreError> {
    let tokens = s.catalog.resolve(chain_id).await?;
    Ok(json!({ "chain_id": chain_id, "tokens": *tokens }))
}

pub async fn balances(s: &Services, address: &str, chain_id: ChainId) -> Result<Value, CoreError> {
    let balances = s.balances.fetch_balances(address, chain_id).await?;
    Ok(json!({ "chain_id": chain_id, "address": address, "balances": *balances }))
}

pub async fn native(s: &Services, account: &Account) -> Result<Value, CoreError> {
    let balance = s.registry.native_balance(account).await?;
    native_json(account, &balance)
}

pub async fn portfolio(
    s: &Services,
    account: &Account,
    with_native: bool,
) -> Result<Value, CoreError> {
    let chain_id = account.chain_id.ok_or_else(|| {
        CoreError::UnsupportedChain(format!("{} accounts have no token portfolio", account.kind.as_str()))
    })?;
    let native = if with_native {
        match s.registry.native_balance(account).await {
            Ok(b) => Some(b),
            Err(e) if e.is_unsupported_chain() => None,
            Err(e) => return Err(e),
        }
    } else {
        None
    };
    let p = s.portfolio.load(&account.address, chain_id, native).await?;
    serde_json::to_value(p).map_err(|e| CoreError::InvalidInput(format!("serialize portfolio: {e}")))
}

pub struct QuoteArgs {
    pub from_chain: ChainId,
    pub from_token: String,
    pub from_address: String,
    pub to_chain: ChainId,
    pub to_token: String,
    pub to_address: Option<String>,
    pub amount: String,
}

pub async fn quote(s: &Services, args: QuoteArgs) -> Result<Value, CoreError> {
    let token = s
        .catalog
        .find(args.from_chain, &args.from_token)
        .await?
        .ok_or_else(|| {
            CoreError::InvalidInput(format!(
                "token {} is not listed on chain {}",
                args.from_token, args.from_chain
            ))
        })?;
    let amount = parse_amount_ui_to_base(&args.amount, token.decimals)?;

    let to_address = args.to_address.unwrap_or_else(|| args.from_address.clone());
    s.quotes.watch(
        Some(QuoteParams {
            token: token.address.clone(),
            address: args.from_address,
            chain: QuoteChain::for_chain_id(args.from_chain),
        }),
        Some(QuoteParams {
            token: args.to_token,
            address: to_address,
            chain: QuoteChain::for_chain_id(args.to_chain),
        }),
        amount,
    );

    let state = s.quotes.settled().await;
    if let Some(e) = state.error {
        return Err(e);
    }
    Ok(json!({
        "from_token": token,
        "amount": amount.to_string(),
        "quote": state.quote,
    }))
}

/// Follow an account's native balance until ctrl-c, one JSON line per event.
pub async fn watch_native(
    s: &Services,
    account: Account,
    interval: Option<Duration>,
) -> eyre::Result<()> {
    let interval = interval.unwrap_or_else(|| s.cfg.cache.native_poll_interval());
    let session = WalletSession::new(
        Arc::new(AddressConnector::new(account.clone())),
        Some(Arc::clone(&s.registry) as Arc<dyn NativeBalanceSource>),
        interval,
    );
    let refresh = s.balances.follow(session.subscribe());
    let mut events = session.subscribe();

    match session.connect().await {
        Ok(ConnectOutcome::Connected(_)) => {}
        Ok(ConnectOutcome::SelectionRequested) => {
            return report::<Value>(Err(CoreError::InvalidInput(
                "no wallet available to watch".to_owned(),
            )));
        }
        Err(e) => return report::<Value>(Err(e)),
    }
    cli_output::print_watch_notice(account.kind.as_str(), &account.address);
    report(native(s, &account).await)?;

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) => print_event(&ev)?,
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "watch output lagged"),
                Err(RecvError::Closed) => break,
            },
            r = tokio::signal::ctrl_c() => {
                r.context("listen for ctrl-c")?;
                break;
            }
        }
    }

    session.disconnect().await.context("disconnect session")?;
    while let Ok(ev) = events.try_recv() {
        print_event(&ev)?;
    }
    refresh.abort();
    Ok(())
}

fn print_event(ev: &SessionEvent) -> eyre::Result<()> {
    match ev {
        SessionEvent::BalanceChanged { account, balance } => {
            let mut v = native_json(account, balance)?;
            if let Some(obj) = v.as_object_mut() {
                obj.insert("event".to_owned(), json!("balance_changed"));
            }
            cli_output::print_json(&v)
        }
        other => cli_output::print_json(other),
    }
}

/// Write the default config file unless one exists (or `force`).
pub fn config_init(paths: &CrossQuotePaths, force: bool) -> eyre::Result<()> {
    paths.ensure_private_dirs()?;
    let store = ConfigStore::new(paths);
    let existed = store.path().exists();
    if !existed || force {
        store.save(&CrossQuoteConfig::default())?;
    }
    cli_output::print_json(&json!({
        "path": store.path(),
        "created": !existed,
        "overwritten": existed && force,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn stub_config(lifi: &str) -> CrossQuoteConfig {
        let mut cfg = CrossQuoteConfig::default();
        cfg.http.token_service_base_url = lifi.to_owned();
        cfg.http.quote_service_base_url = lifi.to_owned();
        cfg.retry.base_delay_ms = 1;
        cfg.retry.max_delay_ms = 1;
        cfg.retry.jitter_max_ms = 0;
        cfg.quote.retry.clone_from(&cfg.retry);
        cfg.quote.debounce_ms = 0;
        cfg
    }

    fn polygon_catalog() -> String {
        json!({
            "tokens": {
                "137": [
                    {"chainId": 137, "address": "0x0000000000000000000000000000000000000000",
                     "symbol": "POL", "name": "Polygon", "decimals": 18},
                    {"chainId": 137, "address": "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359",
                     "symbol": "USDC", "name": "USD Coin", "decimals": 6}
                ]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn quote_converts_ui_amount_with_catalog_decimals() -> eyre::Result<()> {
        let server = MockServer::start_async().await;
        let tokens = server
            .mock_async(|when, then| {
                when.method(GET).path("/tokens").query_param("chains", "137");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(polygon_catalog());
            })
            .await;
        let quoted = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/quote")
                    .query_param("fromChain", "137")
                    .query_param("toChain", "SOL")
                    .query_param("fromToken", "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359")
                    .query_param("toToken", "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v")
                    .query_param("fromAddress", "0x00000000219ab540356cBB839Cbe05303d7705Fa")
                    .query_param("toAddress", "11111111111111111111111111111111")
                    .query_param("fromAmount", "1500000");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({"id": "q1", "tool": "stargate"}).to_string());
            })
            .await;
        let s = Services::from_config(stub_config(&server.base_url()))?;

        let out = quote(
            &s,
            QuoteArgs {
                from_chain: ChainId(137),
                from_token: "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359".to_owned(),
                from_address: "0x00000000219ab540356cBB839Cbe05303d7705Fa".to_owned(),
                to_chain: ChainId::SOLANA,
                to_token: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_owned(),
                to_address: Some("11111111111111111111111111111111".to_owned()),
                amount: "1.5".to_owned(),
            },
        )
        .await?;

        assert_eq!(out.get("amount").and_then(Value::as_str), Some("1500000"));
        assert_eq!(out.pointer("/quote/id").and_then(Value::as_str), Some("q1"));
        tokens.assert_hits_async(1).await;
        quoted.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn quote_rejects_tokens_missing_from_catalog() -> eyre::Result<()> {
        let server = MockServer::start_async().await;
        let tokens = server
            .mock_async(|when, then| {
                when.method(GET).path("/tokens");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(polygon_catalog());
            })
            .await;
        let s = Services::from_config(stub_config(&server.base_url()))?;
        let res = quote(
            &s,
            QuoteArgs {
                from_chain: ChainId(137),
                from_token: "0xdeadbeef".to_owned(),
                from_address: "0xowner".to_owned(),
                to_chain: ChainId(8453),
                to_token: "0x0".to_owned(),
                to_address: None,
                amount: "1".to_owned(),
            },
        )
        .await;
        assert!(matches!(res, Err(CoreError::InvalidInput(_))));
        tokens.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn bitcoin_accounts_have_no_portfolio() -> eyre::Result<()> {
        let s = Services::from_config(CrossQuoteConfig::default())?;
        let res = portfolio(
            &s,
            &Account::bitcoin("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"),
            false,
        )
        .await;
        assert!(matches!(res, Err(CoreError::UnsupportedChain(_))));
        Ok(())
    }

    #[test]
    fn native_json_uses_decimal_amounts() -> eyre::Result<()> {
        let v = native_json(
            &Account::solana("11111111111111111111111111111111"),
            &NativeBalance::lamports(1_500_000_000),
        )?;
        assert_eq!(v.get("amount").and_then(Value::as_str), Some("1.5"));
        assert_eq!(v.get("display").and_then(Value::as_str), Some("1.5000"));
        assert_eq!(v.get("kind").and_then(Value::as_str), Some("solana"));
        Ok(())
    }
}
