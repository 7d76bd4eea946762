use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::{
    amount::{format_base_to_ui, round_to_places, DISPLAY_PLACES},
    cache::KeyedStore,
    errors::CoreError,
    session::SessionEvent,
    types::{Account, ChainId, Holding, NativeBalance, Portfolio, Token, TokenBalance},
};

/// Raw token holdings for an address on one chain.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn token_balances(
        &self,
        address: &str,
        chain_id: ChainId,
    ) -> Result<Vec<TokenBalance>, CoreError>;
}

/// EVM addresses are case-insensitive; base58 Solana keys are not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceKey {
    pub address: String,
    pub chain_id: ChainId,
}

impl BalanceKey {
    pub fn new(address: &str, chain_id: ChainId) -> Self {
        let address = address.trim();
        Self {
            address: if chain_id.is_solana() {
                address.to_owned()
            } else {
                address.to_lowercase()
            },
            chain_id,
        }
    }

    fn for_account(account: &Account) -> Option<Self> {
        account
            .chain_id
            .map(|chain_id| Self::new(&account.address, chain_id))
    }
}

pub struct BalanceAggregator {
    source: Arc<dyn BalanceSource>,
    store: KeyedStore<BalanceKey, Arc<Vec<TokenBalance>>>,
}

impl BalanceAggregator {
    pub fn new(source: Arc<dyn BalanceSource>, ttl: Duration) -> Self {
        Self {
            source,
            store: KeyedStore::new(ttl),
        }
    }

    /// Normalized holdings for `(address, chain_id)`. Chains without a balance endpoint yield an
    /// empty set; transport failures propagate.
    pub async fn fetch_balances(
        &self,
        address: &str,
        chain_id: ChainId,
    ) -> Result<Arc<Vec<TokenBalance>>, CoreError> {
        let source = Arc::clone(&self.source);
        let owned = address.trim().to_owned();
        self.store
            .get_or_fetch(BalanceKey::new(address, chain_id), move || async move {
                match source.token_balances(&owned, chain_id).await {
                    Ok(v) => {
                        tracing::debug!(chain_id = %chain_id, count = v.len(), "balances fetched");
                        Ok(Arc::new(v))
                    }
                    Err(e) if e.is_unsupported_chain() => {
                        tracing::debug!(chain_id = %chain_id, error = %e, "chain unsupported; empty balances");
                        Ok(Arc::new(vec![]))
                    }
                    Err(e) => {
                        tracing::warn!(chain_id = %chain_id, code = e.code(), error = %e, "balance fetch failed");
                        Err(e)
                    }
                }
            })
            .await
    }

    pub fn invalidate(&self, address: &str, chain_id: ChainId) {
        self.store.invalidate(&BalanceKey::new(address, chain_id));
    }

    pub fn forget(&self, address: &str, chain_id: ChainId) {
        self.store.forget(&BalanceKey::new(address, chain_id));
    }

    /// Map a session event onto the cache.
    pub fn apply(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Connected { account } | SessionEvent::BalanceChanged { account, .. } => {
                if let Some(k) = BalanceKey::for_account(account) {
                    self.store.invalidate(&k);
                }
            }
            SessionEvent::AccountChanged { previous, current } => {
                if let Some(k) = BalanceKey::for_account(previous) {
                    self.store.forget(&k);
                }
                if let Some(k) = BalanceKey::for_account(current) {
                    self.store.invalidate(&k);
                }
            }
            SessionEvent::Disconnected { account } => {
                if let Some(k) = BalanceKey::for_account(account) {
                    self.store.forget(&k);
                }
            }
        }
    }

    /// Apply every event from `events` until the sender side closes.
    pub fn follow(self: &Arc<Self>, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) => this.apply(&ev),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "session events lagged; dropping balance cache");
                        this.store.clear();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn holding(token: &Token, amount: String) -> Result<Holding, CoreError> {
    let display = round_to_places(&amount, DISPLAY_PLACES)?;
    Ok(Holding {
        token: token.clone(),
        amount,
        display,
    })
}

fn zero_holding(token: &Token) -> Holding {
    Holding {
        token: token.clone(),
        amount: "0".to_owned(),
        display: round_to_places("0", DISPLAY_PLACES).unwrap_or_else(|_| "0".to_owned()),
    }
}

/// Overlay balances onto every non-native catalog token. Missing balances read as zero, and so does
/// a balance that cannot be expressed with the token's decimals; one bad entry never sinks the rest.
pub fn merge(catalog: &[Token], balances: &[TokenBalance]) -> Vec<Holding> {
    let by_address: HashMap<String, &TokenBalance> =
        balances.iter().map(|b| (b.lookup_key(), b)).collect();

    catalog
        .iter()
        .skip(1)
        .map(|token| {
            let Some(b) = by_address.get(&token.address.to_lowercase()) else {
                return zero_holding(token);
            };
            b.amount
                .to_decimal_string(token.decimals)
                .and_then(|amount| holding(token, amount))
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        token = %token.address,
                        decimals = token.decimals,
                        error = %e,
                        "unreadable balance; showing zero"
                    );
                    zero_holding(token)
                })
        })
        .collect()
}

pub fn portfolio(
    address: &str,
    chain_id: ChainId,
    catalog: &[Token],
    balances: &[TokenBalance],
    native: Option<NativeBalance>,
) -> Portfolio {
    let native = match (catalog.first(), native) {
        (Some(token), Some(n)) => format_base_to_ui(n.amount, n.decimals)
            .and_then(|amount| holding(token, amount))
            .inspect_err(|e| {
                tracing::warn!(token = %token.address, error = %e, "unreadable native balance; omitting");
            })
            .ok(),
        _ => None,
    };
    Portfolio {
        chain_id,
        address: address.to_owned(),
        native,
        tokens: merge(catalog, balances),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{amount::parse_hex_u256, types::BalanceAmount};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    };

    /// Serves fixed results per chain and counts calls.
    struct FakeSource {
        calls: AtomicUsize,
        results: Mutex<HashMap<ChainId, Result<Vec<TokenBalance>, CoreError>>>,
    }

    impl FakeSource {
        fn new(results: Vec<(ChainId, Result<Vec<TokenBalance>, CoreError>)>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                results: Mutex::new(results.into_iter().collect()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BalanceSource for FakeSource {
        async fn token_balances(
            &self,
            _address: &str,
            chain_id: ChainId,
        ) -> Result<Vec<TokenBalance>, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&chain_id)
                .cloned()
                .unwrap_or_else(|| Err(CoreError::UnsupportedChain(chain_id.to_string())))
        }
    }

    fn token(address: &str, symbol: &str, decimals: u8) -> Token {
        Token {
            chain_id: ChainId(1),
            address: address.to_owned(),
            symbol: symbol.to_owned(),
            name: symbol.to_owned(),
            decimals,
            logo_uri: None,
            price_usd: None,
            coin_key: None,
        }
    }

    fn evm_catalog() -> Vec<Token> {
        vec![
            token("0x0000000000000000000000000000000000000000", "ETH", 18),
            token("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", "USDC", 6),
            token("0x6B175474E89094C44Da98b954EedeAC495271d0F", "DAI", 18),
        ]
    }

    #[tokio::test]
    async fn unsupported_chain_yields_empty_balances() -> eyre::Result<()> {
        let agg = BalanceAggregator::new(FakeSource::new(vec![]), Duration::from_secs(30));
        let got = agg.fetch_balances("0xabc", ChainId(424_242)).await?;
        assert!(got.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn transport_failures_propagate() {
        let src = FakeSource::new(vec![(ChainId(1), Err(CoreError::Rpc("timeout".into())))]);
        let agg = BalanceAggregator::new(src, Duration::from_secs(30));
        let res = agg.fetch_balances("0xabc", ChainId(1)).await;
        assert_eq!(res, Err(CoreError::Rpc("timeout".into())));
    }

    #[test]
    fn merge_matches_addresses_case_insensitively() -> eyre::Result<()> {
        let balances = vec![TokenBalance {
            contract_address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_owned(),
            amount: BalanceAmount::Base(parse_hex_u256("0x1e8480")?),
        }];
        let merged = merge(&evm_catalog(), &balances);
        assert_eq!(merged.len(), 2, "native token is not part of the merge");

        let usdc = merged.first().ok_or_else(|| eyre::eyre!("missing usdc"))?;
        assert_eq!(usdc.token.symbol, "USDC");
        assert_eq!(usdc.amount, "2");
        assert_eq!(usdc.display, "2.0000");

        let dai = merged.get(1).ok_or_else(|| eyre::eyre!("missing dai"))?;
        assert_eq!(dai.amount, "0");
        assert_eq!(dai.display, "0.0000");
        Ok(())
    }

    #[test]
    fn merge_accepts_pre_shifted_solana_amounts() {
        let catalog = vec![
            token("11111111111111111111111111111111", "SOL", 9),
            token("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v", "USDC", 6),
        ];
        let balances = vec![TokenBalance {
            contract_address: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_owned(),
            amount: BalanceAmount::Ui("12.345678".to_owned()),
        }];
        let merged = merge(&catalog, &balances);
        assert_eq!(merged.first().map(|h| h.display.as_str()), Some("12.3457"));
    }

    #[test]
    fn portfolio_uses_separate_native_source() -> eyre::Result<()> {
        let p = portfolio(
            "0xabc",
            ChainId(1),
            &evm_catalog(),
            &[],
            Some(NativeBalance::wei(parse_hex_u256("0xDE0B6B3A7640000")?)),
        );
        let native = p.native.ok_or_else(|| eyre::eyre!("missing native"))?;
        assert_eq!(native.token.symbol, "ETH");
        assert_eq!(native.display, "1.0000");
        assert_eq!(p.tokens.len(), 2);
        Ok(())
    }

    #[test]
    fn one_unrepresentable_token_does_not_sink_the_merge() -> eyre::Result<()> {
        let catalog = vec![
            token("0x0000000000000000000000000000000000000000", "ETH", 18),
            token("0xaa", "SIX", 6),
            token("0xbb", "HUGE", 80),
        ];
        let balances = vec![
            TokenBalance {
                contract_address: "0xaa".to_owned(),
                amount: BalanceAmount::Base(parse_hex_u256("0x0f4240")?),
            },
            TokenBalance {
                contract_address: "0xbb".to_owned(),
                amount: BalanceAmount::Base(parse_hex_u256("0x1")?),
            },
        ];
        let p = portfolio("0xabc", ChainId(1), &catalog, &balances, None);
        assert_eq!(p.tokens.len(), 2);

        let six = p.tokens.first().ok_or_else(|| eyre::eyre!("missing 0xaa"))?;
        assert_eq!(six.amount, "1");
        assert_eq!(six.display, "1.0000");

        let huge = p.tokens.get(1).ok_or_else(|| eyre::eyre!("missing 0xbb"))?;
        assert_eq!(huge.amount, "0");
        assert_eq!(huge.display, "0.0000");
        Ok(())
    }

    #[test]
    fn malformed_ui_amount_reads_as_zero() {
        let catalog = vec![
            token("11111111111111111111111111111111", "SOL", 9),
            token("M1", "ONE", 6),
            token("M2", "TWO", 6),
        ];
        let balances = vec![
            TokenBalance {
                contract_address: "M1".to_owned(),
                amount: BalanceAmount::Ui("not-a-number".to_owned()),
            },
            TokenBalance {
                contract_address: "M2".to_owned(),
                amount: BalanceAmount::Ui("3.5".to_owned()),
            },
        ];
        let merged = merge(&catalog, &balances);
        let displays: Vec<&str> = merged.iter().map(|h| h.display.as_str()).collect();
        assert_eq!(displays, vec!["0.0000", "3.5000"]);
    }

    #[test]
    fn unrepresentable_native_is_omitted() {
        let catalog = vec![token("0x0000000000000000000000000000000000000000", "WEIRD", 80)];
        let native = NativeBalance {
            amount: alloy::primitives::U256::from(1_u8),
            decimals: 80,
        };
        let p = portfolio("0xabc", ChainId(1), &catalog, &[], Some(native));
        assert!(p.native.is_none());
        assert!(p.tokens.is_empty());
    }

    #[tokio::test]
    async fn cached_until_balance_changes() -> eyre::Result<()> {
        let src = FakeSource::new(vec![(ChainId(1), Ok(vec![]))]);
        let agg = BalanceAggregator::new(Arc::clone(&src) as Arc<dyn BalanceSource>, Duration::from_secs(30));

        agg.fetch_balances("0xAbC", ChainId(1)).await?;
        agg.fetch_balances("0xabc", ChainId(1)).await?;
        assert_eq!(src.calls(), 1, "same key regardless of address case");

        agg.apply(&SessionEvent::BalanceChanged {
            account: Account::evm("0xabc", ChainId(1)),
            balance: NativeBalance::wei(alloy::primitives::U256::from(1_u8)),
        });
        agg.fetch_balances("0xabc", ChainId(1)).await?;
        assert_eq!(src.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn follow_forgets_on_disconnect() -> eyre::Result<()> {
        let src = FakeSource::new(vec![(ChainId(1), Ok(vec![]))]);
        let agg = Arc::new(BalanceAggregator::new(
            Arc::clone(&src) as Arc<dyn BalanceSource>,
            Duration::from_secs(30),
        ));
        let (tx, rx) = broadcast::channel(8);
        let task = agg.follow(rx);

        agg.fetch_balances("0xabc", ChainId(1)).await?;
        tx.send(SessionEvent::Disconnected {
            account: Account::evm("0xabc", ChainId(1)),
        })?;
        drop(tx);
        task.await?;

        agg.fetch_balances("0xabc", ChainId(1)).await?;
        assert_eq!(src.calls(), 2);
        Ok(())
    }
}
