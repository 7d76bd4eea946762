use std::sync::Arc;

use crate::{
    aggregator::{portfolio, BalanceAggregator},
    catalog::TokenCatalog,
    errors::CoreError,
    types::{ChainId, NativeBalance, Portfolio},
};

/// Catalog, then balances, then merge.
#[derive(Clone)]
pub struct PortfolioLoader {
    catalog: Arc<TokenCatalog>,
    balances: Arc<BalanceAggregator>,
}

impl PortfolioLoader {
    pub const fn new(catalog: Arc<TokenCatalog>, balances: Arc<BalanceAggregator>) -> Self {
        Self { catalog, balances }
    }

    /// A failed catalog blocks the load. Balances for a chain without a balance endpoint read as
    /// zero.
    pub async fn load(
        &self,
        address: &str,
        chain_id: ChainId,
        native: Option<NativeBalance>,
    ) -> Result<Portfolio, CoreError> {
        let catalog = self.catalog.resolve(chain_id).await?;
        let balances = self.balances.fetch_balances(address, chain_id).await?;
        let p = portfolio(address, chain_id, &catalog, &balances, native);
        tracing::debug!(chain_id = %chain_id, tokens = p.tokens.len(), "portfolio loaded");
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregator::BalanceSource,
        amount::parse_hex_u256,
        catalog::TokenSource,
        retry::BackoffConfig,
        types::{BalanceAmount, Token, TokenBalance},
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct Catalog(Result<Vec<Token>, CoreError>);

    #[async_trait]
    impl TokenSource for Catalog {
        async fn fetch_tokens(&self, _chain_id: ChainId) -> Result<Vec<Token>, CoreError> {
            self.0.clone()
        }
    }

    struct Balances(Result<Vec<TokenBalance>, CoreError>);

    #[async_trait]
    impl BalanceSource for Balances {
        async fn token_balances(
            &self,
            _address: &str,
            _chain_id: ChainId,
        ) -> Result<Vec<TokenBalance>, CoreError> {
            self.0.clone()
        }
    }

    fn token(address: &str, symbol: &str, decimals: u8) -> Token {
        Token {
            chain_id: ChainId(137),
            address: address.to_owned(),
            symbol: symbol.to_owned(),
            name: symbol.to_owned(),
            decimals,
            logo_uri: None,
            price_usd: None,
            coin_key: None,
        }
    }

    fn loader(
        tokens: Result<Vec<Token>, CoreError>,
        balances: Result<Vec<TokenBalance>, CoreError>,
    ) -> PortfolioLoader {
        PortfolioLoader::new(
            Arc::new(TokenCatalog::new(
                Arc::new(Catalog(tokens)),
                Duration::from_secs(300),
                BackoffConfig::immediate(1),
            )),
            Arc::new(BalanceAggregator::new(
                Arc::new(Balances(balances)),
                Duration::from_secs(30),
            )),
        )
    }

    fn polygon_tokens() -> Vec<Token> {
        vec![
            token("0x0000000000000000000000000000000000000000", "POL", 18),
            token("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359", "USDC", 6),
        ]
    }

    #[tokio::test]
    async fn merges_catalog_balances_and_native() -> eyre::Result<()> {
        let l = loader(
            Ok(polygon_tokens()),
            Ok(vec![TokenBalance {
                contract_address: "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359".to_owned(),
                amount: BalanceAmount::Base(parse_hex_u256("0x2dc6c0")?),
            }]),
        );
        let p = l
            .load("0xowner", ChainId(137), Some(NativeBalance::wei(parse_hex_u256("0x0")?)))
            .await?;
        assert_eq!(p.native.map(|h| h.display), Some("0.0000".to_owned()));
        assert_eq!(p.tokens.first().map(|h| h.display.as_str()), Some("3.0000"));
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_catalog_blocks() {
        let l = loader(Err(CoreError::CatalogUnavailable("down".into())), Ok(vec![]));
        let res = l.load("0xowner", ChainId(137), None).await;
        assert!(matches!(res, Err(CoreError::CatalogUnavailable(_))));
    }

    #[tokio::test]
    async fn unsupported_balances_read_as_zero() -> eyre::Result<()> {
        let l = loader(
            Ok(polygon_tokens()),
            Err(CoreError::UnsupportedChain("Network not supported".into())),
        );
        let p = l.load("0xowner", ChainId(137), None).await?;
        assert_eq!(p.tokens.len(), 1);
        assert!(p.tokens.iter().all(|h| h.amount == "0"));
        assert_eq!(p.native, None);
        Ok(())
    }

    #[tokio::test]
    async fn balance_transport_failure_surfaces() {
        let l = loader(Ok(polygon_tokens()), Err(CoreError::Rpc("timeout".into())));
        let res = l.load("0xowner", ChainId(137), None).await;
        assert!(matches!(res, Err(CoreError::Rpc(_))));
    }
}
