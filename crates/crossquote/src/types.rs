use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{amount, errors::CoreError};

/// Numeric chain identifier. EVM networks use their network id; Solana uses a fixed sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const SOLANA: Self = Self(1_151_111_081_099_710);

    pub const fn is_solana(self) -> bool {
        self.0 == Self::SOLANA.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChainId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("sol") || t.eq_ignore_ascii_case("solana") {
            return Ok(Self::SOLANA);
        }
        t.parse::<u64>()
            .map(Self)
            .map_err(|_| CoreError::InvalidInput(format!("invalid chain id: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Solana,
    Bitcoin,
}

impl ChainKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Solana => "solana",
            Self::Bitcoin => "bitcoin",
        }
    }
}

/// A connected wallet account. Bitcoin accounts carry no chain id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub kind: ChainKind,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
}

impl Account {
    pub fn evm(address: impl Into<String>, chain_id: ChainId) -> Self {
        Self {
            kind: ChainKind::Evm,
            address: address.into(),
            chain_id: Some(chain_id),
        }
    }

    pub fn solana(address: impl Into<String>) -> Self {
        Self {
            kind: ChainKind::Solana,
            address: address.into(),
            chain_id: Some(ChainId::SOLANA),
        }
    }

    pub fn bitcoin(address: impl Into<String>) -> Self {
        Self {
            kind: ChainKind::Bitcoin,
            address: address.into(),
            chain_id: None,
        }
    }
}

/// Token metadata as served by the token catalog. Index 0 of a catalog is the native token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub chain_id: ChainId,
    pub address: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub decimals: u8,
    #[serde(rename = "logoURI", default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    #[serde(rename = "priceUSD", default, skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin_key: Option<String>,
}

/// Amount carried by a canonical balance.
///
/// EVM balances arrive as raw integers and are shifted by the token's decimals only when
/// rendered; Solana balances arrive already shifted by the RPC node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BalanceAmount {
    Base(U256),
    Ui(String),
}

impl BalanceAmount {
    /// Canonical human-scale decimal string for this amount.
    pub fn to_decimal_string(&self, decimals: u8) -> Result<String, CoreError> {
        match self {
            Self::Base(v) => amount::format_base_to_ui(*v, decimals),
            Self::Ui(s) => Ok(s.clone()),
        }
    }

    pub fn display(&self, decimals: u8) -> Result<String, CoreError> {
        amount::round_to_places(&self.to_decimal_string(decimals)?, amount::DISPLAY_PLACES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenBalance {
    pub contract_address: String,
    pub amount: BalanceAmount,
}

impl TokenBalance {
    pub fn lookup_key(&self) -> String {
        self.contract_address.to_lowercase()
    }
}

/// Balance of a chain's intrinsic currency (wei, lamports, sats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NativeBalance {
    pub amount: U256,
    pub decimals: u8,
}

impl NativeBalance {
    pub const fn lamports(v: u64) -> Self {
        Self {
            amount: U256::from_limbs([v, 0, 0, 0]),
            decimals: 9,
        }
    }

    pub const fn sats(v: u64) -> Self {
        Self {
            amount: U256::from_limbs([v, 0, 0, 0]),
            decimals: 8,
        }
    }

    pub const fn wei(v: U256) -> Self {
        Self {
            amount: v,
            decimals: 18,
        }
    }

    pub fn display(&self) -> Result<String, CoreError> {
        amount::display_base(self.amount, self.decimals)
    }
}

/// A catalog token with its balance overlaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Holding {
    pub token: Token,
    /// Canonical decimal string.
    pub amount: String,
    /// Rounded to [`amount::DISPLAY_PLACES`].
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Portfolio {
    pub chain_id: ChainId,
    pub address: String,
    pub native: Option<Holding>,
    pub tokens: Vec<Holding>,
}

/// Chain side of a quote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteChain {
    Evm(ChainId),
    Solana,
}

impl QuoteChain {
    /// Value sent as `fromChain`/`toChain`.
    pub fn query_value(self) -> String {
        match self {
            Self::Evm(id) => id.to_string(),
            Self::Solana => "SOL".to_owned(),
        }
    }

    pub const fn for_chain_id(id: ChainId) -> Self {
        if id.is_solana() {
            Self::Solana
        } else {
            Self::Evm(id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteParams {
    pub token: String,
    pub address: String,
    pub chain: QuoteChain,
}

/// A complete, runnable quote input set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QuoteRequest {
    pub from: QuoteParams,
    pub to: QuoteParams,
    /// Amount of `from.token` in base units.
    pub amount: U256,
}

impl QuoteRequest {
    /// `None` unless both sides are present and the amount is positive.
    pub fn enabled(from: Option<QuoteParams>, to: Option<QuoteParams>, amount: U256) -> Option<Self> {
        match (from, to) {
            (Some(from), Some(to)) if !amount.is_zero() => Some(Self { from, to, amount }),
            _ => None,
        }
    }
}

/// Quote payload. Its shape belongs to the quote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Quote(pub Value);

#[cfg(test)]
mod tests {
    use super::*;

    fn side(chain: QuoteChain) -> QuoteParams {
        QuoteParams {
            token: "0xtoken".into(),
            address: "0xowner".into(),
            chain,
        }
    }

    #[test]
    fn quote_request_requires_both_sides_and_positive_amount() {
        let from = Some(side(QuoteChain::Evm(ChainId(1))));
        let to = Some(side(QuoteChain::Solana));
        assert!(QuoteRequest::enabled(None, to.clone(), U256::from(5_u8)).is_none());
        assert!(QuoteRequest::enabled(from.clone(), None, U256::from(5_u8)).is_none());
        assert!(QuoteRequest::enabled(from.clone(), to.clone(), U256::ZERO).is_none());
        assert!(QuoteRequest::enabled(from, to, U256::from(5_u8)).is_some());
    }

    #[test]
    fn token_deserializes_catalog_shape() -> eyre::Result<()> {
        let t: Token = serde_json::from_value(serde_json::json!({
            "chainId": 1,
            "address": "0x0000000000000000000000000000000000000000",
            "symbol": "ETH",
            "name": "ETH",
            "decimals": 18,
            "logoURI": "https://example.invalid/eth.png",
            "priceUSD": "3120.55",
            "coinKey": "ETH"
        }))?;
        assert_eq!(t.chain_id, ChainId(1));
        assert_eq!(t.price_usd.as_deref(), Some("3120.55"));
        assert_eq!(t.coin_key.as_deref(), Some("ETH"));
        Ok(())
    }

    #[test]
    fn chain_id_parses_solana_alias() -> eyre::Result<()> {
        assert_eq!("solana".parse::<ChainId>()?, ChainId::SOLANA);
        assert_eq!("8453".parse::<ChainId>()?, ChainId(8453));
        assert!("base".parse::<ChainId>().is_err());
        Ok(())
    }

    #[test]
    fn native_balances_render_with_their_decimals() -> eyre::Result<()> {
        assert_eq!(NativeBalance::lamports(1_500_000_000).display()?, "1.5000");
        assert_eq!(NativeBalance::sats(12_345).display()?, "0.0001");
        Ok(())
    }
}
