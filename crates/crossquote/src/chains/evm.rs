use alloy::{
    primitives::Address,
    providers::{Provider as _, RootProvider},
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr as _;

use crate::{
    amount::parse_hex_u256,
    errors::CoreError,
    retry::{try_all_with_backoff, BackoffConfig},
    types::{BalanceAmount, ChainId, NativeBalance, TokenBalance},
};

use super::post_json_rpc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalancesResult {
    #[serde(default)]
    token_balances: Vec<RawTokenBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenBalance {
    contract_address: String,
    /// `null` when the node could not read this contract (reported in a sibling `error` field).
    #[serde(default)]
    token_balance: Option<String>,
}

/// Normalize an `alchemy_getTokenBalances` result. Contract addresses are lower-cased; amounts stay
/// in base units until the token's decimals are known. An entry with an unreadable amount is dropped
/// on its own; the rest of the batch is kept.
pub fn parse_token_balances(result: &Value) -> Result<Vec<TokenBalance>, CoreError> {
    let parsed: TokenBalancesResult = serde_json::from_value(result.clone())
        .map_err(|e| CoreError::Rpc(format!("decode token balances: {e}")))?;

    let mut out = Vec::with_capacity(parsed.token_balances.len());
    for raw in parsed.token_balances {
        let Some(hex) = raw.token_balance else {
            tracing::debug!(contract = %raw.contract_address, "token balance unavailable; skipping");
            continue;
        };
        let amount = match parse_hex_u256(&hex) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(contract = %raw.contract_address, error = %e, "unreadable token balance; skipping");
                continue;
            }
        };
        out.push(TokenBalance {
            contract_address: raw.contract_address.to_lowercase(),
            amount: BalanceAmount::Base(amount),
        });
    }
    Ok(out)
}

pub fn parse_address(s: &str) -> Result<Address, CoreError> {
    Address::from_str(s.trim())
        .map_err(|e| CoreError::InvalidInput(format!("invalid evm address {s}: {e}")))
}

#[derive(Debug, Clone)]
pub struct EvmAdapter {
    name: String,
    chain_id: ChainId,
    rpc_urls: Vec<String>,
    client: Client,
    backoff: BackoffConfig,
}

impl EvmAdapter {
    pub fn new(
        name: &str,
        chain_id: ChainId,
        rpc_urls: Vec<String>,
        client: Client,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            name: name.to_owned(),
            chain_id,
            rpc_urls,
            client,
            backoff,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn provider_for_url(&self, url: &str) -> Result<RootProvider, CoreError> {
        let u: reqwest::Url = url
            .parse()
            .map_err(|e| CoreError::InvalidInput(format!("invalid rpc url for {}: {e}", self.name)))?;
        let http = alloy::transports::http::Http::with_client(self.client.clone(), u);
        let rpc_client = alloy::rpc::client::RpcClient::new(http, false);
        Ok(RootProvider::new(rpc_client))
    }

    pub async fn fetch_token_balances(&self, address: &str) -> Result<Vec<TokenBalance>, CoreError> {
        let owner = parse_address(address)?;
        let params = json!([owner.to_string(), "erc20"]);

        let result = try_all_with_backoff(
            &self.rpc_urls,
            &self.backoff,
            |url| {
                let url = url.clone();
                let params = params.clone();
                async move {
                    post_json_rpc(&self.client, &url, "alchemy_getTokenBalances", params).await
                }
            },
            CoreError::is_retryable,
        )
        .await?;

        let balances = parse_token_balances(&result)?;
        tracing::debug!(
            chain = %self.name,
            chain_id = %self.chain_id,
            count = balances.len(),
            "fetched evm token balances"
        );
        Ok(balances)
    }

    pub async fn native_balance(&self, address: &str) -> Result<NativeBalance, CoreError> {
        let owner = parse_address(address)?;
        let wei = try_all_with_backoff(
            &self.rpc_urls,
            &self.backoff,
            |url| {
                let url = url.clone();
                async move {
                    let p = self.provider_for_url(&url)?;
                    p.get_balance(owner).await.map_err(|e| {
                        CoreError::Rpc(format!("eth_getBalance on {}: {e}", self.name))
                    })
                }
            },
            CoreError::is_retryable,
        )
        .await?;
        Ok(NativeBalance::wei(wei))
    }
}
