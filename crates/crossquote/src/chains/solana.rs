use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use std::{str::FromStr as _, sync::Arc, time::Duration};

use crate::{
    errors::CoreError,
    feed::{NativeBalanceFeed, NativeBalanceSource},
    retry::{try_all_with_backoff, BackoffConfig},
    types::{Account, BalanceAmount, NativeBalance, TokenBalance},
};

use super::post_json_rpc;

pub fn parse_pubkey(s: &str) -> Result<Pubkey, CoreError> {
    Pubkey::from_str(s.trim())
        .map_err(|e| CoreError::InvalidInput(format!("invalid solana pubkey {s}: {e}")))
}

/// Decimal string for a parsed `tokenAmount`. Prefers the node's exact `uiAmountString`.
fn ui_amount_string(token_amount: &Value, ui_amount: f64) -> String {
    token_amount
        .get("uiAmountString")
        .and_then(Value::as_str)
        .map_or_else(|| ui_amount.to_string(), str::to_owned)
}

/// Normalize a `getTokenAccountsByOwner` (jsonParsed) result.
///
/// Accounts with zero decimals (NFT-like mints) or a non-positive `uiAmount` are dropped. A null
/// `uiAmount` counts as zero.
pub fn parse_token_accounts(result: &Value) -> Result<Vec<TokenBalance>, CoreError> {
    let accounts = result
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::Rpc("getTokenAccountsByOwner: missing result.value".to_owned()))?;

    let mut out = Vec::with_capacity(accounts.len());
    for acc in accounts {
        let Some(info) = acc.pointer("/account/data/parsed/info") else {
            continue;
        };
        let Some(mint) = info.get("mint").and_then(Value::as_str) else {
            continue;
        };
        let Some(token_amount) = info.get("tokenAmount") else {
            continue;
        };
        let decimals = token_amount
            .get("decimals")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let ui_amount = token_amount
            .get("uiAmount")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if decimals == 0 || ui_amount <= 0.0 {
            continue;
        }
        out.push(TokenBalance {
            contract_address: mint.to_owned(),
            amount: BalanceAmount::Ui(ui_amount_string(token_amount, ui_amount)),
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct SolanaAdapter {
    rpc_urls: Vec<String>,
    client: Client,
    backoff: BackoffConfig,
    timeout: Duration,
}

impl SolanaAdapter {
    pub const fn new(
        rpc_urls: Vec<String>,
        client: Client,
        backoff: BackoffConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            rpc_urls,
            client,
            backoff,
            timeout,
        }
    }

    fn rpc_for_url(&self, url: &str) -> RpcClient {
        RpcClient::new_with_timeout_and_commitment(
            url.to_owned(),
            self.timeout,
            CommitmentConfig::confirmed(),
        )
    }

    pub async fn fetch_token_accounts(&self, owner: &str) -> Result<Vec<TokenBalance>, CoreError> {
        let owner = parse_pubkey(owner)?;
        let params = json!([
            owner.to_string(),
            { "programId": spl_token::id().to_string() },
            { "encoding": "jsonParsed" }
        ]);

        let result = try_all_with_backoff(
            &self.rpc_urls,
            &self.backoff,
            |url| {
                let url = url.clone();
                let params = params.clone();
                async move {
                    post_json_rpc(&self.client, &url, "getTokenAccountsByOwner", params).await
                }
            },
            CoreError::is_retryable,
        )
        .await?;

        let balances = parse_token_accounts(&result)?;
        tracing::debug!(owner = %owner, count = balances.len(), "fetched spl token accounts");
        Ok(balances)
    }

    pub async fn native_balance(&self, owner: &str) -> Result<NativeBalance, CoreError> {
        let owner = parse_pubkey(owner)?;
        let lamports = try_all_with_backoff(
            &self.rpc_urls,
            &self.backoff,
            |url| {
                let rpc = self.rpc_for_url(url);
                async move {
                    rpc.get_balance(&owner)
                        .await
                        .map_err(|e| CoreError::Rpc(format!("getBalance: {e}")))
                }
            },
            CoreError::is_retryable,
        )
        .await?;
        Ok(NativeBalance::lamports(lamports))
    }

    /// Live lamport balance for `owner`, polled every `interval`. Open a new feed when the owner
    /// changes; the old one stops on `close` or drop.
    pub fn watch_native_balance<F>(
        &self,
        owner: &str,
        interval: Duration,
        on_change: F,
    ) -> Result<NativeBalanceFeed, CoreError>
    where
        F: Fn(&NativeBalance) + Send + 'static,
    {
        parse_pubkey(owner)?;
        Ok(NativeBalanceFeed::spawn(
            Arc::new(LamportSource(self.clone())),
            Account::solana(owner),
            interval,
            on_change,
        ))
    }
}

struct LamportSource(SolanaAdapter);

#[async_trait]
impl NativeBalanceSource for LamportSource {
    async fn native_balance(&self, account: &Account) -> Result<NativeBalance, CoreError> {
        self.0.native_balance(&account.address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::http_client;
    use httpmock::prelude::*;

    fn account(mint: &str, ui_amount: Value, decimals: u64) -> Value {
        json!({
            "pubkey": "11111111111111111111111111111111",
            "account": {
                "data": {
                    "program": "spl-token",
                    "parsed": {
                        "type": "account",
                        "info": {
                            "mint": mint,
                            "owner": "11111111111111111111111111111111",
                            "tokenAmount": {
                                "amount": "0",
                                "decimals": decimals,
                                "uiAmount": ui_amount
                            }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn drops_nft_like_and_empty_accounts() -> eyre::Result<()> {
        let result = json!({
            "context": {"slot": 1},
            "value": [
                account("M1", json!(2.5), 6),
                account("M2", json!(1), 0),
                account("M3", json!(0), 9),
                account("M4", Value::Null, 9)
            ]
        });
        let got = parse_token_accounts(&result)?;
        assert_eq!(
            got,
            vec![TokenBalance {
                contract_address: "M1".to_owned(),
                amount: BalanceAmount::Ui("2.5".to_owned()),
            }]
        );
        Ok(())
    }

    #[test]
    fn prefers_exact_ui_amount_string() -> eyre::Result<()> {
        let mut acc = account("M1", json!(0.1), 9);
        if let Some(ta) = acc.pointer_mut("/account/data/parsed/info/tokenAmount") {
            ta["uiAmountString"] = json!("0.100000001");
        }
        let got = parse_token_accounts(&json!({ "value": [acc] }))?;
        assert_eq!(
            got.first().map(|b| b.amount.clone()),
            Some(BalanceAmount::Ui("0.100000001".to_owned()))
        );
        Ok(())
    }

    #[test]
    fn float_ui_amount_is_used_without_exact_string() -> eyre::Result<()> {
        let got = parse_token_accounts(&json!({ "value": [account("M1", json!(0.25), 6)] }))?;
        assert_eq!(
            got.first().map(|b| b.amount.clone()),
            Some(BalanceAmount::Ui("0.25".to_owned()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn queries_spl_program_with_json_parsed_encoding() -> eyre::Result<()> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "context": {"slot": 1}, "value": [account("M1", json!(3), 6)] }
        });
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST).path("/").json_body(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "getTokenAccountsByOwner",
                    "params": [
                        "11111111111111111111111111111111",
                        { "programId": spl_token::id().to_string() },
                        { "encoding": "jsonParsed" }
                    ],
                }));
                then.status(200)
                    .header("content-type", "application/json")
                    .body(body.to_string());
            })
            .await;
        let adapter = SolanaAdapter::new(
            vec![server.url("/")],
            http_client(Duration::from_secs(5))?,
            BackoffConfig::immediate(1),
            Duration::from_secs(5),
        );
        let got = adapter
            .fetch_token_accounts("11111111111111111111111111111111")
            .await?;
        assert_eq!(got.len(), 1);
        m.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_owner_is_invalid_input() -> eyre::Result<()> {
        let adapter = SolanaAdapter::new(
            vec!["http://127.0.0.1:9".to_owned()],
            http_client(Duration::from_secs(1))?,
            BackoffConfig::immediate(1),
            Duration::from_secs(1),
        );
        let res = adapter.fetch_token_accounts("0xnot-solana").await;
        assert!(matches!(res, Err(CoreError::InvalidInput(_))));
        Ok(())
    }

    #[tokio::test]
    async fn native_feed_polls_get_balance() -> eyre::Result<()> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "context": {"slot": 1}, "value": 2_500_000_000_u64 }
        });
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"getBalance\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(body.to_string());
            })
            .await;
        let adapter = SolanaAdapter::new(
            vec![server.url("/")],
            http_client(Duration::from_secs(5))?,
            BackoffConfig::immediate(1),
            Duration::from_secs(5),
        );
        let mut feed = adapter.watch_native_balance(
            "11111111111111111111111111111111",
            Duration::from_millis(20),
            |_| {},
        )?;
        let mut rx = feed.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.changed()).await??;
        assert_eq!(feed.latest(), Some(NativeBalance::lamports(2_500_000_000)));
        assert!(m.hits_async().await >= 1);

        feed.close();
        assert!(feed.is_closed());
        Ok(())
    }

    #[test]
    fn watch_rejects_malformed_owner() -> eyre::Result<()> {
        let adapter = SolanaAdapter::new(
            vec!["http://127.0.0.1:9".to_owned()],
            http_client(Duration::from_secs(1))?,
            BackoffConfig::immediate(1),
            Duration::from_secs(1),
        );
        let res = adapter.watch_native_balance("not base58!", Duration::from_secs(1), |_| {});
        assert!(matches!(res, Err(CoreError::InvalidInput(_))));
        Ok(())
    }
}
