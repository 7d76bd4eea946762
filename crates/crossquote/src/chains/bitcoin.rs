use bitcoin::{address::NetworkUnchecked, Address};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::str::FromStr as _;

use crate::{
    config::ensure_https_or_loopback,
    errors::CoreError,
    retry::{retry_with_backoff, BackoffConfig},
    types::NativeBalance,
};

#[derive(Debug, Clone, Deserialize)]
struct AddrStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct AddrResp {
    chain_stats: AddrStats,
}

pub fn validate_address(s: &str) -> Result<Address<NetworkUnchecked>, CoreError> {
    Address::from_str(s.trim())
        .map_err(|e| CoreError::InvalidInput(format!("invalid bitcoin address {s}: {e}")))
}

/// Balance-only Bitcoin access through a Blockstream-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct BitcoinAdapter {
    base_url: String,
    client: Client,
    backoff: BackoffConfig,
}

impl BitcoinAdapter {
    pub fn new(base_url: &str, client: Client, backoff: BackoffConfig) -> Result<Self, CoreError> {
        ensure_https_or_loopback(base_url, "bitcoin_api_base_url")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
            backoff,
        })
    }

    async fn fetch_confirmed_sats(&self, address: &str) -> Result<u64, CoreError> {
        let url = format!("{}/address/{address}", self.base_url);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::Rpc(format!("fetch btc address: {}", e.without_url())))?;
        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            return Err(CoreError::InvalidInput(format!(
                "bitcoin upstream rejected address {address}"
            )));
        }
        if !status.is_success() {
            return Err(CoreError::Rpc(format!("bitcoin upstream returned http {status}")));
        }
        let v: AddrResp = resp
            .json()
            .await
            .map_err(|e| CoreError::Rpc(format!("decode btc address json: {}", e.without_url())))?;
        Ok(v.chain_stats
            .funded_txo_sum
            .saturating_sub(v.chain_stats.spent_txo_sum))
    }

    /// Confirmed balance in sats.
    pub async fn native_balance(&self, address: &str) -> Result<NativeBalance, CoreError> {
        let address = validate_address(address)?.assume_checked().to_string();
        let sats = retry_with_backoff(
            &self.backoff,
            || self.fetch_confirmed_sats(&address),
            CoreError::is_retryable,
        )
        .await?;
        tracing::debug!(address = %address, sats, "fetched bitcoin balance");
        Ok(NativeBalance::sats(sats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::http_client;
    use httpmock::prelude::*;
    use std::time::Duration;

    const ADDR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    #[tokio::test]
    async fn confirmed_balance_is_funded_minus_spent() -> eyre::Result<()> {
        let body = r#"{"address":"x","chain_stats":{"funded_txo_count":2,"funded_txo_sum":150000,"spent_txo_count":1,"spent_txo_sum":50000,"tx_count":3},"mempool_stats":{"funded_txo_count":0,"funded_txo_sum":7,"spent_txo_count":0,"spent_txo_sum":0,"tx_count":0}}"#;
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/address/{ADDR}"));
                then.status(200)
                    .header("content-type", "application/json")
                    .body(body);
            })
            .await;
        let adapter = BitcoinAdapter::new(
            &server.base_url(),
            http_client(Duration::from_secs(5))?,
            BackoffConfig::immediate(1),
        )?;
        let bal = adapter.native_balance(ADDR).await?;
        assert_eq!(bal, NativeBalance::sats(100_000));
        assert_eq!(bal.display()?, "0.0010");
        m.assert_hits_async(1).await;
        Ok(())
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(validate_address(ADDR).is_ok());
        assert!(validate_address("0x00000000219ab540356cBB839Cbe05303d7705Fa").is_err());
    }

    #[test]
    fn refuses_plain_http_upstream() -> eyre::Result<()> {
        let client = http_client(Duration::from_secs(1))?;
        assert!(BitcoinAdapter::new("http://blockstream.info/api", client, BackoffConfig::immediate(1)).is_err());
        Ok(())
    }
}
