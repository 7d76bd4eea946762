pub mod bitcoin;
pub mod evm;
pub mod solana;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::{collections::BTreeMap, time::Duration};

use crate::{
    aggregator::BalanceSource,
    config::CrossQuoteConfig,
    errors::CoreError,
    feed::NativeBalanceSource,
    types::{Account, ChainId, ChainKind, NativeBalance, TokenBalance},
};

use self::{bitcoin::BitcoinAdapter, evm::EvmAdapter, solana::SolanaAdapter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn http_client(timeout: Duration) -> Result<Client, CoreError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| CoreError::Rpc(format!("build http client: {e}")))
}

/// POST a JSON-RPC 2.0 request and return its `result`.
///
/// `400` means the endpoint does not serve this network and maps to `UnsupportedChain`. Request
/// URLs are stripped from transport errors since they may embed API keys.
pub async fn post_json_rpc(
    client: &Client,
    url: &str,
    method: &str,
    params: Value,
) -> Result<Value, CoreError> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });
    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| CoreError::Rpc(format!("{method}: {}", e.without_url())))?;

    let status = resp.status();
    if status == StatusCode::BAD_REQUEST {
        return Err(CoreError::UnsupportedChain(format!(
            "{method}: network not supported by endpoint"
        )));
    }
    if !status.is_success() {
        return Err(CoreError::Rpc(format!("{method}: http {status}")));
    }

    let v: Value = resp
        .json()
        .await
        .map_err(|e| CoreError::Rpc(format!("{method}: decode json: {}", e.without_url())))?;
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        return Err(CoreError::Rpc(format!("{method}: {err}")));
    }
    v.get("result")
        .cloned()
        .ok_or_else(|| CoreError::Rpc(format!("{method}: response missing result")))
}

/// The closed set of chain dialects.
#[derive(Debug, Clone)]
pub enum ChainAdapter {
    Evm(EvmAdapter),
    Solana(SolanaAdapter),
    Bitcoin(BitcoinAdapter),
}

impl ChainAdapter {
    pub const fn kind(&self) -> ChainKind {
        match self {
            Self::Evm(_) => ChainKind::Evm,
            Self::Solana(_) => ChainKind::Solana,
            Self::Bitcoin(_) => ChainKind::Bitcoin,
        }
    }

    pub async fn fetch_token_balances(&self, address: &str) -> Result<Vec<TokenBalance>, CoreError> {
        match self {
            Self::Evm(a) => a.fetch_token_balances(address).await,
            Self::Solana(a) => a.fetch_token_accounts(address).await,
            Self::Bitcoin(_) => Err(CoreError::UnsupportedChain(
                "bitcoin has no token balances".to_owned(),
            )),
        }
    }

    pub async fn native_balance(&self, address: &str) -> Result<NativeBalance, CoreError> {
        match self {
            Self::Evm(a) => a.native_balance(address).await,
            Self::Solana(a) => a.native_balance(address).await,
            Self::Bitcoin(a) => a.native_balance(address).await,
        }
    }
}

/// Adapters built from config, selected by chain id (or by kind for Bitcoin).
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    evm: BTreeMap<ChainId, EvmAdapter>,
    solana: Option<SolanaAdapter>,
    bitcoin: BitcoinAdapter,
}

impl AdapterRegistry {
    pub fn from_config(cfg: &CrossQuoteConfig) -> Result<Self, CoreError> {
        let client = http_client(cfg.http.timeout())?;
        let backoff = cfg.retry.backoff();

        let mut evm = BTreeMap::new();
        for (name, chain) in &cfg.rpc.evm {
            let urls = chain.all_rpc_urls();
            if urls.is_empty() {
                tracing::debug!(chain = %name, "evm chain has no usable endpoint; skipping");
                continue;
            }
            let id = ChainId(chain.chain_id);
            evm.insert(
                id,
                EvmAdapter::new(name, id, urls, client.clone(), backoff.clone()),
            );
        }

        let solana_urls = cfg.rpc.solana_rpc_urls();
        let solana = (!solana_urls.is_empty()).then(|| {
            SolanaAdapter::new(solana_urls, client.clone(), backoff.clone(), cfg.http.timeout())
        });

        Ok(Self {
            evm,
            solana,
            bitcoin: BitcoinAdapter::new(&cfg.http.bitcoin_api_base_url, client, backoff)?,
        })
    }

    pub fn adapter_for(&self, chain_id: ChainId) -> Option<ChainAdapter> {
        if chain_id.is_solana() {
            return self.solana.clone().map(ChainAdapter::Solana);
        }
        self.evm.get(&chain_id).cloned().map(ChainAdapter::Evm)
    }

    pub fn adapter_for_account(&self, account: &Account) -> Option<ChainAdapter> {
        match account.kind {
            ChainKind::Bitcoin => Some(ChainAdapter::Bitcoin(self.bitcoin.clone())),
            ChainKind::Solana => self.adapter_for(ChainId::SOLANA),
            ChainKind::Evm => account.chain_id.and_then(|id| self.adapter_for(id)),
        }
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.evm.keys().copied().collect();
        if self.solana.is_some() {
            ids.push(ChainId::SOLANA);
        }
        ids
    }
}

#[async_trait]
impl BalanceSource for AdapterRegistry {
    async fn token_balances(
        &self,
        address: &str,
        chain_id: ChainId,
    ) -> Result<Vec<TokenBalance>, CoreError> {
        let adapter = self
            .adapter_for(chain_id)
            .ok_or_else(|| CoreError::UnsupportedChain(format!("chain {chain_id}")))?;
        adapter.fetch_token_balances(address).await
    }
}

#[async_trait]
impl NativeBalanceSource for AdapterRegistry {
    async fn native_balance(&self, account: &Account) -> Result<NativeBalance, CoreError> {
        let adapter = self.adapter_for_account(account).ok_or_else(|| {
            CoreError::UnsupportedChain(format!(
                "no native balance source for {} account",
                account.kind.as_str()
            ))
        })?;
        adapter.native_balance(&account.address).await
    }
}
