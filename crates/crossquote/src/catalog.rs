use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    cache::KeyedStore,
    config::ensure_https_or_loopback,
    errors::CoreError,
    retry::{retry_with_backoff, BackoffConfig},
    types::{ChainId, Token},
};

/// Upstream that lists the tokens of one chain, native token first.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_tokens(&self, chain_id: ChainId) -> Result<Vec<Token>, CoreError>;
}

#[derive(Debug, Deserialize)]
struct TokensResp {
    #[serde(default)]
    tokens: HashMap<String, Vec<Token>>,
}

/// LI.FI-compatible `GET /tokens?chains=<id>`.
#[derive(Debug, Clone)]
pub struct LiFiTokenService {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl LiFiTokenService {
    pub fn new(base_url: &str, api_key: Option<String>, client: Client) -> Result<Self, CoreError> {
        ensure_https_or_loopback(base_url, "token_service_base_url")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl TokenSource for LiFiTokenService {
    async fn fetch_tokens(&self, chain_id: ChainId) -> Result<Vec<Token>, CoreError> {
        let mut req = self
            .client
            .get(format!("{}/tokens", self.base_url))
            .query(&[("chains", chain_id.to_string())]);
        if let Some(k) = &self.api_key {
            req = req.header("x-lifi-api-key", k);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CoreError::CatalogUnavailable(e.without_url().to_string()))?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            return Err(CoreError::UnsupportedChain(format!(
                "token service does not list chain {chain_id}"
            )));
        }
        if !status.is_success() {
            return Err(CoreError::CatalogUnavailable(format!(
                "token service returned http {status}"
            )));
        }

        let mut body: TokensResp = resp.json().await.map_err(|e| {
            CoreError::CatalogUnavailable(format!("decode tokens: {}", e.without_url()))
        })?;
        body.tokens.remove(&chain_id.to_string()).ok_or_else(|| {
            CoreError::UnsupportedChain(format!("token service returned no list for chain {chain_id}"))
        })
    }
}

/// Cached, ordered token lists per chain.
pub struct TokenCatalog {
    source: Arc<dyn TokenSource>,
    store: KeyedStore<ChainId, Arc<Vec<Token>>>,
    backoff: BackoffConfig,
}

impl TokenCatalog {
    pub fn new(source: Arc<dyn TokenSource>, ttl: Duration, backoff: BackoffConfig) -> Self {
        Self {
            source,
            store: KeyedStore::new(ttl),
            backoff,
        }
    }

    /// Token list for `chain_id` in upstream order; index 0 is the native token.
    pub async fn resolve(&self, chain_id: ChainId) -> Result<Arc<Vec<Token>>, CoreError> {
        if chain_id.0 == 0 {
            return Err(CoreError::UnsupportedChain("chain id 0".to_owned()));
        }
        let source = Arc::clone(&self.source);
        let backoff = self.backoff.clone();
        let tokens = self
            .store
            .get_or_fetch(chain_id, move || async move {
                let tokens = retry_with_backoff(
                    &backoff,
                    || source.fetch_tokens(chain_id),
                    CoreError::is_retryable,
                )
                .await?;
                tracing::info!(chain_id = %chain_id, count = tokens.len(), "token catalog loaded");
                Ok(Arc::new(tokens))
            })
            .await;
        if let Err(e) = &tokens {
            tracing::warn!(chain_id = %chain_id, code = e.code(), error = %e, "token catalog resolve failed");
        }
        tokens
    }

    pub async fn native_token(&self, chain_id: ChainId) -> Result<Option<Token>, CoreError> {
        Ok(self.resolve(chain_id).await?.first().cloned())
    }

    /// Case-insensitive lookup by token address.
    pub async fn find(&self, chain_id: ChainId, address: &str) -> Result<Option<Token>, CoreError> {
        let address = address.trim();
        Ok(self
            .resolve(chain_id)
            .await?
            .iter()
            .find(|t| t.address.eq_ignore_ascii_case(address))
            .cloned())
    }

    pub fn invalidate(&self, chain_id: ChainId) {
        self.store.invalidate(&chain_id);
    }
}
