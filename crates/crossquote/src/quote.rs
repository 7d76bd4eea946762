use alloy::primitives::U256;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;

use crate::{
    config::ensure_https_or_loopback,
    errors::CoreError,
    retry::{retry_with_backoff, BackoffConfig},
    types::{Quote, QuoteParams, QuoteRequest},
};

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote, CoreError>;
}

/// LI.FI-compatible `GET /quote`.
#[derive(Debug, Clone)]
pub struct LiFiQuoteService {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl LiFiQuoteService {
    pub fn new(base_url: &str, api_key: Option<String>, client: Client) -> Result<Self, CoreError> {
        ensure_https_or_loopback(base_url, "quote_service_base_url")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            client,
        })
    }

    fn query(request: &QuoteRequest) -> [(&'static str, String); 7] {
        [
            ("fromChain", request.from.chain.query_value()),
            ("toChain", request.to.chain.query_value()),
            ("fromToken", request.from.token.clone()),
            ("toToken", request.to.token.clone()),
            ("fromAddress", request.from.address.clone()),
            ("toAddress", request.to.address.clone()),
            ("fromAmount", request.amount.to_string()),
        ]
    }
}

#[async_trait]
impl QuoteSource for LiFiQuoteService {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote, CoreError> {
        let mut req = self
            .client
            .get(format!("{}/quote", self.base_url))
            .query(&Self::query(request));
        if let Some(k) = &self.api_key {
            req = req.header("x-lifi-api-key", k);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CoreError::QuoteUnavailable(e.without_url().to_string()))?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let msg = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("quote service found no route");
            return Err(CoreError::RouteNotFound(msg.to_owned()));
        }
        if !status.is_success() {
            return Err(CoreError::QuoteUnavailable(format!(
                "quote service returned http {status}"
            )));
        }

        let mut body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::QuoteUnavailable(format!("decode quote: {}", e.without_url())))?;
        let quote = match body.get_mut("result") {
            Some(result) => result.take(),
            None => body,
        };
        Ok(Quote(quote))
    }
}

/// Snapshot of the orchestrator. `version` identifies the input set the snapshot belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteState {
    pub quote: Option<Quote>,
    pub is_loading: bool,
    pub error: Option<CoreError>,
    pub version: u64,
}

impl QuoteState {
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Disabled inputs: nothing requested, nothing to show.
    pub const fn is_idle(&self) -> bool {
        !self.is_loading && self.quote.is_none() && self.error.is_none()
    }
}

#[derive(Debug, Default)]
struct Inputs {
    version: u64,
    request: Option<QuoteRequest>,
    /// Version of the run whose result is still pending, if any.
    in_flight: Option<u64>,
}

struct Shared {
    source: Arc<dyn QuoteSource>,
    backoff: BackoffConfig,
    debounce: Duration,
    inputs: Mutex<Inputs>,
    state: watch::Sender<QuoteState>,
}

impl Shared {
    fn inputs(&self) -> MutexGuard<'_, Inputs> {
        self.inputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, version: u64) -> bool {
        self.inputs().version == version
    }

    fn finish(&self, version: u64, res: Result<Quote, CoreError>) {
        let mut inputs = self.inputs();
        if inputs.version != version {
            tracing::debug!(version, current = inputs.version, "discarding superseded quote result");
            return;
        }
        inputs.in_flight = None;
        let (quote, error) = match res {
            Ok(q) => (Some(q), None),
            Err(e) => {
                tracing::warn!(version, code = e.code(), error = %e, "quote failed");
                (None, Some(e))
            }
        };
        self.state.send_replace(QuoteState {
            quote,
            is_loading: false,
            error,
            version,
        });
    }

    async fn run(self: Arc<Self>, version: u64, request: QuoteRequest, debounce: Duration) {
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }
        if !self.is_current(version) {
            tracing::trace!(version, "quote inputs changed during debounce; skipping request");
            return;
        }

        tracing::debug!(
            version,
            from_chain = %request.from.chain.query_value(),
            to_chain = %request.to.chain.query_value(),
            "requesting quote"
        );
        let res = retry_with_backoff(
            &self.backoff,
            || self.source.fetch_quote(&request),
            CoreError::is_retryable,
        )
        .await
        .map_err(|e| match e {
            CoreError::Rpc(m) | CoreError::CatalogUnavailable(m) => CoreError::QuoteUnavailable(m),
            other => other,
        });
        self.finish(version, res);
    }
}

/// Drives quote requests from the current `(from, to, amount)` selection.
///
/// Only the newest input set can publish a result. Debounced runs that were superseded before
/// their timer fired never reach the network; superseded runs already on the wire are left to
/// finish and their results dropped.
#[derive(Clone)]
pub struct QuoteOrchestrator {
    shared: Arc<Shared>,
}

impl QuoteOrchestrator {
    pub fn new(source: Arc<dyn QuoteSource>, backoff: BackoffConfig, debounce: Duration) -> Self {
        let (state, _) = watch::channel(QuoteState::default());
        Self {
            shared: Arc::new(Shared {
                source,
                backoff,
                debounce,
                inputs: Mutex::new(Inputs::default()),
                state,
            }),
        }
    }

    /// Set the current selection. Identical inputs are a no-op; incomplete inputs or a zero amount
    /// put the orchestrator in the idle state without any request.
    pub fn watch(&self, from: Option<QuoteParams>, to: Option<QuoteParams>, amount: U256) {
        let request = QuoteRequest::enabled(from, to, amount);
        let mut inputs = self.shared.inputs();
        if inputs.request == request {
            return;
        }
        inputs.version = inputs.version.wrapping_add(1);
        let version = inputs.version;
        inputs.request.clone_from(&request);

        let Some(request) = request else {
            inputs.in_flight = None;
            self.shared.state.send_replace(QuoteState {
                version,
                ..QuoteState::default()
            });
            return;
        };

        inputs.in_flight = Some(version);
        self.shared.state.send_replace(QuoteState {
            is_loading: true,
            version,
            ..QuoteState::default()
        });
        drop(inputs);
        tokio::spawn(Arc::clone(&self.shared).run(version, request, self.shared.debounce));
    }

    /// Re-run the current inputs. Returns `false` when there is nothing to run or a request for
    /// these inputs is already in flight.
    pub fn refetch(&self) -> bool {
        let mut inputs = self.shared.inputs();
        let Some(request) = inputs.request.clone() else {
            return false;
        };
        if inputs.in_flight.is_some() {
            return false;
        }
        inputs.version = inputs.version.wrapping_add(1);
        let version = inputs.version;
        inputs.in_flight = Some(version);
        self.shared.state.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
            s.version = version;
        });
        drop(inputs);
        tokio::spawn(Arc::clone(&self.shared).run(version, request, Duration::ZERO));
        true
    }

    pub fn state(&self) -> QuoteState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QuoteState> {
        self.shared.state.subscribe()
    }

    /// Wait until no request is loading and return that state.
    pub async fn settled(&self) -> QuoteState {
        let mut rx = self.subscribe();
        let settled = rx.wait_for(|s| !s.is_loading).await.map(|s| s.clone());
        settled.unwrap_or_else(|_closed| self.state())
    }
}
