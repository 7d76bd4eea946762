use serde::Serialize;
use thiserror::Error;

/// A structured error suitable for printing to a CLI consumer as JSON.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorView {
    pub code: &'static str,
    pub message: String,
}

impl ErrorView {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// No endpoint or upstream mapping exists for the chain. Balance callers degrade this to an
    /// empty result.
    #[error("chain not supported: {0}")]
    UnsupportedChain(String),

    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("token catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),

    /// The quote service answered that no route exists. Never retried.
    #[error("no route found: {0}")]
    RouteNotFound(String),

    #[error("wallet disconnect failed: {0}")]
    Disconnect(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedChain(_) => "unsupported_chain",
            Self::Rpc(_) => "rpc_error",
            Self::CatalogUnavailable(_) => "catalog_unavailable",
            Self::QuoteUnavailable(_) => "quote_unavailable",
            Self::RouteNotFound(_) => "route_not_found",
            Self::Disconnect(_) => "disconnect_error",
            Self::InvalidInput(_) => "invalid_input",
        }
    }

    /// Transport and upstream-service failures are worth another attempt; everything else is a
    /// definitive answer.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::CatalogUnavailable(_) | Self::QuoteUnavailable(_)
        )
    }

    pub const fn is_unsupported_chain(&self) -> bool {
        matches!(self, Self::UnsupportedChain(_))
    }
}

impl From<&CoreError> for ErrorView {
    fn from(e: &CoreError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<crate::retry::NoEndpoints> for CoreError {
    fn from(_: crate::retry::NoEndpoints) -> Self {
        Self::UnsupportedChain("no endpoints configured".to_owned())
    }
}
