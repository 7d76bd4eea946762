//! Balance aggregation and cross-chain swap quotes for EVM, Solana and Bitcoin wallets.
//!
//! The chain adapters, token catalog and quote orchestrator are usable on their own; the
//! `crossquote` binary wires them together from a [`config::CrossQuoteConfig`].
#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

pub mod aggregator;
pub mod amount;
pub mod cache;
pub mod catalog;
pub mod chains;
pub mod cli_output;
pub mod commands;
pub mod config;
pub mod doctor;
pub mod errors;
pub mod feed;
pub mod paths;
pub mod portfolio;
pub mod quote;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;
