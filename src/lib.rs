//! BigQuery Table Usage Library
//!
//! Extracts per-table, per-user access counts for BigQuery by scanning Cloud Logging audit
//! entries for completed query jobs. One extraction is one pass: every page of the log
//! window is read and tallied before the first count is handed out, and the resulting
//! (key, count) pairs can be read once.
//!
//! ## Architecture Overview
//!
//! - [`log_source`] - Paged `entries:list` retrieval with continuation-token paging and retry
//! - [`filter`] - Decides which audit entries count and derives their usage keys
//! - [`aggregator`] - Tallies usage keys and freezes them into a one-shot cursor
//! - [`extractor`] - The facade that runs the pipeline and hands out pairs
//! - [`models`] - Usage key and wire types
//! - [`sink`] / [`display`] - Downstream consumers of the pairs
//! - [`auth`] / [`logging_api`] - Credential resolution and the HTTP log client
//! - [`config`] / [`logging`] - Configuration and structured logging
//!
//! ## Main Entry Point
//!
//! ```rust,no_run
//! use bq_table_usage::auth::CredentialSource;
//! use bq_table_usage::logging_api::{CloudLoggingClient, DEFAULT_LOGGING_ENDPOINT};
//! use bq_table_usage::{ExtractorOptions, TableUsageExtractor};
//!
//! # fn example() -> anyhow::Result<()> {
//! let http = reqwest::blocking::Client::new();
//! let tokens = CredentialSource::Default.resolve(&http)?;
//! let client = CloudLoggingClient::new(DEFAULT_LOGGING_ENDPOINT, tokens)?;
//!
//! let mut extractor = TableUsageExtractor::new(&client, ExtractorOptions::new("my-project"))?;
//! while let Some((key, count)) = extractor.extract() {
//!     println!("{} {}", key, count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod auth;
pub mod config;
pub mod display;
pub mod extractor;
pub mod filter;
pub mod log_source;
pub mod logging;
pub mod logging_api;
pub mod models;
pub mod sink;
pub mod timestamp_parser;

pub use extractor::{ExtractionStats, ExtractorOptions, TableUsageExtractor};
pub use log_source::{LogQueryClient, RetryPolicy};
pub use models::UsageKey;
pub use sink::UsageSink;
