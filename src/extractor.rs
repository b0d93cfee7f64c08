//! Table Usage Extraction
//!
//! [`TableUsageExtractor`] is the entry point of the crate. Construction runs the whole
//! pipeline, paged log retrieval → record filtering → aggregation, to completion before
//! it returns, so every count it exposes covers the full log window. After that the
//! extractor only hands out the frozen tally, one pair per [`TableUsageExtractor::extract`]
//! call, and never touches the network again.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use bq_table_usage::extractor::{ExtractorOptions, TableUsageExtractor};
//! use bq_table_usage::log_source::LogQueryClient;
//!
//! # fn example(client: &dyn LogQueryClient) -> anyhow::Result<()> {
//! let options = ExtractorOptions::new("my-project").with_page_size(500);
//! let mut extractor = TableUsageExtractor::new(client, options)?;
//!
//! while let Some((key, count)) = extractor.extract() {
//!     println!("{} -> {}", key, count);
//! }
//! # Ok(())
//! # }
//! ```

use crate::aggregator::{TallyCursor, UsageAggregator};
use crate::filter::{classify, EntryOutcome, IdentityFilter, SkipReason};
use crate::log_source::{build_request, LogQueryClient, PageSource, RetryPolicy};
use crate::models::UsageKey;
use crate::sink::UsageSink;
use crate::timestamp_parser::TimestampParser;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const DEFAULT_PAGE_SIZE: u32 = 300;
pub const EXTRACTOR_SCOPE: &str = "extractor.bigquery_table_usage";

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorOptions {
    pub project_id: String,
    /// Inclusive lower bound of the scan; `None` means 00:00:00Z yesterday.
    pub start: Option<DateTime<Utc>>,
    pub page_size: u32,
    pub identity_filter: Option<IdentityFilter>,
    pub retry: RetryPolicy,
}

impl ExtractorOptions {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            start: None,
            page_size: DEFAULT_PAGE_SIZE,
            identity_filter: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_identity_filter(mut self, filter: IdentityFilter) -> Self {
        self.identity_filter = Some(filter);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resolved_start(&self) -> DateTime<Utc> {
        self.start
            .unwrap_or_else(|| TimestampParser::start_of_yesterday(Utc::now()))
    }
}

/// Counters from the build phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    pub pages_fetched: usize,
    pub entries_seen: usize,
    pub entries_counted: usize,
    pub keys_recorded: u64,
    pub distinct_keys: usize,
    pub skipped: BTreeMap<&'static str, usize>,
    pub table_count_mismatches: usize,
    pub transient_failures: usize,
}

impl ExtractionStats {
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

pub struct TableUsageExtractor {
    cursor: TallyCursor,
    stats: ExtractionStats,
}

impl TableUsageExtractor {
    /// Scan the whole log window and build the tally. Blocks until the scan is done.
    pub fn new<C: LogQueryClient + ?Sized>(client: &C, options: ExtractorOptions) -> Result<Self> {
        let start = options.resolved_start();
        let request = build_request(&options.project_id, options.page_size, &start);
        info!(
            project_id = %options.project_id,
            start = %TimestampParser::format_for_filter(&start),
            page_size = options.page_size,
            email_pattern = options.identity_filter.as_ref().map(IdentityFilter::pattern),
            "Starting BigQuery table usage extraction"
        );

        let mut pages = PageSource::open(client, request, options.retry.clone())?;
        let mut aggregator = UsageAggregator::new();
        let mut stats = ExtractionStats::default();
        let progress_interval = options.page_size.max(1) as usize;

        for page in pages.by_ref() {
            for entry in page? {
                stats.entries_seen += 1;
                if stats.entries_seen % progress_interval == 0 {
                    info!("Aggregated {} records", stats.entries_seen);
                }

                match classify(&entry, options.identity_filter.as_ref()) {
                    EntryOutcome::Skip(reason) => {
                        *stats.skipped.entry(reason.as_str()).or_insert(0) += 1;
                    }
                    EntryOutcome::Usage { keys, mismatch } => {
                        if let Some(mismatch) = mismatch {
                            stats.table_count_mismatches += 1;
                            warn!(
                                job_id = mismatch.job_id.as_deref().unwrap_or("<unknown>"),
                                referenced_tables = mismatch.referenced,
                                total_tables_processed = mismatch.processed,
                                "The number of tables listed in job {} is not consistent",
                                mismatch.job_id.as_deref().unwrap_or("<unknown>")
                            );
                        }
                        stats.entries_counted += 1;
                        for key in keys {
                            aggregator.record(key);
                        }
                    }
                }
            }
        }

        stats.pages_fetched = pages.pages_fetched();
        stats.transient_failures = pages.transient_failures();
        stats.keys_recorded = aggregator.total();
        stats.distinct_keys = aggregator.len();

        info!(
            pages = stats.pages_fetched,
            entries = stats.entries_seen,
            counted = stats.entries_counted,
            skipped = stats.total_skipped(),
            distinct_keys = stats.distinct_keys,
            transient_failures = stats.transient_failures,
            "Finished aggregating table usage"
        );

        Ok(Self {
            cursor: aggregator.finish().into_cursor(),
            stats,
        })
    }

    /// Next (key, count) pair, or `None` once the tally is exhausted (and forever after).
    pub fn extract(&mut self) -> Option<(UsageKey, u64)> {
        self.cursor.next()
    }

    /// Push every remaining pair into `sink`, then finish it.
    pub fn drain_into(&mut self, sink: &mut dyn UsageSink) -> Result<usize> {
        let mut delivered = 0;
        while let Some((key, count)) = self.extract() {
            sink.accept(&key, count)?;
            delivered += 1;
        }
        sink.finish()?;
        Ok(delivered)
    }

    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    pub fn scope(&self) -> &'static str {
        EXTRACTOR_SCOPE
    }
}

impl Iterator for TableUsageExtractor {
    type Item = (UsageKey, u64);

    fn next(&mut self) -> Option<Self::Item> {
        self.extract()
    }
}
