//! Paged Audit Log Retrieval
//!
//! Wraps an `entries:list` query against the log backend and turns it into a lazy,
//! finite sequence of pages. Pagination follows the continuation token returned with
//! each response; pages are fetched strictly one after another because every request
//! depends on the token of the previous response.
//!
//! ## Failure handling
//!
//! - Each request retries the client call [`RetryPolicy::num_retries`] more times with
//!   exponential backoff before the failure reaches the page level.
//! - A failure on the very first request is returned from [`PageSource::open`].
//! - A failure while continuing is handled by [`ContinuationRetry`]. The default waits a
//!   fixed delay and retries the same request forever, so callers only ever see the next
//!   page arrive late.

use crate::models::{ListEntriesRequest, ListEntriesResponse, RawLogEntry};
use crate::timestamp_parser::TimestampParser;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const BIGQUERY_RESOURCE_TYPE: &str = "bigquery_resource";
pub const JOB_COMPLETED_METHOD: &str = "jobservice.jobcompleted";

pub const DEFAULT_NUM_RETRIES: u32 = 3;
pub const DEFAULT_PAGE_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_TRANSPORT_BACKOFF: Duration = Duration::from_millis(500);

/// An authenticated client able to run one `entries:list` call.
pub trait LogQueryClient {
    fn list_entries(&self, request: &ListEntriesRequest) -> Result<ListEntriesResponse>;
}

impl<C: LogQueryClient + ?Sized> LogQueryClient for &C {
    fn list_entries(&self, request: &ListEntriesRequest) -> Result<ListEntriesResponse> {
        (**self).list_entries(request)
    }
}

impl<C: LogQueryClient + ?Sized> LogQueryClient for Box<C> {
    fn list_entries(&self, request: &ListEntriesRequest) -> Result<ListEntriesResponse> {
        (**self).list_entries(request)
    }
}

/// Server-side filter selecting completed BigQuery jobs logged at or after `start`.
pub fn build_filter(start: &DateTime<Utc>) -> String {
    format!(
        r#"resource.type="{}" AND protoPayload.methodName="{}" AND timestamp >= "{}""#,
        BIGQUERY_RESOURCE_TYPE,
        JOB_COMPLETED_METHOD,
        TimestampParser::format_for_filter(start)
    )
}

pub fn build_request(project_id: &str, page_size: u32, start: &DateTime<Utc>) -> ListEntriesRequest {
    ListEntriesRequest {
        resource_names: vec![format!("projects/{}", project_id)],
        page_size,
        filter: build_filter(start),
        page_token: None,
    }
}

/// What to do when a continuation request fails after its transport retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationRetry {
    /// Sleep `delay` and retry the same request with no attempt cap.
    Forever { delay: Duration },
    /// Sleep `delay` between attempts; give up after `max_attempts` failures.
    Bounded { delay: Duration, max_attempts: u32 },
}

impl Default for ContinuationRetry {
    fn default() -> Self {
        Self::Forever {
            delay: DEFAULT_PAGE_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub transport_backoff: Duration,
    pub continuation: ContinuationRetry,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            num_retries: DEFAULT_NUM_RETRIES,
            transport_backoff: DEFAULT_TRANSPORT_BACKOFF,
            continuation: ContinuationRetry::default(),
        }
    }
}

impl RetryPolicy {
    /// Run one request, retrying the client call up to `num_retries` extra times.
    pub fn execute<C: LogQueryClient + ?Sized>(
        &self,
        client: &C,
        request: &ListEntriesRequest,
    ) -> Result<ListEntriesResponse> {
        let mut attempt = 0u32;
        loop {
            match client.list_entries(request) {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.num_retries => {
                    let backoff = self.backoff_for(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.num_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying log query"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "log query failed after {} attempt(s)",
                        attempt + 1
                    )))
                }
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.transport_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Lazy sequence of pages for one query.
pub struct PageSource<'a, C: ?Sized> {
    client: &'a C,
    request: ListEntriesRequest,
    retry: RetryPolicy,
    pending: Option<ListEntriesResponse>,
    next_token: Option<String>,
    pages_fetched: usize,
    transient_failures: usize,
}

impl<'a, C: LogQueryClient + ?Sized> PageSource<'a, C> {
    /// Issue the first request. Its failure is fatal: there is nothing to resume from.
    pub fn open(client: &'a C, request: ListEntriesRequest, retry: RetryPolicy) -> Result<Self> {
        let first = retry
            .execute(client, &request)
            .context("Initial log query failed")?;

        Ok(Self {
            client,
            request,
            retry,
            pending: Some(first),
            next_token: None,
            pages_fetched: 1,
            transient_failures: 0,
        })
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Continuation failures that were retried at the page level.
    pub fn transient_failures(&self) -> usize {
        self.transient_failures
    }

    fn fetch_continuation(&mut self, token: String) -> Result<ListEntriesResponse> {
        self.request.page_token = Some(token);
        let mut failures = 0u32;

        loop {
            let err = match self.retry.execute(self.client, &self.request) {
                Ok(response) => {
                    self.pages_fetched += 1;
                    return Ok(response);
                }
                Err(err) => err,
            };

            failures += 1;
            self.transient_failures += 1;
            let delay = match self.retry.continuation {
                ContinuationRetry::Forever { delay } => delay,
                ContinuationRetry::Bounded {
                    delay,
                    max_attempts,
                } => {
                    if failures >= max_attempts {
                        return Err(err.context(format!(
                            "Log page request failed {} time(s), giving up",
                            failures
                        )));
                    }
                    delay
                }
            };

            warn!(
                attempt = failures,
                page = self.pages_fetched + 1,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "Log page request failed, retrying after delay"
            );
            thread::sleep(delay);
        }
    }
}

impl<C: LogQueryClient + ?Sized> Iterator for PageSource<'_, C> {
    type Item = Result<Vec<RawLogEntry>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pending.is_none() {
                let token = self.next_token.take()?;
                match self.fetch_continuation(token) {
                    Ok(response) => self.pending = Some(response),
                    Err(err) => return Some(Err(err)),
                }
            }

            let response = self.pending.take()?;
            self.next_token = response.continuation().map(str::to_string);
            if let Some(entries) = response.entries {
                return Some(Ok(entries));
            }
        }
    }
}

impl<C: LogQueryClient + ?Sized> std::iter::FusedIterator for PageSource<'_, C> {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct ScriptedClient {
        responses: RefCell<VecDeque<Result<ListEntriesResponse>>>,
        requests: RefCell<Vec<ListEntriesRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<ListEntriesResponse>>) -> Self {
            Self {
                responses: RefCell::new(responses.into()),
                requests: RefCell::new(Vec::new()),
            }
        }

        fn tokens_seen(&self) -> Vec<Option<String>> {
            self.requests
                .borrow()
                .iter()
                .map(|request| request.page_token.clone())
                .collect()
        }
    }

    impl LogQueryClient for ScriptedClient {
        fn list_entries(&self, request: &ListEntriesRequest) -> Result<ListEntriesResponse> {
            self.requests.borrow_mut().push(request.clone());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }
    }

    fn page(ids: &[u64], token: Option<&str>) -> Result<ListEntriesResponse> {
        Ok(ListEntriesResponse {
            entries: Some(ids.iter().map(|id| json!({ "id": id })).collect()),
            next_page_token: token.map(str::to_string),
        })
    }

    fn fast_retry(continuation: ContinuationRetry) -> RetryPolicy {
        RetryPolicy {
            num_retries: 0,
            transport_backoff: Duration::ZERO,
            continuation,
        }
    }

    fn forever() -> ContinuationRetry {
        ContinuationRetry::Forever {
            delay: Duration::ZERO,
        }
    }

    fn request() -> ListEntriesRequest {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        build_request("my-project", 300, &start)
    }

    fn ids(pages: Vec<Result<Vec<RawLogEntry>>>) -> Vec<Vec<u64>> {
        pages
            .into_iter()
            .map(|page| {
                page.unwrap()
                    .iter()
                    .map(|entry| entry["id"].as_u64().unwrap())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_build_request() {
        let request = request();
        assert_eq!(request.resource_names, vec!["projects/my-project"]);
        assert_eq!(request.page_size, 300);
        assert_eq!(
            request.filter,
            r#"resource.type="bigquery_resource" AND protoPayload.methodName="jobservice.jobcompleted" AND timestamp >= "2024-01-01T00:00:00Z""#
        );
        assert!(request.page_token.is_none());
    }

    #[test]
    fn test_follows_tokens_across_three_pages() {
        let client = ScriptedClient::new(vec![
            page(&[1, 2], Some("t1")),
            page(&[3], Some("t2")),
            page(&[4, 5], None),
        ]);
        let source = PageSource::open(&client, request(), fast_retry(forever())).unwrap();
        let pages: Vec<_> = source.collect();

        assert_eq!(ids(pages), vec![vec![1, 2], vec![3], vec![4, 5]]);
        assert_eq!(
            client.tokens_seen(),
            vec![None, Some("t1".to_string()), Some("t2".to_string())]
        );
    }

    #[test]
    fn test_first_request_failure_propagates() {
        let client = ScriptedClient::new(vec![Err(anyhow::anyhow!("permission denied"))]);
        let result = PageSource::open(&client, request(), fast_retry(forever()));
        assert!(result.is_err());
    }

    #[test]
    fn test_continuation_failure_is_retried_without_duplicate_pages() {
        let client = ScriptedClient::new(vec![
            page(&[1], Some("t1")),
            Err(anyhow::anyhow!("quota exceeded")),
            Err(anyhow::anyhow!("quota exceeded")),
            page(&[2], None),
        ]);
        let mut source = PageSource::open(&client, request(), fast_retry(forever())).unwrap();
        let pages: Vec<_> = source.by_ref().collect();

        assert_eq!(ids(pages), vec![vec![1], vec![2]]);
        assert_eq!(source.transient_failures(), 2);
        assert_eq!(source.pages_fetched(), 2);
        assert_eq!(
            client.tokens_seen(),
            vec![
                None,
                Some("t1".to_string()),
                Some("t1".to_string()),
                Some("t1".to_string())
            ]
        );
    }

    #[test]
    fn test_bounded_retry_surfaces_error_then_ends() {
        let client = ScriptedClient::new(vec![
            page(&[1], Some("t1")),
            Err(anyhow::anyhow!("quota exceeded")),
            Err(anyhow::anyhow!("quota exceeded")),
        ]);
        let policy = fast_retry(ContinuationRetry::Bounded {
            delay: Duration::ZERO,
            max_attempts: 2,
        });
        let mut source = PageSource::open(&client, request(), policy).unwrap();

        assert!(source.next().unwrap().is_ok());
        assert!(source.next().unwrap().is_err());
        assert!(source.next().is_none());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_transport_retries_absorb_failures_within_a_request() {
        let client = ScriptedClient::new(vec![
            Err(anyhow::anyhow!("connection reset")),
            Err(anyhow::anyhow!("connection reset")),
            page(&[7], None),
        ]);
        let policy = RetryPolicy {
            num_retries: 2,
            transport_backoff: Duration::ZERO,
            continuation: forever(),
        };
        let source = PageSource::open(&client, request(), policy).unwrap();
        assert_eq!(source.transient_failures(), 0);
        assert_eq!(ids(source.collect()), vec![vec![7]]);
    }

    #[test]
    fn test_transport_retries_are_bounded() {
        let client = ScriptedClient::new(vec![
            Err(anyhow::anyhow!("connection reset")),
            Err(anyhow::anyhow!("connection reset")),
            page(&[7], None),
        ]);
        let policy = RetryPolicy {
            num_retries: 1,
            transport_backoff: Duration::ZERO,
            continuation: forever(),
        };
        assert!(PageSource::open(&client, request(), policy).is_err());
        assert_eq!(client.requests.borrow().len(), 2);
    }

    #[test]
    fn test_page_without_entries_keeps_paginating() {
        let client = ScriptedClient::new(vec![
            Ok(ListEntriesResponse {
                entries: None,
                next_page_token: Some("t1".to_string()),
            }),
            page(&[9], None),
        ]);
        let source = PageSource::open(&client, request(), fast_retry(forever())).unwrap();
        assert_eq!(ids(source.collect()), vec![vec![9]]);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            transport_backoff: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
    }
}
