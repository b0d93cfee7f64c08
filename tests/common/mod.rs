#![allow(dead_code)]

use anyhow::Result;
use bq_table_usage::log_source::{ContinuationRetry, LogQueryClient, RetryPolicy};
use bq_table_usage::models::{ListEntriesRequest, ListEntriesResponse};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A completed-job audit entry referencing `tables` as (project, dataset, table).
pub fn job_entry(state: &str, tables: &[(&str, &str, &str)], email: &str) -> Value {
    let referenced: Vec<Value> = tables
        .iter()
        .map(|(project, dataset, table)| {
            json!({ "projectId": project, "datasetId": dataset, "tableId": table })
        })
        .collect();

    json!({
        "logName": "projects/p/logs/cloudaudit.googleapis.com%2Fdata_access",
        "timestamp": "2024-01-15T10:30:00Z",
        "resource": { "type": "bigquery_resource" },
        "protoPayload": {
            "methodName": "jobservice.jobcompleted",
            "authenticationInfo": { "principalEmail": email },
            "serviceData": {
                "jobCompletedEvent": {
                    "eventName": "query_job_completed",
                    "job": {
                        "jobName": { "projectId": "p", "jobId": "bquxjob_1", "location": "US" },
                        "jobStatus": { "state": state, "error": {} },
                        "jobStatistics": {
                            "referencedTables": referenced,
                            "totalTablesProcessed": tables.len()
                        }
                    }
                }
            }
        }
    })
}

pub fn done_entry(tables: &[(&str, &str, &str)], email: &str) -> Value {
    job_entry("DONE", tables, email)
}

pub fn with_error(mut entry: Value) -> Value {
    entry["protoPayload"]["serviceData"]["jobCompletedEvent"]["job"]["jobStatus"]["error"] =
        json!({ "code": 8, "message": "Quota exceeded" });
    entry
}

pub fn page(entries: Vec<Value>, token: Option<&str>) -> Result<ListEntriesResponse> {
    Ok(ListEntriesResponse {
        entries: Some(entries),
        next_page_token: token.map(str::to_string),
    })
}

/// Replays canned responses in order and records every request it receives.
pub struct ScriptedLogClient {
    responses: RefCell<VecDeque<Result<ListEntriesResponse>>>,
    requests: RefCell<Vec<ListEntriesRequest>>,
}

impl ScriptedLogClient {
    pub fn new(responses: Vec<Result<ListEntriesResponse>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn single_page(entries: Vec<Value>) -> Self {
        Self::new(vec![page(entries, None)])
    }

    pub fn requests(&self) -> Vec<ListEntriesRequest> {
        self.requests.borrow().clone()
    }
}

impl LogQueryClient for ScriptedLogClient {
    fn list_entries(&self, request: &ListEntriesRequest) -> Result<ListEntriesResponse> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("no more scripted responses")))
    }
}

/// Retry policy that never sleeps.
pub fn instant_retry() -> RetryPolicy {
    RetryPolicy {
        num_retries: 0,
        transport_backoff: Duration::ZERO,
        continuation: ContinuationRetry::Forever {
            delay: Duration::ZERO,
        },
    }
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return its result plus every event
/// it logged, one line per event, formatted as `LEVEL target: message fields`.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    let captured = CapturedLogs::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .without_time()
        .with_writer(move || writer.clone())
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let bytes = captured.0.lock().unwrap().clone();
    let lines = String::from_utf8_lossy(&bytes)
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    (result, lines)
}
