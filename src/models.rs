//! Core Data Models
//!
//! This module defines the data structures that flow through the extraction pipeline,
//! from the wire types of the Cloud Logging `entries:list` method to the usage key the
//! aggregator counts.
//!
//! ## Data Flow
//!
//! 1. **Request**: [`ListEntriesRequest`] - Query body plus the continuation cursor
//! 2. **Response**: [`ListEntriesResponse`] - One page of raw entries
//! 3. **Audit view**: [`AuditLogEntry`] - Typed view over the parts of a raw entry we read
//! 4. **Aggregation**: [`UsageKey`] - The (table, identity) unit that gets counted
//!
//! Raw entries stay as [`serde_json::Value`] until the filter asks for a typed view, so a
//! structurally odd entry only costs a failed deserialization and a skip.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Database tag carried by every key this crate produces.
pub const BIGQUERY_DATABASE: &str = "bigquery";

/// Column marker for usage attributed to a whole table.
pub const TABLE_LEVEL_COLUMN: &str = "*";

/// A raw entry as returned by the log source.
pub type RawLogEntry = Value;

/// Composite identity of one (resource, identity) access relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageKey {
    pub database: String,
    pub cluster: String,
    pub schema: String,
    pub table: String,
    pub column: String,
    pub email: String,
}

impl UsageKey {
    /// Table-level key for a table referenced by a job run as `email`.
    pub fn table_level(table: &TableReference, email: &str) -> Self {
        Self {
            database: BIGQUERY_DATABASE.to_string(),
            cluster: table.project_id.clone(),
            schema: table.dataset_id.clone(),
            table: table.table_id.clone(),
            column: TABLE_LEVEL_COLUMN.to_string(),
            email: email.to_string(),
        }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{},{},{})",
            self.database, self.cluster, self.schema, self.table, self.column, self.email
        )
    }
}

/// Body of an `entries:list` call. The page token is the only part that moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntriesRequest {
    pub resource_names: Vec<String>,
    pub page_size: u32,
    pub filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

/// One page returned by the log source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntriesResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<RawLogEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl ListEntriesResponse {
    /// Continuation token, treating an empty string as absent.
    pub fn continuation(&self) -> Option<&str> {
        self.next_page_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }
}

// Typed view over a BigQuery `jobservice.jobcompleted` audit entry. Only the fields the
// filter reads are modelled; everything else is ignored by serde.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub proto_payload: ProtoPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtoPayload {
    pub service_data: ServiceData,
    #[serde(default)]
    pub authentication_info: Option<AuthenticationInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationInfo {
    #[serde(default)]
    pub principal_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceData {
    pub job_completed_event: JobCompletedEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobCompletedEvent {
    pub job: Job,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default)]
    pub job_name: Option<JobName>,
    pub job_status: JobStatus,
    #[serde(default)]
    pub job_statistics: Option<JobStatistics>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobName {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatus {
    pub state: String,
    /// Kept loose: the audit format carries a status object here, older exports a list.
    #[serde(default)]
    pub error: Option<Value>,
}

impl JobStatus {
    pub fn has_error(&self) -> bool {
        match &self.error {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(message)) => !message.is_empty(),
            Some(_) => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    #[serde(default)]
    pub referenced_tables: Option<Vec<TableReference>>,
    #[serde(default, deserialize_with = "deserialize_optional_count")]
    pub total_tables_processed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReference {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

/// Integer statistics arrive either as JSON numbers or as decimal strings (int64 in proto JSON).
fn deserialize_optional_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    })
}
