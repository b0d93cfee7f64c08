//! Record Filter and Key Extraction
//!
//! Decides whether a raw audit entry counts as table usage and, if so, which
//! [`UsageKey`]s it contributes. Checks run in a fixed order and the first failing check
//! decides the [`SkipReason`]:
//!
//! 1. the entry has the job-completion structure we read (`Malformed` otherwise)
//! 2. the job state is `DONE` (`NotDone`)
//! 3. the job status carries no error (`Failed`)
//! 4. the job lists referenced tables (`CacheHit`: cached results reference nothing)
//! 5. the entry names the principal that ran the job (`Malformed`)
//! 6. the principal matches the identity filter, if one is set (`IdentityFiltered`)
//!
//! Skips are expected noise in an audit stream, so nothing here logs. A disagreement
//! between the referenced-table list and the job's own `totalTablesProcessed` is reported
//! back as a flag and the tables are still counted.

use crate::models::{AuditLogEntry, RawLogEntry, UsageKey};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

pub const DONE_STATE: &str = "DONE";

/// Why an entry contributed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Malformed,
    NotDone,
    Failed,
    CacheHit,
    IdentityFiltered,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Malformed => "malformed",
            SkipReason::NotDone => "not_done",
            SkipReason::Failed => "failed",
            SkipReason::CacheHit => "cache_hit",
            SkipReason::IdentityFiltered => "identity_filtered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Usage {
        keys: Vec<UsageKey>,
        /// Set when the referenced-table count disagrees with `totalTablesProcessed`.
        mismatch: Option<TableCountMismatch>,
    },
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCountMismatch {
    pub job_id: Option<String>,
    pub referenced: usize,
    pub processed: u64,
}

/// Acting-identity pattern, matched from the start of the string.
#[derive(Debug, Clone)]
pub struct IdentityFilter {
    pattern: String,
    regex: Regex,
}

impl IdentityFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})", pattern))
            .with_context(|| format!("Invalid email pattern: {}", pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, identity: &str) -> bool {
        self.regex.is_match(identity)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl PartialEq for IdentityFilter {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

pub fn classify(entry: &RawLogEntry, identity_filter: Option<&IdentityFilter>) -> EntryOutcome {
    let Ok(audit) = AuditLogEntry::deserialize(entry) else {
        return EntryOutcome::Skip(SkipReason::Malformed);
    };
    let payload = audit.proto_payload;
    let job = payload.service_data.job_completed_event.job;

    if job.job_status.state != DONE_STATE {
        return EntryOutcome::Skip(SkipReason::NotDone);
    }
    if job.job_status.has_error() {
        return EntryOutcome::Skip(SkipReason::Failed);
    }

    let Some(statistics) = job.job_statistics else {
        return EntryOutcome::Skip(SkipReason::CacheHit);
    };
    let tables = match statistics.referenced_tables {
        Some(tables) if !tables.is_empty() => tables,
        _ => return EntryOutcome::Skip(SkipReason::CacheHit),
    };

    let Some(email) = payload
        .authentication_info
        .and_then(|info| info.principal_email)
    else {
        return EntryOutcome::Skip(SkipReason::Malformed);
    };

    if let Some(filter) = identity_filter {
        if !filter.matches(&email) {
            return EntryOutcome::Skip(SkipReason::IdentityFiltered);
        }
    }

    let mismatch = statistics
        .total_tables_processed
        .filter(|processed| *processed != tables.len() as u64)
        .map(|processed| TableCountMismatch {
            job_id: job.job_name.and_then(|name| name.job_id),
            referenced: tables.len(),
            processed,
        });

    let keys = tables
        .iter()
        .map(|table| UsageKey::table_level(table, &email))
        .collect();

    EntryOutcome::Usage { keys, mismatch }
}
