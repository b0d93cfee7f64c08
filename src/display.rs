//! Terminal output for extracted usage.
//!
//! [`TableSink`] collects pairs as they are drained from the extractor and, on
//! [`UsageSink::finish`], prints a colored report grouped by table: tables ordered by total
//! accesses, users under each table ordered by their own count, with a share of the
//! table's accesses per user.

use crate::extractor::ExtractionStats;
use crate::models::UsageKey;
use crate::sink::UsageSink;
use anyhow::{Context, Result};
use colored::Colorize;
use std::collections::HashMap;
use std::io::Write;

struct TableGroup {
    name: String,
    total: u64,
    users: Vec<(String, u64)>,
}

pub struct TableSink<W: Write> {
    writer: W,
    rows: Vec<(UsageKey, u64)>,
}

impl<W: Write> TableSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            rows: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn grouped(&self) -> Vec<TableGroup> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<TableGroup> = Vec::new();

        for (key, count) in &self.rows {
            let name = format!("{}.{}.{}", key.cluster, key.schema, key.table);
            let index = *positions.entry(name.clone()).or_insert_with(|| {
                groups.push(TableGroup {
                    name,
                    total: 0,
                    users: Vec::new(),
                });
                groups.len() - 1
            });
            let group = &mut groups[index];
            group.total += count;
            group.users.push((key.email.clone(), *count));
        }

        for group in &mut groups {
            group.users.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        }
        groups.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
        groups
    }
}

impl<W: Write> UsageSink for TableSink<W> {
    fn accept(&mut self, key: &UsageKey, count: u64) -> Result<()> {
        self.rows.push((key.clone(), count));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let groups = self.grouped();
        let total: u64 = groups.iter().map(|group| group.total).sum();
        let out = &mut self.writer;

        writeln!(out, "\n{}", "=".repeat(80).bright_cyan())?;
        writeln!(out, "{}", "BigQuery Table Usage".bright_white().bold())?;
        writeln!(out, "{}", "=".repeat(80).bright_cyan())?;
        writeln!(
            out,
            "\n{} tables • {} user/table pairs • {} accesses\n",
            groups.len().to_string().bright_white().bold(),
            self.rows.len().to_string().bright_white().bold(),
            total.to_string().bright_green().bold()
        )?;

        for group in &groups {
            writeln!(
                out,
                "{}: {}",
                group.name.bright_white().bold(),
                group.total.to_string().bright_green().bold()
            )?;
            for (email, count) in &group.users {
                let percentage = *count as f64 / group.total.max(1) as f64 * 100.0;
                writeln!(
                    out,
                    "   {}: {} ({}%)",
                    email.bright_cyan(),
                    count.to_string().bright_green(),
                    format!("{:.0}", percentage).bright_yellow()
                )?;
            }
            writeln!(out)?;
        }

        out.flush().context("Failed to flush usage table")
    }
}

/// One-line run summary for interactive use.
pub fn write_summary<W: Write>(out: &mut W, stats: &ExtractionStats) -> Result<()> {
    writeln!(
        out,
        "{} pages • {} entries scanned • {} counted • {} skipped",
        stats.pages_fetched.to_string().bright_white(),
        stats.entries_seen.to_string().bright_white(),
        stats.entries_counted.to_string().bright_green(),
        stats.total_skipped().to_string().bright_yellow()
    )?;
    if stats.table_count_mismatches > 0 {
        writeln!(
            out,
            "{} jobs reported a table count different from their referenced tables",
            stats.table_count_mismatches.to_string().bright_yellow()
        )?;
    }
    Ok(())
}
