//! Downstream consumers of (key, count) pairs.
//!
//! The extractor pushes pairs into a [`UsageSink`] one at a time and calls
//! [`UsageSink::finish`] once the tally is drained.

use crate::models::UsageKey;
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

pub trait UsageSink {
    fn accept(&mut self, key: &UsageKey, count: u64) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl UsageSink for Vec<(UsageKey, u64)> {
    fn accept(&mut self, key: &UsageKey, count: u64) -> Result<()> {
        self.push((key.clone(), count));
        Ok(())
    }
}

/// Flat record written per pair: the key fields plus the count.
#[derive(Debug, Serialize)]
struct UsageRecord<'a> {
    #[serde(flatten)]
    key: &'a UsageKey,
    count: u64,
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> UsageSink for JsonLinesSink<W> {
    fn accept(&mut self, key: &UsageKey, count: u64) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &UsageRecord { key, count })
            .context("Failed to serialize usage record")?;
        self.writer
            .write_all(b"\n")
            .context("Failed to write usage record")?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush usage output")
    }
}
