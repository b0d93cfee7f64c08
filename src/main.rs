use anyhow::{Context, Result};
use bq_table_usage::config::Config;
use bq_table_usage::display::{write_summary, TableSink};
use bq_table_usage::logging;
use bq_table_usage::logging_api::{self, CloudLoggingClient};
use bq_table_usage::sink::JsonLinesSink;
use bq_table_usage::TableUsageExtractor;
use clap::Parser;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use tracing::info;

#[derive(Parser)]
#[command(name = "bq-table-usage")]
#[command(about = "Count BigQuery table accesses per user from Cloud Logging audit entries")]
#[command(version)]
struct Cli {
    /// Project whose audit logs are scanned
    #[arg(long)]
    project_id: Option<String>,
    /// Scan start, inclusive (RFC 3339 or YYYY-MM-DD); defaults to yesterday 00:00 UTC
    #[arg(long)]
    timestamp: Option<String>,
    /// Entries requested per page
    #[arg(long)]
    page_size: Option<u32>,
    /// Only count users whose email matches this regex (anchored at the start)
    #[arg(long)]
    email_pattern: Option<String>,
    /// Path to a credential JSON file
    #[arg(long, conflicts_with = "cred_json")]
    key_path: Option<PathBuf>,
    /// Credential JSON passed inline
    #[arg(long)]
    cred_json: Option<String>,
    /// Output one JSON object per line
    #[arg(long)]
    json: bool,
    /// Print a scan summary to stderr when done
    #[arg(long)]
    summary: bool,
    /// Configuration file (defaults to bq-table-usage.toml lookup)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Command-line flags take precedence over file and environment settings
    fn apply_to(&self, config: &mut Config) {
        if let Some(project_id) = &self.project_id {
            config.extractor.project_id = Some(project_id.clone());
        }
        if let Some(timestamp) = &self.timestamp {
            config.extractor.timestamp = Some(timestamp.clone());
        }
        if let Some(page_size) = self.page_size {
            config.extractor.page_size = page_size;
        }
        if let Some(pattern) = &self.email_pattern {
            config.extractor.email_pattern = Some(pattern.clone());
        }
        if let Some(key_path) = &self.key_path {
            config.credentials.key_path = Some(key_path.clone());
            config.credentials.cred_json = None;
        }
        if let Some(cred_json) = &self.cred_json {
            config.credentials.cred_json = Some(cred_json.clone());
            config.credentials.key_path = None;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli) {
        handle_error(e, json);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_to(&mut config);
    config.validate()?;

    if config.logging.output != "console" {
        fs::create_dir_all(&config.logging.directory)
            .context("Failed to create log directory")?;
    }
    let _guard = logging::init_logging(&config.logging);
    config.log_summary();

    let options = config.to_extractor_options()?;
    let span = logging::run_span(&options.project_id);
    let _entered = span.enter();

    let http = logging_api::http_client()?;
    let tokens = config
        .credential_source()
        .resolve(&http)
        .context("Failed to resolve credentials")?;
    let client = CloudLoggingClient::with_http(http, &config.api.endpoint, tokens);

    let mut extractor = TableUsageExtractor::new(&client, options)?;

    let stdout = io::stdout();
    let delivered = if cli.json {
        extractor.drain_into(&mut JsonLinesSink::new(stdout.lock()))?
    } else {
        extractor.drain_into(&mut TableSink::new(stdout.lock()))?
    };

    if cli.summary {
        write_summary(&mut io::stderr(), extractor.stats())?;
    }
    info!(delivered, "Extraction complete");

    Ok(())
}

fn handle_error(e: anyhow::Error, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
    } else {
        eprintln!("Error: {:#}", e);
    }
    process::exit(1);
}
