//! Cloud Logging REST adapter
//!
//! Blocking implementation of [`LogQueryClient`] for the `v2/entries:list` method.

use crate::auth::TokenProvider;
use crate::log_source::LogQueryClient;
use crate::models::{ListEntriesRequest, ListEntriesResponse};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_LOGGING_ENDPOINT: &str = "https://logging.googleapis.com";
const ENTRIES_LIST_PATH: &str = "/v2/entries:list";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct CloudLoggingClient {
    http: Client,
    url: String,
    tokens: Box<dyn TokenProvider>,
}

/// HTTP client shared by the log queries and the token endpoints.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

impl CloudLoggingClient {
    pub fn new(endpoint: &str, tokens: Box<dyn TokenProvider>) -> Result<Self> {
        Ok(Self::with_http(http_client()?, endpoint, tokens))
    }

    pub fn with_http(http: Client, endpoint: &str, tokens: Box<dyn TokenProvider>) -> Self {
        Self {
            http,
            url: format!("{}{}", endpoint.trim_end_matches('/'), ENTRIES_LIST_PATH),
            tokens,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl LogQueryClient for CloudLoggingClient {
    fn list_entries(&self, request: &ListEntriesRequest) -> Result<ListEntriesResponse> {
        let token = self.tokens.access_token()?;
        debug!(
            url = %self.url,
            page_token = request.page_token.as_deref().unwrap_or(""),
            "Listing log entries"
        );

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(token)
            .json(request)
            .send()
            .with_context(|| format!("Failed to send request to {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Logging API returned status {}: {}", status, body.trim());
        }

        response
            .json::<ListEntriesResponse>()
            .context("Failed to decode entries:list response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    #[test]
    fn test_new_builds_entries_list_url() {
        let client =
            CloudLoggingClient::new("https://logging.example.com/", Box::new(StaticToken::new("t")))
                .unwrap();
        assert_eq!(client.url(), "https://logging.example.com/v2/entries:list");
    }

    #[test]
    fn test_shared_http_client_builds() {
        assert!(http_client().is_ok());
    }
}
