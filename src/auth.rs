//! Credential resolution
//!
//! Turns the configured credential source into a [`TokenProvider`] that hands out OAuth
//! bearer tokens for the logging API. Resolution happens once, before the scan starts,
//! and any failure here is fatal.
//!
//! Supported sources, in the order [`CredentialSource::Default`] tries them:
//! - `GOOGLE_OAUTH_ACCESS_TOKEN`: a ready-made access token
//! - `GOOGLE_APPLICATION_CREDENTIALS`: path to a credential JSON file
//! - the gcloud application-default credential file
//! - the GCE metadata server
//!
//! Credential JSON of type `authorized_user` is exchanged for access tokens with its
//! refresh token. A `service_account` key signs an RS256 JWT assertion with its private
//! key and trades it at the key's token endpoint (the JWT bearer grant).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
const CREDENTIALS_FILE_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Lifetime of a signed assertion; the token endpoint rejects anything over an hour.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    KeyFile(PathBuf),
    Inline(String),
    Default,
}

pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Result<String>;
}

impl CredentialSource {
    pub fn resolve(&self, http: &Client) -> Result<Box<dyn TokenProvider>> {
        match self {
            CredentialSource::KeyFile(path) => provider_from_file(path, http),
            CredentialSource::Inline(json) => {
                provider_from_json(json, http).context("Invalid inline credential JSON")
            }
            CredentialSource::Default => default_provider(http),
        }
    }
}

/// Credential JSON as written by gcloud and the IAM console.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialFile {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        token_uri: Option<String>,
    },
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default)]
        private_key_id: Option<String>,
        #[serde(default)]
        token_uri: Option<String>,
        #[serde(default)]
        project_id: Option<String>,
    },
}

impl CredentialFile {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse credential JSON")
    }
}

fn provider_from_file(path: &Path, http: &Client) -> Result<Box<dyn TokenProvider>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read credential file: {}", path.display()))?;
    provider_from_json(&content, http)
        .with_context(|| format!("Invalid credential file: {}", path.display()))
}

fn provider_from_json(json: &str, http: &Client) -> Result<Box<dyn TokenProvider>> {
    match CredentialFile::parse(json)? {
        CredentialFile::AuthorizedUser {
            client_id,
            client_secret,
            refresh_token,
            token_uri,
        } => Ok(Box::new(AuthorizedUserToken::new(
            http.clone(),
            token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            client_id,
            client_secret,
            refresh_token,
        ))),
        CredentialFile::ServiceAccount {
            client_email,
            private_key,
            private_key_id,
            token_uri,
            ..
        } => {
            info!(client_email = %client_email, "Using service account key");
            Ok(Box::new(ServiceAccountToken::new(
                http.clone(),
                token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                client_email,
                &private_key,
                private_key_id,
            )?))
        }
    }
}

fn default_provider(http: &Client) -> Result<Box<dyn TokenProvider>> {
    if let Ok(token) = env::var(ACCESS_TOKEN_ENV) {
        if !token.trim().is_empty() {
            info!(source = ACCESS_TOKEN_ENV, "Using access token from environment");
            return Ok(Box::new(StaticToken::new(token.trim())));
        }
    }

    if let Ok(path) = env::var(CREDENTIALS_FILE_ENV) {
        info!(source = CREDENTIALS_FILE_ENV, path = %path, "Using credential file");
        return provider_from_file(Path::new(&path), http);
    }

    if let Some(path) = gcloud_default_credentials_path().filter(|path| path.is_file()) {
        info!(path = %path.display(), "Using gcloud application default credentials");
        return provider_from_file(&path, http);
    }

    let host = env::var(METADATA_HOST_ENV).unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
    info!(host = %host, "Using metadata server credentials");
    Ok(Box::new(MetadataServerToken::new(
        http.clone(),
        format!("http://{}{}", host, METADATA_TOKEN_PATH),
    )))
}

fn gcloud_default_credentials_path() -> Option<PathBuf> {
    #[cfg(windows)]
    let base = dirs::config_dir().map(|dir| dir.join("gcloud"));
    #[cfg(not(windows))]
    let base = dirs::home_dir().map(|dir| dir.join(".config").join("gcloud"));

    base.map(|dir| dir.join("application_default_credentials.json"))
}

/// A fixed token, used as-is.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TokenCache {
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    fn get_or_fetch(&self, fetch: impl FnOnce() -> Result<TokenResponse>) -> Result<String> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| anyhow::anyhow!("Token cache lock poisoned"))?;

        if let Some(token) = cached.as_ref() {
            if Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let response = fetch()?;
        let lifetime = response.expires_in.unwrap_or(3600);
        debug!(expires_in = lifetime, "Fetched new access token");
        *cached = Some(CachedToken {
            token: response.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(lifetime),
        });
        Ok(response.access_token)
    }
}

/// Refresh-token credentials of an end user (`gcloud auth application-default login`).
pub struct AuthorizedUserToken {
    http: Client,
    token_uri: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cache: TokenCache,
}

impl AuthorizedUserToken {
    pub fn new(
        http: Client,
        token_uri: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    ) -> Self {
        Self {
            http,
            token_uri,
            client_id,
            client_secret,
            refresh_token,
            cache: TokenCache::default(),
        }
    }

    fn refresh(&self) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_uri)
            .form(&params)
            .send()
            .with_context(|| format!("Failed to reach token endpoint {}", self.token_uri))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Token refresh failed with status {}: {}", status, body);
        }

        response
            .json::<TokenResponse>()
            .context("Failed to parse token response")
    }
}

impl TokenProvider for AuthorizedUserToken {
    fn access_token(&self) -> Result<String> {
        self.cache.get_or_fetch(|| self.refresh())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Service account key: each refresh signs a fresh assertion for the cloud-platform scope.
pub struct ServiceAccountToken {
    http: Client,
    token_uri: String,
    client_email: String,
    key_id: Option<String>,
    signing_key: EncodingKey,
    cache: TokenCache,
}

impl ServiceAccountToken {
    /// Fails if `private_key` is not an RSA key in PEM form.
    pub fn new(
        http: Client,
        token_uri: String,
        client_email: String,
        private_key: &str,
        key_id: Option<String>,
    ) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .with_context(|| format!("Invalid private key for {}", client_email))?;
        Ok(Self {
            http,
            token_uri,
            client_email,
            key_id,
            signing_key,
            cache: TokenCache::default(),
        })
    }

    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .context("Failed to sign token assertion")
    }

    fn exchange(&self) -> Result<TokenResponse> {
        let assertion = self.assertion(Utc::now())?;
        let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let response = self
            .http
            .post(&self.token_uri)
            .form(&params)
            .send()
            .with_context(|| format!("Failed to reach token endpoint {}", self.token_uri))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Token exchange failed with status {}: {}", status, body);
        }

        response
            .json::<TokenResponse>()
            .context("Failed to parse token response")
    }
}

impl TokenProvider for ServiceAccountToken {
    fn access_token(&self) -> Result<String> {
        self.cache.get_or_fetch(|| self.exchange())
    }
}

/// Tokens for the service account attached to the current GCE/GKE/Cloud Run instance.
pub struct MetadataServerToken {
    http: Client,
    url: String,
    cache: TokenCache,
}

impl MetadataServerToken {
    pub fn new(http: Client, url: String) -> Self {
        Self {
            http,
            url,
            cache: TokenCache::default(),
        }
    }

    fn fetch(&self) -> Result<TokenResponse> {
        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .with_context(|| format!("Failed to reach metadata server at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Metadata server returned status {}", status);
        }

        response
            .json::<TokenResponse>()
            .context("Failed to parse metadata server token")
    }
}

impl TokenProvider for MetadataServerToken {
    fn access_token(&self) -> Result<String> {
        self.cache.get_or_fetch(|| self.fetch())
    }
}
