//! Mod portal REST client
//!
//! Wraps `https://mods.factorio.com/api/mods/{name}/full`. Not-found is an
//! ordinary `Ok(None)`; rate limits and server errors are retried with
//! exponential backoff before giving up.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use super::ModMetadataProvider;

pub const PORTAL_ENDPOINT: &str = "https://mods.factorio.com";
const MAX_RETRIES: u32 = 5;
const BASE_RETRY_DELAY_MS: u64 = 2000;
const MAX_RETRY_DELAY_MS: u64 = 60000;

/// REST client for mod metadata
#[derive(Clone)]
pub struct PortalClient {
    client: Arc<reqwest::Client>,
    base_url: String,
}

impl PortalClient {
    /// Create a client against the public mod portal
    pub fn new() -> Result<Self> {
        Self::with_base_url(PORTAL_ENDPOINT)
    }

    /// Create a client against an alternate endpoint (used by tests)
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Modforge/{}", crate::APP_VERSION))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client: Arc::new(client),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch full metadata (releases, dependencies, category) for one mod.
    pub async fn get_mod_full(&self, name: &str) -> Result<Option<PortalMod>> {
        let url = format!("{}/api/mods/{}/full", self.base_url, name);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("Failed to query mod portal for '{}'", name))?;

            let status = response.status();

            if status == reqwest::StatusCode::NOT_FOUND {
                tracing::debug!("Mod '{}' not found on the portal", name);
                return Ok(None);
            }

            // Handle rate limiting (429)
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt >= MAX_RETRIES {
                    bail!("Rate limited after {} retries", MAX_RETRIES);
                }

                let retry_after = if let Some(retry_header) = response.headers().get("retry-after")
                {
                    retry_header
                        .to_str()
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(|secs| secs * 1000)
                        .unwrap_or(BASE_RETRY_DELAY_MS)
                } else {
                    // Exponential backoff with 85-115% jitter
                    let base_delay = BASE_RETRY_DELAY_MS * (1 << (attempt - 1));
                    let jitter = rand::random::<f64>() * 0.3 + 0.85;
                    ((base_delay as f64 * jitter) as u64).min(MAX_RETRY_DELAY_MS)
                };

                tracing::warn!(
                    "Rate limited (attempt {}/{}), retrying in {}ms",
                    attempt,
                    MAX_RETRIES,
                    retry_after
                );

                sleep(Duration::from_millis(retry_after)).await;
                continue;
            }

            // Handle server errors (5xx) with retry
            if status.is_server_error() {
                if attempt >= MAX_RETRIES {
                    bail!("Server error after {} retries: {}", MAX_RETRIES, status);
                }

                let delay = (BASE_RETRY_DELAY_MS * (1 << (attempt - 1))).min(MAX_RETRY_DELAY_MS);
                tracing::warn!(
                    "Server error {} (attempt {}/{}), retrying in {}ms",
                    status,
                    attempt,
                    MAX_RETRIES,
                    delay
                );

                sleep(Duration::from_millis(delay)).await;
                continue;
            }

            // Client errors (4xx) other than 404 - don't retry
            if status.is_client_error() {
                let error_text = response.text().await.unwrap_or_default();
                bail!("Portal request failed with {}: {}", status, error_text);
            }

            if status.is_success() {
                let portal_mod: PortalMod = response
                    .json()
                    .await
                    .with_context(|| format!("Failed to parse portal response for '{}'", name))?;

                tracing::debug!(
                    "Fetched '{}' with {} releases (attempt {})",
                    portal_mod.name,
                    portal_mod.releases.len(),
                    attempt
                );
                return Ok(Some(portal_mod));
            }

            bail!("Unexpected response status: {}", status);
        }
    }
}

#[async_trait]
impl ModMetadataProvider for PortalClient {
    async fn get_mod(&self, name: &str) -> Result<Option<PortalMod>> {
        self.get_mod_full(name).await
    }
}

/// Full portal record for one mod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalMod {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub changelog: Option<String>,
    #[serde(default)]
    pub releases: Vec<PortalRelease>,
}

impl PortalMod {
    /// The most recently released version, for fresh installs.
    pub fn latest_release(&self) -> Option<&PortalRelease> {
        self.releases.iter().max_by_key(|r| r.released_at)
    }

    /// The release exactly matching `version`, for updates.
    pub fn release_for(&self, version: &str) -> Option<&PortalRelease> {
        self.releases.iter().find(|r| r.version == version)
    }
}

/// One published release of a mod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalRelease {
    pub version: String,
    pub released_at: DateTime<Utc>,
    pub download_url: String,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default, rename = "info_json")]
    pub info: ReleaseInfo,
}

/// Subset of the release's embedded manifest that the resolver consumes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub factorio_version: Option<String>,
}
