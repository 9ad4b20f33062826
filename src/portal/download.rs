//! Archive downloads with integrity verification
//!
//! Downloads stream into a `.part` file next to the final destination and
//! are renamed only after verification: the body must be a real zip (the
//! portal serves HTML error pages with status 200 when credentials are
//! wrong), the SHA-1 sum must match when the portal publishes one, and the
//! archive must contain an `info.json` manifest entry.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::rest::PORTAL_ENDPOINT;
use crate::mods;

/// Byte-level progress callback: (downloaded, total).
pub type ProgressSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Result of one mod download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Verified archive at its final path.
    Completed(PathBuf),
    /// Cancelled cooperatively; any partial file has been removed.
    Cancelled,
}

/// Download contract consumed by the update orchestrator.
#[async_trait]
pub trait ModDownloader: Send + Sync {
    async fn download_mod(
        &self,
        name: &str,
        title: &str,
        version: &str,
        url: &str,
        expected_sha1: Option<&str>,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome>;
}

/// Downloads mod archives from the portal into the mods directory.
pub struct Downloader {
    client: reqwest::Client,
    mods_dir: PathBuf,
    username: Option<String>,
    token: Option<String>,
}

impl Downloader {
    pub fn new(mods_dir: PathBuf, username: Option<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Modforge/{}", crate::APP_VERSION))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            mods_dir,
            username,
            token,
        })
    }

    /// Resolve a portal-relative download URL and attach credentials.
    fn resolve_url(&self, raw: &str) -> Result<Url> {
        let absolute = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("{}{}", PORTAL_ENDPOINT, raw)
        };
        let mut url = Url::parse(&absolute).with_context(|| format!("Invalid URL: {}", raw))?;
        if let (Some(username), Some(token)) = (&self.username, &self.token) {
            url.query_pairs_mut()
                .append_pair("username", username)
                .append_pair("token", token);
        }
        Ok(url)
    }

    /// Stream a URL to `dest`, hashing as bytes arrive.
    ///
    /// Returns `Ok(None)` when cancelled (partial file removed) and the
    /// hex SHA-1 of the body otherwise.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let url = self.resolve_url(url)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download")?;

        if !response.status().is_success() {
            bail!("Download failed with status: {}", response.status());
        }

        let total_size = response.content_length().unwrap_or(0);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create download directory")?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .context("Failed to create download file")?;

        let mut hasher = Sha1::new();
        let mut downloaded: u64 = 0;
        let mut first_bytes: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    if let Err(e) = tokio::fs::remove_file(dest).await {
                        tracing::warn!("Could not remove partial download {:?}: {}", dest, e);
                    }
                    tracing::info!("Download cancelled: {:?}", dest);
                    return Ok(None);
                }
                chunk = stream.next() => match chunk {
                    Some(chunk) => chunk.context("Error reading download stream")?,
                    None => break,
                },
            };

            if first_bytes.len() < 4 {
                first_bytes.extend(chunk.iter().take(4 - first_bytes.len()));
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .context("Error writing to file")?;
            downloaded += chunk.len() as u64;
            if let Some(sink) = &progress {
                sink(downloaded, total_size);
            }
        }

        file.flush().await?;

        // The portal answers bad credentials with an HTML page, not a zip.
        if !first_bytes.starts_with(b"PK") {
            let _ = tokio::fs::remove_file(dest).await;
            bail!("Response body is not a zip archive (HTML error page?)");
        }

        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(Some(hex))
    }
}

#[async_trait]
impl ModDownloader for Downloader {
    async fn download_mod(
        &self,
        name: &str,
        title: &str,
        version: &str,
        url: &str,
        expected_sha1: Option<&str>,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let dest = self.mods_dir.join(format!("{}_{}.zip", name, version));
        let part = dest.with_extension("zip.part");

        tracing::info!("Downloading {} {} to {:?}", title, version, dest);

        let Some(actual_sha1) = self.download_file(url, &part, progress, cancel).await? else {
            return Ok(DownloadOutcome::Cancelled);
        };

        if let Some(expected) = expected_sha1 {
            if !expected.eq_ignore_ascii_case(&actual_sha1) {
                let _ = tokio::fs::remove_file(&part).await;
                bail!(
                    "Checksum mismatch for {} {}: expected {}, got {}",
                    name,
                    version,
                    expected,
                    actual_sha1
                );
            }
        }

        // Reject archives without a manifest before they enter the mods dir
        let check_path = part.clone();
        let manifest = tokio::task::spawn_blocking(move || {
            mods::read_manifest_from_zip(&check_path)
        })
        .await
        .context("Archive validation task panicked")?;
        if let Err(e) = manifest {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.context(format!("Downloaded archive for {} is invalid", name)));
        }

        tokio::fs::rename(&part, &dest)
            .await
            .context("Failed to move verified archive into place")?;

        tracing::info!("Downloaded {} {} successfully", title, version);
        Ok(DownloadOutcome::Completed(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url_joins_portal_and_credentials() {
        let downloader = Downloader::new(
            PathBuf::from("/tmp/mods"),
            Some("player".to_string()),
            Some("secret".to_string()),
        )
        .unwrap();

        let url = downloader.resolve_url("/download/flib/abcd").unwrap();
        assert_eq!(url.host_str(), Some("mods.factorio.com"));
        assert_eq!(url.path(), "/download/flib/abcd");
        let query: Vec<_> = url.query_pairs().collect();
        assert!(query.iter().any(|(k, v)| k == "username" && v == "player"));
        assert!(query.iter().any(|(k, v)| k == "token" && v == "secret"));
    }

    #[test]
    fn test_resolve_url_keeps_absolute_urls() {
        let downloader = Downloader::new(PathBuf::from("/tmp/mods"), None, None).unwrap();
        let url = downloader
            .resolve_url("https://mirror.example.com/archive.zip")
            .unwrap();
        assert_eq!(url.host_str(), Some("mirror.example.com"));
        assert!(url.query().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_download_removes_partial_file() {
        use tokio::net::TcpListener;

        // Serves response headers and a partial body, then leaves the
        // connection open so the stream never completes on its own.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = "HTTP/1.1 200 OK\r\ncontent-length: 1000000\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(b"PK\x03\x04 partial body").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("mod_1.0.zip.part");
        let downloader = Downloader::new(dir.path().to_path_buf(), None, None).unwrap();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let url = format!("http://{}/download/mod/1.0", addr);
        let result = downloader
            .download_file(&url, &dest, None, &cancel)
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(!dest.exists());
        server.abort();
    }
}
