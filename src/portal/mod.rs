//! Mod portal integration - metadata API and archive downloads

pub mod download;
pub mod rest;

pub use download::{DownloadOutcome, Downloader, ModDownloader, ProgressSink};
pub use rest::{PortalClient, PortalMod, PortalRelease, ReleaseInfo};

use anyhow::Result;
use async_trait::async_trait;

/// Metadata lookup contract consumed by the dependency resolver.
///
/// `Ok(None)` means the portal does not know the mod; only transport
/// failures are errors.
#[async_trait]
pub trait ModMetadataProvider: Send + Sync {
    async fn get_mod(&self, name: &str) -> Result<Option<PortalMod>>;
}
