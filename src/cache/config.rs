//! Cache configuration.
//!
//! Resolved from the `[cache]` section of `pantry.toml` (see `crate::config`).

use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use super::keys::{GenerationId, KeyError};
use super::manifest::{AssetManifest, DEFAULT_ASSETS};

pub const DEFAULT_GENERATION: &str = "lakshmi-dairy-v1";
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080/";
pub const DEFAULT_INSTALL_CONCURRENCY: usize = 4;
pub const DEFAULT_INSTALL_ATTEMPTS: u32 = 3;
pub const DEFAULT_INSTALL_RETRY_BACKOFF_MS: u64 = 2000;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Where generations are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Filesystem(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Generation installed and activated by this deployment.
    pub generation: GenerationId,
    /// Storefront origin; manifest paths and proxied requests resolve against it.
    pub origin: Url,
    pub manifest: AssetManifest,
    pub store: StoreBackend,
    /// Manifest entries fetched concurrently during install.
    pub install_concurrency: NonZeroUsize,
    /// Install attempts before the host gives up.
    pub install_attempts: NonZeroU32,
    pub install_retry_backoff: Duration,
    /// Per-request timeout of the HTTP network adapter.
    pub fetch_timeout: Duration,
}

impl CacheConfig {
    pub fn new(generation: GenerationId, origin: Url, store: StoreBackend) -> Result<Self, KeyError> {
        let manifest = AssetManifest::from_paths(&origin, DEFAULT_ASSETS.iter().copied())?;
        Ok(Self {
            generation,
            origin,
            manifest,
            store,
            install_concurrency: NonZeroUsize::new(DEFAULT_INSTALL_CONCURRENCY)
                .unwrap_or(NonZeroUsize::MIN),
            install_attempts: NonZeroU32::new(DEFAULT_INSTALL_ATTEMPTS)
                .unwrap_or(NonZeroU32::MIN),
            install_retry_backoff: Duration::from_millis(DEFAULT_INSTALL_RETRY_BACKOFF_MS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        })
    }

    /// Replace the manifest with `paths` resolved against the origin.
    pub fn with_manifest_paths<S: AsRef<str>>(
        mut self,
        paths: impl IntoIterator<Item = S>,
    ) -> Result<Self, KeyError> {
        self.manifest = AssetManifest::from_paths(&self.origin, paths)?;
        Ok(self)
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            generation: settings.generation.clone(),
            origin: settings.origin.clone(),
            manifest: settings.manifest.clone(),
            store: match &settings.store_dir {
                Some(dir) => StoreBackend::Filesystem(dir.clone()),
                None => StoreBackend::Memory,
            },
            install_concurrency: settings.install_concurrency,
            install_attempts: settings.install_attempts,
            install_retry_backoff: settings.install_retry_backoff,
            fetch_timeout: settings.fetch_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_storefront_shell() {
        let config = CacheConfig::new(
            GenerationId::new(DEFAULT_GENERATION).expect("valid generation"),
            Url::parse(DEFAULT_ORIGIN).expect("valid origin"),
            StoreBackend::Memory,
        )
        .expect("valid config");
        assert_eq!(config.manifest.len(), DEFAULT_ASSETS.len());
        assert_eq!(config.install_concurrency.get(), 4);
        assert_eq!(config.install_attempts.get(), 3);
        assert_eq!(config.install_retry_backoff, Duration::from_secs(2));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn manifest_paths_resolve_against_origin() {
        let config = CacheConfig::new(
            GenerationId::new("v2").expect("valid generation"),
            Url::parse("https://dairy.example/shop/").expect("valid origin"),
            StoreBackend::Memory,
        )
        .expect("valid config")
        .with_manifest_paths(["index.html", "/assets/milk.jpg"])
        .expect("valid paths");
        let urls: Vec<&str> = config
            .manifest
            .entries()
            .iter()
            .map(|key| key.url().as_str())
            .collect();
        assert_eq!(
            urls,
            [
                "https://dairy.example/shop/index.html",
                "https://dairy.example/assets/milk.jpg"
            ]
        );
    }
}
