//! Pantry cache system
//!
//! Keeps one versioned generation of storefront assets available for
//! offline, cache-first serving:
//!
//! - **Install**: fetch the asset manifest into a new generation
//! - **Fetch**: serve from the promoted generation, fall back to the network
//! - **Activate**: promote a generation and prune every other one
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! generation = "lakshmi-dairy-v2"
//! origin = "https://shop.example/"
//! store_dir = "/var/lib/pantry"
//! # ... see crate::config for all options
//! ```

mod config;
mod keys;
mod lifecycle;
pub(crate) mod lock;
mod manifest;
mod network;
mod store;

pub use config::{
    CacheConfig, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_GENERATION, DEFAULT_INSTALL_ATTEMPTS,
    DEFAULT_INSTALL_CONCURRENCY, DEFAULT_INSTALL_RETRY_BACKOFF_MS, DEFAULT_ORIGIN, StoreBackend,
};
pub use keys::{GenerationId, KeyError, RequestKey};
pub use lifecycle::{
    ActivateError, ActivateReport, CacheController, InstallError, InstallReport, LifecycleState,
    METRIC_ACTIVATE_DELETE_FAILED, METRIC_ACTIVATE_DELETED, METRIC_FETCH_HIT, METRIC_FETCH_MISS,
    METRIC_INSTALL_FAILED, METRIC_INSTALL_MS, Served, ServedFrom,
};
pub use manifest::{AssetManifest, DEFAULT_ASSETS};
pub use network::{FetchRequest, Network, NetworkError};
pub use store::{AssetStore, MemoryStore, ResponseSnapshot, StoreError};
