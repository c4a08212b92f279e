//! Cache lifecycle controller.
//!
//! Drives one asset cache through install, fetch and activate:
//!
//! ```text
//! UNINSTALLED -> INSTALLING -> INSTALLED -> ACTIVATING -> ACTIVE
//! ```
//!
//! State is tracked per generation. A new generation is installed next to
//! the active one and only replaces it when activated, at which point every
//! other generation is pruned from the store.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::config::DEFAULT_INSTALL_CONCURRENCY;
use super::keys::{GenerationId, RequestKey};
use super::lock::{rw_read, rw_write};
use super::manifest::AssetManifest;
use super::network::{FetchRequest, Network, NetworkError};
use super::store::{AssetStore, ResponseSnapshot, StoreError};

const SOURCE: &str = "cache::lifecycle";

pub const METRIC_FETCH_HIT: &str = "pantry_fetch_hit_total";
pub const METRIC_FETCH_MISS: &str = "pantry_fetch_miss_total";
pub const METRIC_INSTALL_MS: &str = "pantry_install_ms";
pub const METRIC_INSTALL_FAILED: &str = "pantry_install_failed_total";
pub const METRIC_ACTIVATE_DELETED: &str = "pantry_activate_deleted_total";
pub const METRIC_ACTIVATE_DELETE_FAILED: &str = "pantry_activate_delete_failed_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninstalled,
    Installing,
    /// Installed and waiting for activation.
    Installed,
    Activating,
    Active,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("manifest entry `{request}` could not be fetched: {source}")]
    ManifestFetch {
        request: String,
        #[source]
        source: NetworkError,
    },
    #[error("manifest entry `{request}` answered with status {status}")]
    ManifestStatus { request: String, status: u16 },
    #[error("failed to persist generation `{generation}`: {source}")]
    Store {
        generation: GenerationId,
        #[source]
        source: StoreError,
    },
}

impl InstallError {
    /// True when a manifest entry, rather than the store, failed.
    pub fn is_manifest_failure(&self) -> bool {
        matches!(
            self,
            Self::ManifestFetch { .. } | Self::ManifestStatus { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("generation `{0}` is not installed")]
    NotInstalled(GenerationId),
    #[error("failed to enumerate cache generations: {0}")]
    Store(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub generation: GenerationId,
    pub entries: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct ActivateReport {
    pub generation: GenerationId,
    pub deleted: Vec<GenerationId>,
    /// Generations whose deletion failed; they may still be in the store.
    pub failed: Vec<(GenerationId, StoreError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct Served {
    pub response: ResponseSnapshot,
    pub source: ServedFrom,
}

#[derive(Default)]
struct ControllerState {
    active: Option<GenerationId>,
    phases: BTreeMap<GenerationId, LifecycleState>,
}

/// Install/fetch/activate state machine over an injected store and network.
pub struct CacheController {
    store: Arc<dyn AssetStore>,
    network: Arc<dyn Network>,
    install_concurrency: NonZeroUsize,
    state: RwLock<ControllerState>,
}

impl CacheController {
    pub fn new(store: Arc<dyn AssetStore>, network: Arc<dyn Network>) -> Self {
        Self {
            store,
            network,
            install_concurrency: NonZeroUsize::new(DEFAULT_INSTALL_CONCURRENCY)
                .unwrap_or(NonZeroUsize::MIN),
            state: RwLock::new(ControllerState::default()),
        }
    }

    /// Maximum manifest entries fetched at once during install.
    pub fn with_install_concurrency(mut self, limit: NonZeroUsize) -> Self {
        self.install_concurrency = limit;
        self
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.store
    }

    pub fn active_generation(&self) -> Option<GenerationId> {
        rw_read(&self.state, SOURCE, "active_generation")
            .active
            .clone()
    }

    pub fn state(&self, generation: &GenerationId) -> LifecycleState {
        rw_read(&self.state, SOURCE, "state")
            .phases
            .get(generation)
            .copied()
            .unwrap_or(LifecycleState::Uninstalled)
    }

    /// Every generation this controller has seen, with its current state.
    pub fn states(&self) -> Vec<(GenerationId, LifecycleState)> {
        rw_read(&self.state, SOURCE, "states")
            .phases
            .iter()
            .map(|(generation, phase)| (generation.clone(), *phase))
            .collect()
    }

    /// Fetch every manifest entry and store them under `generation`.
    ///
    /// All-or-nothing: nothing is written unless every entry fetched with a
    /// 2xx status. On failure the generation stays `Installing`.
    #[instrument(skip_all, fields(generation = %generation, entries = manifest.len()))]
    pub async fn on_install(
        &self,
        manifest: &AssetManifest,
        generation: &GenerationId,
    ) -> Result<InstallReport, InstallError> {
        let started_at = Instant::now();
        self.transition_unless_active(generation, LifecycleState::Installing);

        let result = self.populate(manifest, generation).await;
        let elapsed = started_at.elapsed();

        let outcome = match &result {
            Ok(entries) => {
                self.transition_unless_active(generation, LifecycleState::Installed);
                info!(entries, elapsed_ms = elapsed.as_millis() as u64, "Generation installed");
                "ok"
            }
            Err(err) => {
                counter!(METRIC_INSTALL_FAILED).increment(1);
                warn!(error = %err, "Generation install failed");
                "failed"
            }
        };
        histogram!(METRIC_INSTALL_MS, "outcome" => outcome)
            .record(elapsed.as_secs_f64() * 1000.0);

        result.map(|entries| InstallReport {
            generation: generation.clone(),
            entries,
            elapsed,
        })
    }

    async fn populate(
        &self,
        manifest: &AssetManifest,
        generation: &GenerationId,
    ) -> Result<usize, InstallError> {
        let network = Arc::clone(&self.network);
        let snapshots: Vec<(RequestKey, ResponseSnapshot)> =
            stream::iter(manifest.entries().iter().cloned())
                .map(|key| {
                    let network = Arc::clone(&network);
                    async move {
                        let request = FetchRequest::from(&key);
                        let response = network.fetch(&request).await.map_err(|source| {
                            InstallError::ManifestFetch {
                                request: key.to_string(),
                                source,
                            }
                        })?;
                        if !response.is_success() {
                            return Err(InstallError::ManifestStatus {
                                request: key.to_string(),
                                status: response.status,
                            });
                        }
                        Ok((key, response))
                    }
                })
                .buffered(self.install_concurrency.get())
                .try_collect()
                .await?;

        let store_error = |source| InstallError::Store {
            generation: generation.clone(),
            source,
        };

        let existed = self
            .store
            .entry_count(generation)
            .await
            .map_err(store_error)?
            .is_some();
        self.store
            .open_or_create(generation)
            .await
            .map_err(store_error)?;

        let entries = snapshots.len();
        if let Err(source) = self.store.insert_all(generation, snapshots).await {
            if !existed {
                self.discard_partial(generation).await;
            }
            return Err(store_error(source));
        }

        Ok(entries)
    }

    async fn discard_partial(&self, generation: &GenerationId) {
        if let Err(err) = self.store.delete(generation).await {
            warn!(
                generation = %generation,
                error = %err,
                "Failed to discard partially created generation"
            );
        }
    }

    /// Serve `request` from the promoted generation, falling back to the
    /// network on a miss. Misses are never written back to the store.
    pub async fn on_fetch(&self, request: impl Into<FetchRequest>) -> Result<Served, NetworkError> {
        self.fetch_cache_first(&request.into()).await
    }

    #[instrument(skip_all, fields(request = %request))]
    async fn fetch_cache_first(&self, request: &FetchRequest) -> Result<Served, NetworkError> {
        if request.key().is_cacheable()
            && let Some(generation) = self.active_generation()
        {
            match self.store.lookup(&generation, request.key()).await {
                Ok(Some(response)) => {
                    counter!(METRIC_FETCH_HIT).increment(1);
                    debug!(generation = %generation, outcome = "hit", "serving cached asset");
                    return Ok(Served {
                        response,
                        source: ServedFrom::Cache,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        generation = %generation,
                        error = %err,
                        "Cache lookup failed, falling back to network"
                    );
                }
            }
        }

        counter!(METRIC_FETCH_MISS).increment(1);
        debug!(outcome = "miss", "fetching from network");
        let response = self.network.fetch(request).await?;
        Ok(Served {
            response,
            source: ServedFrom::Network,
        })
    }

    /// Promote `generation`, then delete every other stored generation.
    ///
    /// Fetches read the new generation as soon as it is confirmed in the
    /// store; it turns `Active` once pruning has finished. Deletions run
    /// concurrently and independently, and a failed deletion is reported
    /// without stopping the others.
    #[instrument(skip_all, fields(generation = %generation))]
    pub async fn on_activate(
        &self,
        generation: &GenerationId,
    ) -> Result<ActivateReport, ActivateError> {
        let stored = self
            .store
            .list_generations()
            .await
            .map_err(ActivateError::Store)?;
        if !stored.contains(generation) {
            return Err(ActivateError::NotInstalled(generation.clone()));
        }

        // Fetches switch to the new generation before anything is pruned.
        self.promote(generation, LifecycleState::Activating);

        let store = &self.store;
        let outcomes = join_all(
            stored
                .into_iter()
                .filter(|candidate| candidate != generation)
                .map(|stale| async move {
                    let result = store.delete(&stale).await;
                    (stale, result)
                }),
        )
        .await;

        let mut report = ActivateReport {
            generation: generation.clone(),
            deleted: Vec::new(),
            failed: Vec::new(),
        };

        {
            let mut state = rw_write(&self.state, SOURCE, "on_activate");
            for (stale, result) in outcomes {
                match result {
                    Ok(_) => {
                        counter!(METRIC_ACTIVATE_DELETED).increment(1);
                        state.phases.remove(&stale);
                        report.deleted.push(stale);
                    }
                    Err(err) => {
                        counter!(METRIC_ACTIVATE_DELETE_FAILED).increment(1);
                        warn!(stale = %stale, error = %err, "Failed to delete stale generation");
                        if let Some(phase) = state.phases.get_mut(&stale) {
                            *phase = LifecycleState::Installed;
                        }
                        report.failed.push((stale, err));
                    }
                }
            }
            if state.active.as_ref() == Some(generation) {
                state
                    .phases
                    .insert(generation.clone(), LifecycleState::Active);
            }
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Generation activated"
        );
        Ok(report)
    }

    /// Promote a generation that is already in the store without
    /// reinstalling it. Returns `false` when the store does not have it.
    pub async fn restore(&self, generation: &GenerationId) -> Result<bool, StoreError> {
        if self.store.entry_count(generation).await?.is_none() {
            return Ok(false);
        }

        self.promote(generation, LifecycleState::Active);
        info!(generation = %generation, "Restored active generation from store");
        Ok(true)
    }

    /// Point fetches at `generation`; the previously active one drops back
    /// to `Installed`.
    fn promote(&self, generation: &GenerationId, phase: LifecycleState) {
        let mut state = rw_write(&self.state, SOURCE, "promote");
        if let Some(previous) = state.active.replace(generation.clone())
            && previous != *generation
        {
            state.phases.insert(previous, LifecycleState::Installed);
        }
        state.phases.insert(generation.clone(), phase);
    }

    /// Reinstalling the active generation must not demote it.
    fn transition_unless_active(&self, generation: &GenerationId, phase: LifecycleState) {
        let mut state = rw_write(&self.state, SOURCE, "transition_unless_active");
        if state.active.as_ref() == Some(generation) {
            return;
        }
        state.phases.insert(generation.clone(), phase);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::cache::store::MemoryStore;

    struct StaticNetwork {
        calls: AtomicUsize,
        status: u16,
    }

    #[async_trait]
    impl Network for StaticNetwork {
        async fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResponseSnapshot::new(
                self.status,
                Vec::new(),
                request.url().path().to_string(),
            ))
        }
    }

    fn controller(status: u16) -> (CacheController, Arc<StaticNetwork>) {
        let network = Arc::new(StaticNetwork {
            calls: AtomicUsize::new(0),
            status,
        });
        let controller = CacheController::new(Arc::new(MemoryStore::new()), network.clone());
        (controller, network)
    }

    fn manifest() -> AssetManifest {
        let origin = Url::parse("https://shop.example/").expect("valid origin");
        AssetManifest::from_paths(&origin, ["/", "/styles.css"]).expect("valid manifest")
    }

    fn generation(name: &str) -> GenerationId {
        GenerationId::new(name).expect("valid generation")
    }

    #[tokio::test]
    async fn install_moves_generation_to_installed() {
        let (controller, network) = controller(200);
        let v1 = generation("v1");
        assert_eq!(controller.state(&v1), LifecycleState::Uninstalled);

        let report = controller
            .on_install(&manifest(), &v1)
            .await
            .expect("install");
        assert_eq!(report.entries, 2);
        assert_eq!(controller.state(&v1), LifecycleState::Installed);
        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
        assert!(controller.active_generation().is_none());
    }

    #[tokio::test]
    async fn non_success_status_fails_install() {
        let (controller, _) = controller(404);
        let v1 = generation("v1");

        let err = controller
            .on_install(&manifest(), &v1)
            .await
            .expect_err("404 must fail install");
        assert!(err.is_manifest_failure());
        assert!(matches!(
            err,
            InstallError::ManifestStatus { status: 404, .. }
        ));
        assert_eq!(controller.state(&v1), LifecycleState::Installing);
        assert!(
            controller
                .store()
                .list_generations()
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn activate_requires_installed_generation() {
        let (controller, _) = controller(200);
        let err = controller
            .on_activate(&generation("ghost"))
            .await
            .expect_err("not installed");
        assert!(matches!(err, ActivateError::NotInstalled(_)));
        assert!(controller.active_generation().is_none());
    }

    #[tokio::test]
    async fn reinstalling_active_generation_keeps_it_active() {
        let (controller, _) = controller(200);
        let v1 = generation("v1");
        controller.on_install(&manifest(), &v1).await.expect("install");
        controller.on_activate(&v1).await.expect("activate");

        controller
            .on_install(&manifest(), &v1)
            .await
            .expect("reinstall");
        assert_eq!(controller.state(&v1), LifecycleState::Active);
        assert_eq!(controller.active_generation(), Some(v1));
    }

    #[tokio::test]
    async fn non_get_requests_bypass_cache() {
        let (controller, network) = controller(200);
        let v1 = generation("v1");
        controller.on_install(&manifest(), &v1).await.expect("install");
        controller.on_activate(&v1).await.expect("activate");
        let before = network.calls.load(Ordering::SeqCst);

        let origin = Url::parse("https://shop.example/").expect("valid origin");
        let head = RequestKey::resolve(axum::http::Method::HEAD, &origin, "/styles.css")
            .expect("valid key");
        let served = controller.on_fetch(&head).await.expect("fetch");
        assert_eq!(served.source, ServedFrom::Network);
        assert_eq!(network.calls.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn restore_promotes_stored_generation() {
        let (controller, _) = controller(200);
        let v1 = generation("v1");
        assert!(!controller.restore(&v1).await.expect("restore"));

        controller.on_install(&manifest(), &v1).await.expect("install");
        assert!(controller.restore(&v1).await.expect("restore"));
        assert_eq!(controller.active_generation(), Some(v1.clone()));
        assert_eq!(controller.state(&v1), LifecycleState::Active);
    }
}
