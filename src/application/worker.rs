//! Worker host: dispatches lifecycle events to the cache controller.
//!
//! Every event runs as its own task. The returned [`PendingEvent`] is the
//! hold on that event: the host awaits it to learn the outcome, and the
//! task keeps running to completion even if nobody awaits it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{
    ActivateError, ActivateReport, AssetManifest, CacheConfig, CacheController, GenerationId,
    FetchRequest, InstallError, InstallReport, NetworkError, Served, StoreError,
};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Activate(#[from] ActivateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{event} event did not settle: {detail}")]
    Aborted { event: &'static str, detail: String },
}

/// Hold on a dispatched lifecycle event.
pub struct PendingEvent<T> {
    event: &'static str,
    handle: JoinHandle<T>,
}

impl<T> PendingEvent<T> {
    fn spawn<F>(event: &'static str, work: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self {
            event,
            handle: tokio::spawn(work),
        }
    }

    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Wait until the event's work has settled.
    pub async fn settled(self) -> Result<T, WorkerError> {
        let Self { event, handle } = self;
        handle.await.map_err(|err| WorkerError::Aborted {
            event,
            detail: err.to_string(),
        })
    }
}

#[derive(Debug)]
pub enum StartupOutcome {
    /// The configured generation was already stored and is active again.
    Restored(GenerationId),
    Installed {
        install: InstallReport,
        activate: ActivateReport,
    },
}

pub struct WorkerHost {
    controller: Arc<CacheController>,
    config: CacheConfig,
}

impl WorkerHost {
    pub fn new(controller: Arc<CacheController>, config: CacheConfig) -> Self {
        Self { controller, config }
    }

    pub fn controller(&self) -> &Arc<CacheController> {
        &self.controller
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Dispatch one install attempt.
    pub fn dispatch_install(
        &self,
        generation: GenerationId,
    ) -> PendingEvent<Result<InstallReport, InstallError>> {
        let controller = Arc::clone(&self.controller);
        let manifest = self.config.manifest.clone();
        PendingEvent::spawn("install", async move {
            controller.on_install(&manifest, &generation).await
        })
    }

    /// Dispatch an install that is re-triggered on failure, up to the
    /// configured number of attempts.
    pub fn dispatch_install_with_retry(
        &self,
        generation: GenerationId,
    ) -> PendingEvent<Result<InstallReport, InstallError>> {
        let controller = Arc::clone(&self.controller);
        let manifest = self.config.manifest.clone();
        let attempts = self.config.install_attempts.get();
        let backoff = self.config.install_retry_backoff;
        PendingEvent::spawn("install", async move {
            install_with_retry(&controller, &manifest, &generation, attempts, backoff).await
        })
    }

    pub fn dispatch_activate(
        &self,
        generation: GenerationId,
    ) -> PendingEvent<Result<ActivateReport, ActivateError>> {
        let controller = Arc::clone(&self.controller);
        PendingEvent::spawn("activate", async move {
            controller.on_activate(&generation).await
        })
    }

    pub fn dispatch_fetch(
        &self,
        request: impl Into<FetchRequest>,
    ) -> PendingEvent<Result<Served, NetworkError>> {
        let request = request.into();
        let controller = Arc::clone(&self.controller);
        PendingEvent::spawn("fetch", async move { controller.on_fetch(request).await })
    }

    /// Bring the configured generation to `Active`: restore it when the
    /// store already holds it, otherwise install (with retries) and activate.
    pub async fn start(&self) -> Result<StartupOutcome, WorkerError> {
        let generation = self.config.generation.clone();
        if self.controller.restore(&generation).await? {
            return Ok(StartupOutcome::Restored(generation));
        }

        let install = self
            .dispatch_install_with_retry(generation.clone())
            .settled()
            .await??;
        let activate = self.dispatch_activate(generation).settled().await??;
        Ok(StartupOutcome::Installed { install, activate })
    }
}

async fn install_with_retry(
    controller: &CacheController,
    manifest: &AssetManifest,
    generation: &GenerationId,
    attempts: u32,
    backoff: Duration,
) -> Result<InstallReport, InstallError> {
    let mut attempt = 1;
    loop {
        match controller.on_install(manifest, generation).await {
            Ok(report) => {
                if attempt > 1 {
                    info!(generation = %generation, attempt, "Install succeeded after retry");
                }
                return Ok(report);
            }
            Err(err) if attempt < attempts => {
                warn!(
                    generation = %generation,
                    attempt,
                    attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Install failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
