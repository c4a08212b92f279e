use std::{process, sync::Arc};

use pantry::{
    application::{
        error::AppError,
        worker::{StartupOutcome, WorkerError, WorkerHost},
    },
    cache::{AssetStore, CacheConfig, CacheController, MemoryStore, RequestKey, StoreBackend},
    config,
    infra::{
        error::InfraError,
        fs_store::FileStore,
        http::{self, ProxyState},
        network::HttpNetwork,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let host = build_worker_host(&settings)?;

    match command {
        config::Command::Serve(_) => run_serve(&settings, host).await,
        config::Command::Install(_) => run_install(&host).await,
        config::Command::Activate(_) => run_activate(&host).await,
        config::Command::Fetch(args) => run_fetch(&host, &args.path).await,
        config::Command::Generations(_) => run_generations(&host).await,
    }
}

fn build_worker_host(settings: &config::Settings) -> Result<Arc<WorkerHost>, AppError> {
    let cache_config = CacheConfig::from(&settings.cache);

    let store: Arc<dyn AssetStore> = match &cache_config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Filesystem(root) => {
            Arc::new(FileStore::new(root.clone()).map_err(InfraError::from)?)
        }
    };
    let network = Arc::new(HttpNetwork::new(cache_config.fetch_timeout)?);

    let controller = CacheController::new(store, network)
        .with_install_concurrency(cache_config.install_concurrency);

    Ok(Arc::new(WorkerHost::new(
        Arc::new(controller),
        cache_config,
    )))
}

async fn run_serve(settings: &config::Settings, host: Arc<WorkerHost>) -> Result<(), AppError> {
    match host.start().await? {
        StartupOutcome::Restored(generation) => {
            info!(generation = %generation, "Restored cached generation");
        }
        StartupOutcome::Installed { install, activate } => {
            info!(
                generation = %install.generation,
                entries = install.entries,
                elapsed_ms = install.elapsed.as_millis() as u64,
                deleted = activate.deleted.len(),
                failed = activate.failed.len(),
                "Installed and activated generation"
            );
        }
    }

    let router = http::build_router(ProxyState { host });
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(addr = %settings.server.addr, "Offline proxy listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn run_install(host: &WorkerHost) -> Result<(), AppError> {
    let generation = host.config().generation.clone();
    let report = host
        .dispatch_install_with_retry(generation)
        .settled()
        .await?
        .map_err(WorkerError::from)?;

    println!(
        "installed {} ({} entries in {} ms)",
        report.generation,
        report.entries,
        report.elapsed.as_millis()
    );
    Ok(())
}

async fn run_activate(host: &WorkerHost) -> Result<(), AppError> {
    let generation = host.config().generation.clone();
    let report = host
        .dispatch_activate(generation)
        .settled()
        .await?
        .map_err(WorkerError::from)?;

    println!("active {}", report.generation);
    for deleted in &report.deleted {
        println!("deleted {deleted}");
    }
    for (generation, err) in &report.failed {
        println!("failed to delete {generation}: {err}");
    }
    Ok(())
}

async fn run_fetch(host: &WorkerHost, path: &str) -> Result<(), AppError> {
    let generation = host.config().generation.clone();
    if !host
        .controller()
        .restore(&generation)
        .await
        .map_err(InfraError::from)?
    {
        warn!(generation = %generation, "Generation is not stored; fetching from network");
    }

    let request = RequestKey::get(&host.config().origin, path)?;
    let served = host.dispatch_fetch(&request).settled().await??;

    println!(
        "{request} -> {} from {:?} ({} bytes)",
        served.response.status,
        served.source,
        served.response.body.len()
    );
    Ok(())
}

async fn run_generations(host: &WorkerHost) -> Result<(), AppError> {
    let store = host.controller().store();
    let generations = store
        .list_generations()
        .await
        .map_err(InfraError::from)?;

    if generations.is_empty() {
        println!("no stored generations");
        return Ok(());
    }

    for generation in generations {
        let entries = store
            .entry_count(&generation)
            .await
            .map_err(InfraError::from)?
            .unwrap_or(0);
        let marker = if generation == host.config().generation {
            " (configured)"
        } else {
            ""
        };
        println!("{generation}\t{entries} entries{marker}");
    }
    Ok(())
}
