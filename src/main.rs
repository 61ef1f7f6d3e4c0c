use std::{process, sync::Arc, time::Duration};

use isr_cache::{
    application::error::AppError,
    cache::{CacheConfig, Coordinator, EntryStore, spawn_purge_loop},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        render::TemplateDirRenderer,
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
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(_) => run_purge(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);

    let store = Arc::new(
        EntryStore::new(cache_config.directory.clone())
            .with_temp_grace(cache_config.purge_interval),
    );
    store.init().await.map_err(InfraError::from)?;

    let renderer = Arc::new(TemplateDirRenderer::new(
        settings.render.content_dir.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&store),
        renderer,
        Arc::new(cache_config.ttl_table()),
        cache_config.queue_config(),
    ));

    info!(
        cache_dir = %cache_config.directory.display(),
        content_dir = %settings.render.content_dir.display(),
        max_workers = cache_config.max_workers,
        default_ttl_secs = cache_config.default_ttl.as_secs(),
        route_rules = cache_config.routes.len(),
        "page cache ready"
    );

    let purge_handle = spawn_purge_loop(store, cache_config.purge_interval);

    let result = serve_http(
        &settings,
        HttpState {
            coordinator: Arc::clone(&coordinator),
        },
    )
    .await;

    purge_handle.abort();
    let _ = purge_handle.await;

    drain_regenerations(&coordinator, settings.server.graceful_shutdown).await;

    result
}

async fn run_purge(settings: config::Settings) -> Result<(), AppError> {
    let store = EntryStore::new(settings.cache.directory.clone());
    let report = store.purge_expired().await.map_err(InfraError::from)?;

    info!(
        cache_dir = %settings.cache.directory.display(),
        scanned = report.scanned,
        removed = report.removed,
        corrupt = report.corrupt,
        orphans = report.orphans,
        failed = report.failed,
        "purge finished"
    );
    println!(
        "scanned {} record(s): removed {} ({} unreadable), {} temp file(s) cleared, {} failed",
        report.scanned, report.removed, report.corrupt, report.orphans, report.failed
    );
    Ok(())
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

/// Let in-flight regenerations land before exiting; pending ones are dropped
/// once the grace period runs out.
async fn drain_regenerations(coordinator: &Coordinator, grace: Duration) {
    let queue = coordinator.queue();
    if tokio::time::timeout(grace, queue.wait_idle()).await.is_err() {
        let snapshot = queue.snapshot();
        let dropped = queue.clear();
        warn!(
            executing = snapshot.executing,
            dropped,
            grace_secs = grace.as_secs(),
            "regenerations still running at shutdown"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
