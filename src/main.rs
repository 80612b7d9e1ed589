//! xray-panel server entry point.
//!
//! Opens the database, starts Xray and the periodic jobs, then serves the
//! REST API until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use xray_panel::api;
use xray_panel::app_state::AppState;
use xray_panel::config::PanelConfig;
use xray_panel::domain::{EventBus, Host, RestartSignal, StaticHost};
use xray_panel::persistence::SqliteRepository;
use xray_panel::service::{
    Accountant, DatabaseService, InboundService, Intervals, Reconciler, Scheduler,
};
use xray_panel::xray::{
    AccessLogWatcher, BanList, StatsClient, TrafficSource, XrayControl, XraySupervisor,
};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = PanelConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    init_tracing(config.log_json);
    tracing::info!(addr = %config.listen_addr, "starting xray-panel");

    // Persistence
    let repo = SqliteRepository::open(&config.database_path)
        .await
        .with_context(|| format!("open database {}", config.database_path.display()))?;

    // Xray runtime
    let supervisor = XraySupervisor::new(&config);
    match supervisor.get_version().await {
        Ok(version) => tracing::info!(
            %version,
            config = %supervisor.config_path().display(),
            "xray binary found"
        ),
        Err(e) => tracing::warn!(error = %e, "xray binary not usable yet"),
    }
    let xray: Arc<dyn XrayControl> = Arc::new(supervisor);
    let stats: Arc<dyn TrafficSource> =
        Arc::new(StatsClient::new(Arc::clone(&xray), config.stats_timeout()));
    let bans = Arc::new(BanList::new(&config.ban_list_path, config.ip_ban_duration()));

    // Services
    let signal = RestartSignal::new();
    let event_bus = EventBus::new(config.event_bus_capacity);
    let reconciler = Arc::new(Reconciler::new(
        repo.clone(),
        Arc::clone(&xray),
        signal.clone(),
        event_bus.clone(),
        Arc::clone(&bans),
    )
    .with_access_log(config.access_log_path.to_string_lossy()));

    // Tail whatever file the assembled config makes Xray write to.
    let assembled = reconciler
        .assemble_config()
        .await
        .context("assemble xray config")?;
    let access_log = assembled
        .access_log()
        .map_or_else(|| config.access_log_path.clone(), PathBuf::from);
    tracing::info!(path = %access_log.display(), "watching xray access log");
    let watcher = AccessLogWatcher::new(access_log, config.ip_window());

    let accountant = Arc::new(Accountant::new(
        repo.clone(),
        stats,
        signal.clone(),
        event_bus.clone(),
        bans,
        Some(watcher.clone()),
    ));
    let host: Arc<dyn Host> = Arc::new(StaticHost::from_env());
    let fallback_address = if config.listen_addr.ip().is_unspecified() {
        "localhost".to_string()
    } else {
        config.listen_addr.ip().to_string()
    };
    let inbounds = InboundService::new(repo.clone(), signal, host, fallback_address);
    let database = DatabaseService::new(repo, Arc::clone(&reconciler));

    // First start; failures are retried by the crash probe.
    if let Err(e) = reconciler.reconcile(true).await {
        tracing::error!(error = %e, "initial xray start failed");
    }
    let scheduler = Scheduler::start(
        Intervals::from_config(&config),
        Arc::clone(&reconciler),
        accountant,
        Some(watcher),
    );

    let app_state = AppState {
        inbounds,
        database,
        reconciler,
        event_bus,
    };

    // Build router
    let app = api::build_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
