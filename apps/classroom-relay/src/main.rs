use axum::Router;
use classroom_relay::accounting;
use classroom_relay::config::AppConfig;
use classroom_relay::metrics;
use classroom_relay::routes;
use classroom_relay::state::{self, AppState, Relay, RelaySettings};
use classroom_relay::telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env()?;
    init_tracing(&cfg.log_filter);

    let store = state::build_store(&cfg).await?;
    let sink = accounting::build_accounting(cfg.accounting_url.as_deref());
    let relay = Relay::new(store.clone(), sink, &RelaySettings::from(&cfg));
    let _sweeper = relay.scheduler.spawn(cfg.sweep_interval);
    let app_state = AppState::new(cfg.instance_id.clone(), store.mode(), relay);

    let app: Router = routes::router(app_state);

    info!(
        addr = %cfg.bind_addr,
        instance = %cfg.instance_id,
        store_backend = ?cfg.store_backend,
        store_mode = ?store.mode(),
        redis = %cfg.redis_url,
        cluster_nodes = cfg.redis_cluster_nodes.len(),
        room_ttl_secs = cfg.room_ttl.as_secs(),
        block_timeout_ms = cfg.block_timeout.as_millis() as u64,
        sweep_interval_ms = cfg.sweep_interval.as_millis() as u64,
        accounting = %cfg.accounting_url.as_deref().unwrap_or("log-only"),
        "starting classroom-relay"
    );
    metrics::BOOT_COUNTER.inc();
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
