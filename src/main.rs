use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradegate::application::handlers::postback::{self, PostbackState};
use tradegate::application::services::fill_reconciler::FillReconciler;
use tradegate::config::GatekeeperConfig;
use tradegate::config_watcher::{self, ConfigWatcher};
use tradegate::domain::repositories::TradeStore;
use tradegate::domain::services::circuit_breaker::CircuitBreaker;
use tradegate::domain::services::gatekeeper::Gatekeeper;
use tradegate::persistence::{self, DatabaseConfig, SqliteTradeStore};

const DEFAULT_CONFIG_PATH: &str = "config/tradegate.json";
const MAX_POSTBACK_BYTES: usize = 64 * 1024;
const MAX_CONCURRENT_POSTBACKS: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradegate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("TRADEGATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatekeeperConfig::load(&config_path)?;
    info!(
        mode = %config.trading_mode,
        capital = config.capital,
        "Loaded configuration from {}",
        config_path
    );

    let pool = persistence::init_database_with(&DatabaseConfig::from_env(&config.database_url)).await?;
    let store: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::new(pool));

    let breaker = Arc::new(CircuitBreaker::new(config.risk.circuit_breaker.clone()));
    let gatekeeper = Arc::new(Gatekeeper::new(
        config.risk.limits.clone(),
        config.capital,
        breaker.clone(),
    ));
    match config.load_sector_map() {
        Ok(Some(sectors)) => {
            info!("Loaded sector map with {} symbols", sectors.len());
            gatekeeper.set_sector_map(Some(sectors));
        }
        Ok(None) => info!("No sector map configured, sector limits disabled"),
        Err(e) => warn!("Sector map unavailable, sector limits disabled: {}", e),
    }

    let open = store.open_trades().await?;
    info!("{} open trades restored from storage", open.len());

    let reconciler = Arc::new(FillReconciler::new(store, breaker.clone()));

    let watcher = Arc::new(ConfigWatcher::new(&config_path, config.clone())?);
    let watcher_task = watcher.spawn();
    let applier_task = config_watcher::apply_to_gatekeeper(watcher.subscribe(), gatekeeper.clone());

    let postbacks = PostbackState::new();
    postbacks.on_order_update(reconciler.clone());

    if config.webhook.enabled {
        let app = postback::router(&config.webhook.path, postbacks)
            .merge(
                Router::new()
                    .route("/status", get(status))
                    .with_state(gatekeeper.clone()),
            )
            .layer(RequestBodyLimitLayer::new(MAX_POSTBACK_BYTES))
            .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_POSTBACKS))
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.webhook.port));
        info!("Postback receiver listening on {}{}", addr, config.webhook.path);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        warn!("Webhook disabled; fills will not be reconciled");
        shutdown_signal().await;
    }

    info!("Shutting down...");
    watcher.stop();
    if let Err(e) = watcher_task.await {
        error!("Config watcher task failed: {}", e);
    }
    applier_task.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Gatekeeper status: breaker state and active limits
async fn status(State(gatekeeper): State<Arc<Gatekeeper>>) -> Json<serde_json::Value> {
    let breaker = gatekeeper.breaker().stats().await;
    Json(serde_json::json!({
        "circuit_breaker": breaker,
        "capital": gatekeeper.validator().total_capital(),
        "risk": gatekeeper.validator().risk_config(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
