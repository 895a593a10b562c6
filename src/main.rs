use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use caravel::catalog::{MemoryPolicyStore, Policy};
use caravel::engine::{Engine, EngineConfig};
use caravel::gateway::{RetryingGateway, SandboxGateway};
use caravel::http::{self, AppState};
use caravel::model::{MS_PER_HOUR, MS_PER_MINUTE};
use caravel::webhook::Dispatcher;
use caravel::{observability, reaper};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("CARAVEL_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    observability::init(metrics_port);

    let port = std::env::var("CARAVEL_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("CARAVEL_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("CARAVEL_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let webhook_secret = std::env::var("CARAVEL_WEBHOOK_SECRET").unwrap_or_else(|_| {
        tracing::warn!("CARAVEL_WEBHOOK_SECRET not set, using the development secret");
        "caravel-dev-secret".into()
    });

    let hold_ttl_mins: i64 = env_parse("CARAVEL_HOLD_TTL_MINUTES", 15);
    let retention_hours: i64 = env_parse("CARAVEL_EVENT_RETENTION_HOURS", 72);
    let reap_interval_secs: u64 = env_parse("CARAVEL_REAP_INTERVAL_SECS", 5);
    let compact_threshold: u64 = env_parse("CARAVEL_COMPACT_THRESHOLD", 1000);
    let gateway_attempts: u32 = env_parse("CARAVEL_GATEWAY_ATTEMPTS", 3);

    let default_policy = Policy {
        free_window_hours: env_parse("CARAVEL_FREE_WINDOW_HOURS", 48),
        partial_window_hours: env_parse("CARAVEL_PARTIAL_WINDOW_HOURS", 24),
        partial_refund_pct: env_parse("CARAVEL_PARTIAL_REFUND_PCT", 50),
        change_fee_cents: env_parse("CARAVEL_CHANGE_FEE_CENTS", 0),
        modify_until_hours: env_parse("CARAVEL_MODIFY_UNTIL_HOURS", 48),
    };

    std::fs::create_dir_all(&data_dir)?;

    let gateway = Arc::new(RetryingGateway::new(
        SandboxGateway::new(),
        gateway_attempts,
        Duration::from_millis(200),
    ));
    let policies = Arc::new(MemoryPolicyStore::new(default_policy));
    let config = EngineConfig {
        hold_ttl_ms: hold_ttl_mins * MS_PER_MINUTE,
        event_retention_ms: retention_hours * MS_PER_HOUR,
    };
    let wal_path = PathBuf::from(&data_dir).join("caravel.wal");
    let engine = Arc::new(Engine::new(wal_path, gateway, policies, config)?);

    let reaper_engine = engine.clone();
    tokio::spawn(async move {
        reaper::run_reaper(reaper_engine, Duration::from_secs(reap_interval_secs)).await;
    });
    let compactor_engine = engine.clone();
    tokio::spawn(async move {
        reaper::run_compactor(compactor_engine, compact_threshold).await;
    });

    let dispatcher = Arc::new(Dispatcher::new(engine.clone(), webhook_secret));
    let state = AppState {
        engine,
        dispatcher,
        sources: Vec::new(),
        search_timeout: Duration::from_millis(
            env_parse("CARAVEL_SEARCH_TIMEOUT_MS", 1500u64),
        ),
    };
    let app = http::router(state);

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("caravel listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  hold_ttl: {hold_ttl_mins}m, event_retention: {retention_hours}h");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    // Stop accepting on SIGTERM/ctrl-c; axum drains in-flight requests.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("caravel stopped");
    Ok(())
}
