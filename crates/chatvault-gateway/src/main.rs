use std::net::SocketAddr;
use std::sync::Arc;

use chatvault_access::{AdminService, ScopeResolver};
use chatvault_bridge::RealtimeBridge;
use chatvault_core::config::{ChatvaultConfig, StorageBackendKind};
use chatvault_massop::MassOperationProtector;
use chatvault_scheduler::StatsScheduler;
use chatvault_sessions::SessionManager;
use chatvault_storage::StorageAdapter;
use tokio::sync::watch;
use tracing::info;

mod app;
mod auth;
mod avatar;
mod error;
mod http;
mod push;
mod ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatvault_gateway=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("CHATVAULT_CONFIG").unwrap_or_else(|_| "chatvault.toml".to_string());
    let config = ChatvaultConfig::load(&config_path);

    let storage: Arc<dyn StorageAdapter> = match config.storage.backend {
        StorageBackendKind::Embedded => Arc::new(chatvault_storage::EmbeddedStorage::open(&config.storage.path)?),
        StorageBackendKind::Server => {
            let url = config
                .storage
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("storage.url is required for the server backend"))?;
            Arc::new(chatvault_storage::ServerStorage::connect(url).await?)
        }
    };

    let scope = Arc::new(ScopeResolver::new(storage.clone(), config.display_chat_ids.clone()));
    scope.normalize_display_filter().await?;

    let sessions = Arc::new(SessionManager::new(
        config.auth_session_seconds(),
        config.auth.max_sessions_per_user,
        config.auth.rate_limit as usize,
        config.auth.rate_window_s as i64,
    ));
    let admin = Arc::new(AdminService::new(storage.clone()));

    let massop = Arc::new(MassOperationProtector::new(
        config.mass_op.threshold,
        config.mass_op.window_s as i64,
        config.mass_op.buffer_delay_s,
    ));
    let bridge = Arc::new(RealtimeBridge::new(storage.clone(), massop));

    let timezone: chrono_tz::Tz = config
        .viewer_timezone
        .parse()
        .unwrap_or(chrono_tz::UTC);
    let scheduler = Arc::new(StatsScheduler::new(storage.clone(), timezone, config.stats_calculation_hour));
    scheduler.recompute_if_missing().await;

    let push_dispatcher = Arc::new(push::PushDispatcher::new(
        storage.clone(),
        bridge.clone(),
        config.push.clone(),
        config.push_notifications,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bridge_task = tokio::spawn(bridge.clone().run(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let push_task = tokio::spawn(push_dispatcher.run(shutdown_rx.clone()));
    let sweep_task = tokio::spawn(session_sweep_loop(sessions.clone(), shutdown_rx.clone()));

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;

    let state = Arc::new(app::AppState::new(config, storage, scope, sessions, admin, bridge));
    let router = app::build_router(state);

    info!(%addr, "chatvault gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    let _ = tokio::join!(bridge_task, scheduler_task, push_task, sweep_task);
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

async fn session_sweep_loop(sessions: Arc<SessionManager>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(chatvault_core::config::SESSION_SWEEP_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => sessions.sweep(),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
