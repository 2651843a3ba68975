use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reminderd::connectivity::ConnectivityMonitor;
use reminderd::remote::{HttpRemote, InMemoryRemote, RemoteApi, RemoteConfig};
use reminderd::routes::router;
use reminderd::services::{SyncConfig, SyncScheduler};
use reminderd::state::AppState;
use reminderd::store::ReminderStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "reminderd=debug".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://reminders.db?mode=rwc".to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let remote: Arc<dyn RemoteApi> = match RemoteConfig::new_from_env() {
        Ok(config) => Arc::new(HttpRemote::new(config)?),
        Err(e) => {
            warn!("no remote configured ({}), falling back to in-memory remote", e);
            Arc::new(InMemoryRemote::new())
        }
    };

    let connectivity = ConnectivityMonitor::new(true);
    let store = Arc::new(ReminderStore::new(
        pool,
        remote,
        connectivity.clone(),
        SyncConfig::default(),
    ));
    store.spawn_engine();

    let interval_secs = std::env::var("SYNC_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300);
    let scheduler = SyncScheduler::new(store.engine(), connectivity.clone(), interval_secs);
    tokio::spawn(scheduler.start());

    let state = AppState { store };
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
