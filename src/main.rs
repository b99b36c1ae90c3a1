use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tasksync::api::router;
use tasksync::config::AppConfig;
use tasksync::db::{self, SqliteKeyValueStore, SqliteTaskStore};
use tasksync::services::{SyncScheduler, SyncService};
use tasksync::state::AppState;
use tasksync::sync::{HttpSyncTransport, NoopSyncTransport, SyncSession, SyncTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tasksync=debug".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let pool = db::connect(&config.database_url).await?;

    let transport: Arc<dyn SyncTransport> = match &config.sync_base_url {
        Some(base_url) => {
            info!("syncing with {}", base_url);
            Arc::new(HttpSyncTransport::new(base_url, config.request_timeout)?)
        }
        None => {
            warn!("SYNC_BASE_URL is not set, running offline only");
            Arc::new(NoopSyncTransport)
        }
    };

    let sync = Arc::new(
        SyncService::new(Arc::new(SqliteTaskStore::new(pool.clone())), transport)
            .with_policy(config.pull_apply_policy),
    );

    let session = config.sync_user_id.as_ref().map(|user_id| {
        let kv = Arc::new(SqliteKeyValueStore::new(pool.clone()));
        Arc::new(SyncSession::new(user_id.clone(), kv))
    });

    match &session {
        Some(session) if config.sync_interval_secs > 0 => {
            let scheduler =
                SyncScheduler::new(sync.clone(), session.clone(), config.sync_interval_secs);
            tokio::spawn(scheduler.start());
        }
        Some(_) => info!("auto-sync disabled"),
        None => warn!("SYNC_USER_ID is not set, sync is only possible once a user logs in"),
    }

    let state = AppState {
        db: pool.clone(),
        sync,
        session,
    };

    let app = router(state);

    let addr = config.bind_addr();
    info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
