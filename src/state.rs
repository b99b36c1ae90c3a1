use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::MutexGuard;

use crate::services::SyncService;
use crate::sync::SyncSession;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub sync: Arc<SyncService>,
    /// Present while a user is logged in for sync.
    pub session: Option<Arc<SyncSession>>,
}

impl AppState {
    /// Local writes hold this so they never land inside a running sync cycle.
    pub(crate) async fn write_guard(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.session {
            Some(session) => Some(session.lock().await),
            None => None,
        }
    }
}
