use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, watch};

use crate::db::KeyValueStore;
use crate::timestamp::EPOCH_CURSOR;

pub const CURSOR_KEY: &str = "last_sync_time";
/// User the stored cursor belongs to.
pub const CURSOR_OWNER_KEY: &str = "last_sync_user";

/// Persists the "pulled up to here" boundary for one user on this device.
///
/// The device keeps a single cursor slot. A cursor saved by another user, or
/// one with no recorded owner, reads as the epoch sentinel so a different
/// login starts with a full pull.
#[derive(Clone)]
pub struct CursorStore {
    kv: Arc<dyn KeyValueStore>,
    user_id: String,
}

impl CursorStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, user_id: impl Into<String>) -> Self {
        Self {
            kv,
            user_id: user_id.into(),
        }
    }

    /// The stored cursor, or the epoch sentinel before this user's first pull.
    pub async fn load(&self) -> Result<String, sqlx::Error> {
        let owner = self.kv.get(CURSOR_OWNER_KEY).await?;
        if owner.as_deref() != Some(self.user_id.as_str()) {
            return Ok(EPOCH_CURSOR.to_string());
        }
        Ok(self
            .kv
            .get(CURSOR_KEY)
            .await?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| EPOCH_CURSOR.to_string()))
    }

    /// Owner is dropped first and written last, so a save that fails halfway
    /// leaves a cursor nobody owns.
    pub async fn save(&self, cursor: &str) -> Result<(), sqlx::Error> {
        self.kv.remove(CURSOR_OWNER_KEY).await?;
        self.kv.set(CURSOR_KEY, cursor).await?;
        self.kv.set(CURSOR_OWNER_KEY, &self.user_id).await
    }

    pub async fn clear(&self) -> Result<(), sqlx::Error> {
        self.kv.remove(CURSOR_OWNER_KEY).await?;
        self.kv.remove(CURSOR_KEY).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
    CursorUpdating,
}

/// Sync context for a logged-in user on this device.
///
/// Created at login and dropped after logout. Holding the session's run lock
/// keeps two cycles for the same user from interleaving, and keeps local
/// writes out of a running cycle.
pub struct SyncSession {
    user_id: String,
    cursor: CursorStore,
    run_lock: Mutex<()>,
    phase: watch::Sender<SyncPhase>,
}

impl SyncSession {
    pub fn new(user_id: impl Into<String>, kv: Arc<dyn KeyValueStore>) -> Self {
        let user_id = user_id.into();
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            cursor: CursorStore::new(kv, user_id.clone()),
            user_id,
            run_lock: Mutex::new(()),
            phase,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn cursor(&self) -> &CursorStore {
        &self.cursor
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    /// Forgets the cursor so the next login on this device pulls everything.
    /// Waits for a running cycle to finish first.
    pub async fn logout(&self) -> Result<(), sqlx::Error> {
        let _guard = self.run_lock.lock().await;
        self.cursor.clear().await
    }
}
