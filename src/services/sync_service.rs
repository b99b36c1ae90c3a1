use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::db::TaskStore;
use crate::error::SyncError;
use crate::sync::{SyncPhase, SyncSession, SyncTransport, TaskRecord};
use crate::timestamp::parse_timestamp;

/// What to do when a pulled record cannot be mapped onto a local task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullApplyPolicy {
    /// Apply nothing from the batch and keep the cursor where it was.
    #[default]
    Abort,
    /// Log the record, apply the rest and advance the cursor.
    SkipMalformed,
}

impl FromStr for PullApplyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(PullApplyPolicy::Abort),
            "skip" | "skip_malformed" => Ok(PullApplyPolicy::SkipMalformed),
            other => Err(format!("unknown pull apply policy {other:?}")),
        }
    }
}

impl fmt::Display for PullApplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullApplyPolicy::Abort => f.write_str("abort"),
            PullApplyPolicy::SkipMalformed => f.write_str("skip_malformed"),
        }
    }
}

/// Counts from one completed cycle, plus the cursor it stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub pushed: usize,
    pub pulled: usize,
    pub upserted: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub cursor: String,
}

/// Push-then-pull reconciliation between the device store and the sync
/// server. Remote records overwrite local ones wholesale; tombstones pulled
/// from the server hard-delete the local copy.
pub struct SyncService {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn SyncTransport>,
    policy: PullApplyPolicy,
}

impl SyncService {
    pub fn new(store: Arc<dyn TaskStore>, transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            store,
            transport,
            policy: PullApplyPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PullApplyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Best-effort background sync. Failures are logged and swallowed; the
    /// next call retries from the last stored cursor.
    pub async fn sync(&self, session: &SyncSession) {
        match self.run(session).await {
            Ok(stats) => info!(
                user_id = %session.user_id(),
                pushed = stats.pushed,
                pulled = stats.pulled,
                upserted = stats.upserted,
                deleted = stats.deleted,
                skipped = stats.skipped,
                cursor = %stats.cursor,
                "sync completed"
            ),
            Err(e) => error!(user_id = %session.user_id(), "sync failed: {}", e),
        }
    }

    /// One full cycle, reporting what happened. Waits for any cycle already
    /// running on the same session.
    pub async fn run(&self, session: &SyncSession) -> Result<SyncStats, SyncError> {
        let _guard = session.lock().await;
        let result = self.run_cycle(session).await;
        session.set_phase(SyncPhase::Idle);
        result
    }

    async fn run_cycle(&self, session: &SyncSession) -> Result<SyncStats, SyncError> {
        let user_id = session.user_id();
        info!(%user_id, "starting sync");
        let mut stats = SyncStats::default();

        session.set_phase(SyncPhase::Pushing);
        stats.pushed = self.push_local_tasks(user_id).await?;
        info!(%user_id, "pushed {} tasks", stats.pushed);

        session.set_phase(SyncPhase::Pulling);
        let since = session.cursor().load().await?;
        let response = self.transport.pull(user_id, &since).await?;
        if parse_timestamp(&response.server_time).is_none() {
            return Err(SyncError::Serialization(serde::de::Error::custom(format!(
                "server_time {:?} is not ISO-8601",
                response.server_time
            ))));
        }
        stats.pulled = response.records.len();
        info!(%user_id, %since, "pulled {} tasks", stats.pulled);

        self.apply_remote_tasks(user_id, response.records, &mut stats)
            .await?;

        session.set_phase(SyncPhase::CursorUpdating);
        session.cursor().save(&response.server_time).await?;
        stats.cursor = response.server_time;

        Ok(stats)
    }

    async fn push_local_tasks(&self, user_id: &str) -> Result<usize, SyncError> {
        let tasks = self.store.list_by_user(user_id).await?;
        let records: Vec<TaskRecord> = tasks.iter().map(TaskRecord::from).collect();

        let response = self.transport.push(&records).await?;
        if !response.status.eq_ignore_ascii_case("ok") {
            warn!(%user_id, status = %response.status, "push acknowledged with unexpected status");
        }
        Ok(records.len())
    }

    async fn apply_remote_tasks(
        &self,
        user_id: &str,
        records: Vec<TaskRecord>,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            match record.validate() {
                Ok(()) => accepted.push(record),
                Err(e) => match self.policy {
                    PullApplyPolicy::Abort => return Err(e),
                    PullApplyPolicy::SkipMalformed => {
                        warn!(%user_id, "skipping pulled record: {}", e);
                        stats.skipped += 1;
                    }
                },
            }
        }

        for record in accepted {
            if record.is_deleted {
                self.store.delete_by_id(&record.task_id).await?;
                stats.deleted += 1;
            } else {
                let task = record.into_task(user_id)?;
                self.store.upsert(&task).await?;
                stats.upserted += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Mutex, watch};

    use super::*;
    use crate::db::{KeyValueStore, MemoryKeyValueStore, SqliteTaskStore, repository, test_pool};
    use crate::models::{Task, TaskStatus};
    use crate::sync::{PullResponse, PushResponse};
    use crate::timestamp::EPOCH_CURSOR;

    #[derive(Default)]
    struct ScriptedTransport {
        pushes: Mutex<Vec<Vec<TaskRecord>>>,
        pulls: Mutex<Vec<(String, String)>>,
        pull_response: Mutex<Option<PullResponse>>,
        fail_push: bool,
        fail_pull: bool,
    }

    impl ScriptedTransport {
        fn pulling(response: PullResponse) -> Self {
            Self {
                pull_response: Mutex::new(Some(response)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn push(&self, records: &[TaskRecord]) -> Result<PushResponse, SyncError> {
            if self.fail_push {
                return Err(SyncError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.pushes.lock().await.push(records.to_vec());
            Ok(PushResponse {
                status: "ok".to_string(),
            })
        }

        async fn pull(&self, user_id: &str, since: &str) -> Result<PullResponse, SyncError> {
            self.pulls
                .lock()
                .await
                .push((user_id.to_string(), since.to_string()));
            if self.fail_pull {
                return Err(SyncError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(self
                .pull_response
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| PullResponse {
                    records: Vec::new(),
                    server_time: since.to_string(),
                }))
        }
    }

    fn local_task(id: &str, updated_at: &str) -> Task {
        Task {
            task_id: id.to_string(),
            user_id: "u1".to_string(),
            title: format!("task {id}"),
            description: None,
            status: TaskStatus::Pending,
            progress_percentage: 0,
            created_at: 1_704_067_200_000,
            priority: None,
            due_date: None,
            updated_at: updated_at.to_string(),
            is_deleted: false,
        }
    }

    fn remote_record(id: &str, updated_at: &str, is_deleted: bool) -> TaskRecord {
        TaskRecord {
            task_id: id.to_string(),
            user_id: "u1".to_string(),
            title: "Remote".to_string(),
            description: None,
            status: "PENDING".to_string(),
            progress_percentage: 0,
            created_at: 1_704_153_600_000,
            priority: None,
            due_date: None,
            updated_at: updated_at.to_string(),
            is_deleted,
        }
    }

    async fn setup() -> (sqlx::SqlitePool, SyncSession) {
        let pool = test_pool().await;
        let session = SyncSession::new("u1", Arc::new(MemoryKeyValueStore::new()));
        (pool, session)
    }

    fn service(pool: &sqlx::SqlitePool, transport: Arc<ScriptedTransport>) -> SyncService {
        SyncService::new(Arc::new(SqliteTaskStore::new(pool.clone())), transport)
    }

    #[tokio::test]
    async fn test_pull_adds_remote_task_and_advances_cursor() {
        let (pool, session) = setup().await;
        repository::upsert_task(&pool, &local_task("t1", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::pulling(PullResponse {
            records: vec![remote_record("t2", "2024-01-02T00:00:00Z", false)],
            server_time: "2024-01-03T00:00:00Z".to_string(),
        }));
        let stats = service(&pool, transport.clone()).run(&session).await.unwrap();

        let ids: Vec<String> = repository::list_tasks_by_user(&pool, "u1")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(session.cursor().load().await.unwrap(), "2024-01-03T00:00:00Z");
        assert_eq!(stats.pushed, 1);
        assert_eq!(stats.upserted, 1);

        let pulls = transport.pulls.lock().await;
        assert_eq!(pulls[0], ("u1".to_string(), EPOCH_CURSOR.to_string()));
    }

    #[tokio::test]
    async fn test_push_sends_full_local_set_including_tombstones() {
        let (pool, session) = setup().await;
        repository::upsert_task(&pool, &local_task("t1", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        let mut gone = local_task("t2", "2024-01-01T00:00:00Z");
        gone.is_deleted = true;
        repository::upsert_task(&pool, &gone).await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        service(&pool, transport.clone()).sync(&session).await;
        service(&pool, transport.clone()).sync(&session).await;

        let pushes = transport.pushes.lock().await;
        assert_eq!(pushes.len(), 2);
        for batch in pushes.iter() {
            assert_eq!(batch.len(), 2);
            assert!(batch.iter().any(|r| r.task_id == "t2" && r.is_deleted));
        }
    }

    #[tokio::test]
    async fn test_pulled_tombstone_hard_deletes_local_copy() {
        let (pool, session) = setup().await;
        repository::upsert_task(&pool, &local_task("t1", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::pulling(PullResponse {
            records: vec![
                remote_record("t1", "2024-01-02T00:00:00Z", true),
                remote_record("never-seen", "2024-01-02T00:00:00Z", true),
            ],
            server_time: "2024-01-03T00:00:00Z".to_string(),
        }));
        let stats = service(&pool, transport).run(&session).await.unwrap();

        assert_eq!(stats.deleted, 2);
        assert!(repository::find_task_by_id(&pool, "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_failure_skips_pull_and_keeps_cursor() {
        let (pool, session) = setup().await;
        session.cursor().save("2024-01-01T00:00:00Z").await.unwrap();

        let transport = Arc::new(ScriptedTransport {
            fail_push: true,
            ..Default::default()
        });
        let err = service(&pool, transport.clone()).run(&session).await.unwrap_err();

        assert!(matches!(err, SyncError::Status { status: 503, .. }));
        assert!(transport.pulls.lock().await.is_empty());
        assert_eq!(session.cursor().load().await.unwrap(), "2024-01-01T00:00:00Z");
        assert_eq!(session.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_pull_failure_after_push_keeps_cursor() {
        let (pool, session) = setup().await;
        repository::upsert_task(&pool, &local_task("t1", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        session.cursor().save("2024-01-01T12:00:00Z").await.unwrap();

        let transport = Arc::new(ScriptedTransport {
            fail_pull: true,
            ..Default::default()
        });
        service(&pool, transport.clone()).sync(&session).await;

        assert_eq!(transport.pushes.lock().await.len(), 1);
        assert_eq!(session.cursor().load().await.unwrap(), "2024-01-01T12:00:00Z");
        assert_eq!(session.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_malformed_record_aborts_whole_batch_by_default() {
        let (pool, session) = setup().await;
        let mut bad = remote_record("t3", "2024-01-02T00:00:00Z", false);
        bad.status = "ARCHIVED".to_string();

        let transport = Arc::new(ScriptedTransport::pulling(PullResponse {
            records: vec![remote_record("t2", "2024-01-02T00:00:00Z", false), bad],
            server_time: "2024-01-03T00:00:00Z".to_string(),
        }));
        let err = service(&pool, transport).run(&session).await.unwrap_err();

        assert!(matches!(err, SyncError::Mapping { ref task_id, .. } if task_id == "t3"));
        assert!(repository::find_task_by_id(&pool, "t2").await.unwrap().is_none());
        assert_eq!(session.cursor().load().await.unwrap(), EPOCH_CURSOR);
    }

    #[tokio::test]
    async fn test_skip_policy_applies_the_rest_and_advances_cursor() {
        let (pool, session) = setup().await;
        let mut bad = remote_record("t3", "2024-01-02T00:00:00Z", false);
        bad.progress_percentage = -5;

        let transport = Arc::new(ScriptedTransport::pulling(PullResponse {
            records: vec![bad, remote_record("t2", "2024-01-02T00:00:00Z", false)],
            server_time: "2024-01-03T00:00:00Z".to_string(),
        }));
        let stats = service(&pool, transport)
            .with_policy(PullApplyPolicy::SkipMalformed)
            .run(&session)
            .await
            .unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.upserted, 1);
        assert!(repository::find_task_by_id(&pool, "t2").await.unwrap().is_some());
        assert_eq!(session.cursor().load().await.unwrap(), "2024-01-03T00:00:00Z");
    }

    #[tokio::test]
    async fn test_unparseable_server_time_is_a_serialization_error() {
        let (pool, session) = setup().await;
        let transport = Arc::new(ScriptedTransport::pulling(PullResponse {
            records: vec![remote_record("t2", "2024-01-02T00:00:00Z", false)],
            server_time: "not a time".to_string(),
        }));
        let err = service(&pool, transport).run(&session).await.unwrap_err();

        assert!(matches!(err, SyncError::Serialization(_)));
        assert!(repository::find_task_by_id(&pool, "t2").await.unwrap().is_none());
        assert_eq!(session.cursor().load().await.unwrap(), EPOCH_CURSOR);
    }

    struct SlowTransport {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for SlowTransport {
        async fn push(&self, _records: &[TaskRecord]) -> Result<PushResponse, SyncError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(PushResponse {
                status: "ok".to_string(),
            })
        }

        async fn pull(&self, _user_id: &str, since: &str) -> Result<PullResponse, SyncError> {
            Ok(PullResponse {
                records: Vec::new(),
                server_time: since.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_session_do_not_interleave() {
        let (pool, session) = setup().await;
        let transport = Arc::new(SlowTransport {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let service = Arc::new(SyncService::new(
            Arc::new(SqliteTaskStore::new(pool)),
            transport.clone(),
        ));
        let session = Arc::new(session);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let service = service.clone();
                let session = session.clone();
                tokio::spawn(async move { service.sync(&session).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    }

    /// Session phase as seen at each point where the cycle reaches outside.
    #[derive(Default)]
    struct PhaseLog {
        rx: StdMutex<Option<watch::Receiver<SyncPhase>>>,
        seen: StdMutex<Vec<SyncPhase>>,
    }

    impl PhaseLog {
        fn watch(&self, session: &SyncSession) {
            *self.rx.lock().unwrap() = Some(session.subscribe());
        }

        fn record(&self) {
            let phase = match self.rx.lock().unwrap().as_ref() {
                Some(rx) => *rx.borrow(),
                None => return,
            };
            let mut seen = self.seen.lock().unwrap();
            if seen.last() != Some(&phase) {
                seen.push(phase);
            }
        }

        fn seen(&self) -> Vec<SyncPhase> {
            self.seen.lock().unwrap().clone()
        }
    }

    struct LoggedKeyValueStore {
        inner: MemoryKeyValueStore,
        log: Arc<PhaseLog>,
    }

    #[async_trait]
    impl KeyValueStore for LoggedKeyValueStore {
        async fn get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
            self.log.record();
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), sqlx::Error> {
            self.inner.remove(key).await
        }
    }

    struct LoggedTransport {
        log: Arc<PhaseLog>,
        fail_push: bool,
        fail_pull: bool,
        server_time: &'static str,
    }

    #[async_trait]
    impl SyncTransport for LoggedTransport {
        async fn push(&self, _records: &[TaskRecord]) -> Result<PushResponse, SyncError> {
            self.log.record();
            if self.fail_push {
                return Err(SyncError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(PushResponse {
                status: "ok".to_string(),
            })
        }

        async fn pull(&self, _user_id: &str, _since: &str) -> Result<PullResponse, SyncError> {
            self.log.record();
            if self.fail_pull {
                return Err(SyncError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(PullResponse {
                records: Vec::new(),
                server_time: self.server_time.to_string(),
            })
        }
    }

    async fn observed_phases(
        fail_push: bool,
        fail_pull: bool,
        server_time: &'static str,
    ) -> (bool, Vec<SyncPhase>) {
        let pool = test_pool().await;
        let log = Arc::new(PhaseLog::default());
        let kv = Arc::new(LoggedKeyValueStore {
            inner: MemoryKeyValueStore::new(),
            log: log.clone(),
        });
        let session = SyncSession::new("u1", kv);
        log.watch(&session);
        log.record();

        let transport = Arc::new(LoggedTransport {
            log: log.clone(),
            fail_push,
            fail_pull,
            server_time,
        });
        let service = SyncService::new(Arc::new(SqliteTaskStore::new(pool)), transport);
        let ok = service.run(&session).await.is_ok();
        log.record();
        (ok, log.seen())
    }

    #[tokio::test]
    async fn test_successful_cycle_walks_every_phase() {
        let (ok, phases) = observed_phases(false, false, "2024-01-03T00:00:00Z").await;
        assert!(ok);
        assert_eq!(
            phases,
            vec![
                SyncPhase::Idle,
                SyncPhase::Pushing,
                SyncPhase::Pulling,
                SyncPhase::CursorUpdating,
                SyncPhase::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_push_failure_returns_to_idle_from_pushing() {
        let (ok, phases) = observed_phases(true, false, "2024-01-03T00:00:00Z").await;
        assert!(!ok);
        assert_eq!(
            phases,
            vec![SyncPhase::Idle, SyncPhase::Pushing, SyncPhase::Idle]
        );
    }

    #[tokio::test]
    async fn test_pull_failure_returns_to_idle_from_pulling() {
        let (ok, phases) = observed_phases(false, true, "2024-01-03T00:00:00Z").await;
        assert!(!ok);
        assert_eq!(
            phases,
            vec![
                SyncPhase::Idle,
                SyncPhase::Pushing,
                SyncPhase::Pulling,
                SyncPhase::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_server_time_never_reaches_cursor_update() {
        let (ok, phases) = observed_phases(false, false, "not a time").await;
        assert!(!ok);
        assert_eq!(
            phases,
            vec![
                SyncPhase::Idle,
                SyncPhase::Pushing,
                SyncPhase::Pulling,
                SyncPhase::Idle,
            ]
        );
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("abort".parse::<PullApplyPolicy>().unwrap(), PullApplyPolicy::Abort);
        assert_eq!(" Skip ".parse::<PullApplyPolicy>().unwrap(), PullApplyPolicy::SkipMalformed);
        assert!("retry".parse::<PullApplyPolicy>().is_err());
    }
}
