//! Local one-shot notification facility persisted to SQLite.
//!
//! [`NotifierHandle`] implements [`NotificationFacility`]: submitting inserts a
//! pending row into `triggers`, cancelling deletes it. [`NotifierEngine`] polls
//! the same table and fires every pending trigger whose time has arrived.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::time::Duration;

use async_trait::async_trait;
use careminder_core::{HandleId, ReminderContent};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    db::{format_local, init_db, parse_local},
    error::NotifyError,
    notify::{NotificationFacility, PermissionGrant},
    types::{FiredNotification, Trigger, TriggerStatus},
};

/// Shared handle for submitting and cancelling triggers while the engine runs.
///
/// Uses its own `Connection` so scheduler operations never contend with the
/// engine's polling queries.
pub struct NotifierHandle {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    permission_granted: AtomicBool,
}

impl NotifierHandle {
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, NotifyError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            permission_granted: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, NotifyError> {
        self.conn.lock().map_err(|_| NotifyError::LockPoisoned)
    }

    /// All pending triggers ordered by fire time.
    pub fn list_pending(&self) -> Result<Vec<Trigger>, NotifyError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, body, fire_at, status FROM triggers
             WHERE status = 'pending' ORDER BY fire_at, id",
        )?;
        let triggers = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?, // id
                    row.get::<_, String>(1)?, // title
                    row.get::<_, String>(2)?, // body
                    row.get::<_, String>(3)?, // fire_at
                    row.get::<_, String>(4)?, // status
                ))
            })?
            .filter_map(|r| {
                let (id, title, body, fire_at, status) = r.ok()?;
                Some(Trigger {
                    handle: HandleId::from(id),
                    content: ReminderContent { title, body },
                    fire_at: parse_local(&fire_at)?,
                    status: status.parse().ok()?,
                })
            })
            .collect();
        Ok(triggers)
    }
}

#[async_trait]
impl NotificationFacility for NotifierHandle {
    /// The local notifier needs no platform prompt; the grant is recorded once.
    async fn request_permission(&self) -> Result<PermissionGrant, NotifyError> {
        if !self.permission_granted.swap(true, Ordering::SeqCst) {
            info!("local notification permission granted");
        }
        Ok(PermissionGrant::granted())
    }

    async fn submit_one_shot(
        &self,
        content: &ReminderContent,
        at: NaiveDateTime,
    ) -> Result<HandleId, NotifyError> {
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(NotifyError::PermissionDenied);
        }
        let now = self.clock.now();
        if at <= now {
            return Err(NotifyError::Rejected(format!(
                "trigger time {at} is not in the future"
            )));
        }
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO triggers (id, title, body, fire_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            rusqlite::params![
                id,
                content.title,
                content.body,
                format_local(at),
                format_local(now)
            ],
        )?;
        debug!(handle = %id, fire_at = %at, "trigger submitted");
        Ok(HandleId::from(id))
    }

    async fn cancel_by_id(&self, handle: &HandleId) -> Result<(), NotifyError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM triggers WHERE id = ?1 AND status = 'pending'",
            [handle.as_str()],
        )?;
        if n == 0 {
            return Err(NotifyError::UnknownHandle {
                handle: handle.clone(),
            });
        }
        debug!(%handle, "trigger cancelled");
        Ok(())
    }
}

/// Days fired and missed trigger rows are kept unless overridden.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Polling loop that delivers due triggers at ±`poll_interval` precision.
pub struct NotifierEngine {
    conn: Connection,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    /// If set, fired notifications are sent here for presentation.
    fired_tx: Option<mpsc::Sender<FiredNotification>>,
    /// Fired and missed rows older than this are deleted.
    retention: chrono::Duration,
    last_prune: Option<NaiveDateTime>,
}

impl NotifierEngine {
    /// Create a new engine, initialising the DB schema if needed.
    ///
    /// The sender is non-blocking (`try_send`) so the tick loop is never stalled.
    pub fn new(
        conn: Connection,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        fired_tx: Option<mpsc::Sender<FiredNotification>>,
    ) -> Result<Self, NotifyError> {
        init_db(&conn)?;
        Ok(Self {
            conn,
            clock,
            poll_interval,
            fired_tx,
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
            last_prune: None,
        })
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Main event loop. Polls until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "notifier engine started");
        match self.mark_missed() {
            Ok(n) if n > 0 => warn!(count = n, "triggers marked missed on startup"),
            Err(e) => error!("missed-on-startup query failed: {e}"),
            _ => {}
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("notifier tick error: {e}");
                    }
                    if let Err(e) = self.prune_if_due() {
                        error!("trigger pruning failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("notifier engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Mark every pending trigger whose time has already passed as missed.
    pub fn mark_missed(&mut self) -> Result<usize, NotifyError> {
        let now = format_local(self.clock.now());
        let n = self.conn.execute(
            "UPDATE triggers SET status = 'missed'
             WHERE status = 'pending' AND fire_at < ?1",
            [&now],
        )?;
        Ok(n)
    }

    /// Delete fired and missed rows whose fire time is older than the
    /// retention window. Pending rows are never touched.
    pub fn prune(&mut self) -> Result<usize, NotifyError> {
        let now = self.clock.now();
        let cutoff = format_local(now - self.retention);
        let n = self.conn.execute(
            "DELETE FROM triggers WHERE status != 'pending' AND fire_at < ?1",
            [&cutoff],
        )?;
        self.last_prune = Some(now);
        if n > 0 {
            debug!(count = n, %cutoff, "old triggers pruned");
        }
        Ok(n)
    }

    /// Prune at most once a day.
    fn prune_if_due(&mut self) -> Result<usize, NotifyError> {
        let now = self.clock.now();
        match self.last_prune {
            Some(last) if now - last < chrono::Duration::days(1) => Ok(0),
            _ => self.prune(),
        }
    }

    /// Fire all pending triggers whose time has arrived. Returns how many fired.
    pub fn tick(&mut self) -> Result<usize, NotifyError> {
        let now = self.clock.now();
        let now_str = format_local(now);

        // Collect eagerly so `stmt` is dropped before the UPDATEs below.
        let due: Vec<(String, String, String, String)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id, title, body, fire_at FROM triggers
                 WHERE status = 'pending' AND fire_at <= ?1
                 ORDER BY fire_at, id",
            )?;
            let rows: Vec<_> = stmt
                .query_map([&now_str], |row| {
                    Ok((
                        row.get::<_, String>(0)?, // id
                        row.get::<_, String>(1)?, // title
                        row.get::<_, String>(2)?, // body
                        row.get::<_, String>(3)?, // fire_at
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut fired = 0;
        for (id, title, body, fire_at) in due {
            // A concurrent cancel may have removed the row since the SELECT.
            let n = self.conn.execute(
                "UPDATE triggers SET status = ?1, fired_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                rusqlite::params![TriggerStatus::Fired.to_string(), now_str, id],
            )?;
            if n == 0 {
                continue;
            }
            fired += 1;
            info!(handle = %id, %title, "trigger fired");

            if let Some(ref tx) = self.fired_tx {
                let notification = FiredNotification {
                    handle: HandleId::from(id.clone()),
                    content: ReminderContent { title, body },
                    fire_at: parse_local(&fire_at).unwrap_or(now),
                    fired_at: now,
                };
                if tx.try_send(notification).is_err() {
                    warn!(handle = %id, "delivery channel full or closed; notification dropped");
                }
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{Duration as ChronoDuration, NaiveDate};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn content() -> ReminderContent {
        ReminderContent {
            title: "Hydration Reminder".into(),
            body: "Time for water.".into(),
        }
    }

    /// Handle and engine on two connections to the same database file.
    fn pair(
        clock: Arc<FixedClock>,
        tx: Option<mpsc::Sender<FiredNotification>>,
    ) -> (tempfile::TempDir, NotifierHandle, NotifierEngine) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifier.db");
        let handle = NotifierHandle::new(Connection::open(&path).unwrap(), clock.clone()).unwrap();
        let engine = NotifierEngine::new(
            Connection::open(&path).unwrap(),
            clock,
            Duration::from_millis(10),
            tx,
        )
        .unwrap();
        (dir, handle, engine)
    }

    #[tokio::test]
    async fn submit_requires_permission() {
        let clock = Arc::new(FixedClock::new(start()));
        let (_dir, handle, _engine) = pair(clock, None);
        let err = handle
            .submit_one_shot(&content(), start() + ChronoDuration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::PermissionDenied));
    }

    #[tokio::test]
    async fn submit_rejects_past_instants() {
        let clock = Arc::new(FixedClock::new(start()));
        let (_dir, handle, _engine) = pair(clock, None);
        handle.request_permission().await.unwrap();
        let err = handle.submit_one_shot(&content(), start()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(_)));
        assert!(handle.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_pending_and_rejects_unknown() {
        let clock = Arc::new(FixedClock::new(start()));
        let (_dir, handle, _engine) = pair(clock, None);
        handle.request_permission().await.unwrap();
        let h = handle
            .submit_one_shot(&content(), start() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(handle.list_pending().unwrap().len(), 1);

        handle.cancel_by_id(&h).await.unwrap();
        assert!(handle.list_pending().unwrap().is_empty());
        let err = handle.cancel_by_id(&h).await.unwrap_err();
        assert!(matches!(err, NotifyError::UnknownHandle { .. }));
    }

    #[tokio::test]
    async fn tick_fires_due_triggers_once() {
        let clock = Arc::new(FixedClock::new(start()));
        let (tx, mut rx) = mpsc::channel(8);
        let (_dir, handle, mut engine) = pair(clock.clone(), Some(tx));
        handle.request_permission().await.unwrap();
        let soon = handle
            .submit_one_shot(&content(), start() + ChronoDuration::minutes(5))
            .await
            .unwrap();
        let later = handle
            .submit_one_shot(&content(), start() + ChronoDuration::hours(5))
            .await
            .unwrap();

        assert_eq!(engine.tick().unwrap(), 0);
        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(engine.tick().unwrap(), 1);
        assert_eq!(engine.tick().unwrap(), 0);

        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.handle, soon);
        assert_eq!(fired.content, content());

        // The fired trigger can no longer be cancelled; the later one can.
        assert!(handle.cancel_by_id(&soon).await.is_err());
        handle.cancel_by_id(&later).await.unwrap();
    }

    #[tokio::test]
    async fn overdue_triggers_marked_missed() {
        let clock = Arc::new(FixedClock::new(start()));
        let (_dir, handle, mut engine) = pair(clock.clone(), None);
        handle.request_permission().await.unwrap();
        handle
            .submit_one_shot(&content(), start() + ChronoDuration::minutes(1))
            .await
            .unwrap();
        clock.advance(ChronoDuration::hours(1));
        assert_eq!(engine.mark_missed().unwrap(), 1);
        assert_eq!(engine.tick().unwrap(), 0);
        assert!(handle.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_drops_only_old_delivered_rows() {
        let clock = Arc::new(FixedClock::new(start()));
        let (_dir, handle, engine) = pair(clock.clone(), None);
        let mut engine = engine.with_retention(ChronoDuration::days(7));
        handle.request_permission().await.unwrap();
        for minutes in [5, 10] {
            handle
                .submit_one_shot(&content(), start() + ChronoDuration::minutes(minutes))
                .await
                .unwrap();
        }
        let far = handle
            .submit_one_shot(&content(), start() + ChronoDuration::days(20))
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(10));
        assert_eq!(engine.tick().unwrap(), 2);

        // Still inside the window.
        clock.advance(ChronoDuration::days(6));
        assert_eq!(engine.prune().unwrap(), 0);

        clock.advance(ChronoDuration::days(2));
        assert_eq!(engine.prune().unwrap(), 2);
        let pending = handle.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].handle, far);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let clock = Arc::new(FixedClock::new(start()));
        let (_dir, _handle, engine) = pair(clock, None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("engine should stop")
            .unwrap();
    }
}
