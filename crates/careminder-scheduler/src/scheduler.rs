//! Keeps each reminder's recorded trigger handles in step with the
//! notification facility.
//!
//! Every mutation is a two-phase replace: cancel the recorded handles first,
//! then submit a fresh batch, then persist the record with the new handle
//! list. Submitting before cancelling would open a window in which both
//! batches could fire.

use std::sync::Arc;
use std::time::Duration;

use careminder_core::{config::SchedulerConfig, HandleId, ReminderContent, ReminderId};
use chrono::{NaiveDateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    notify::{NotificationFacility, PermissionGrant},
    schedule::{next_occurrence, next_occurrences},
    store::ReminderStore,
    types::{
        CancellationFailure, DeleteOutcome, Occurrence, RecurrenceSpec, ReminderDraft,
        ReminderRecord, ScheduleOutcome, SubmissionFailure, UpcomingReminder,
    },
};

/// Coordinates the occurrence calculator, the notification facility and the
/// reminder store.
///
/// Cheap to clone; clones share the same collaborators and per-reminder locks.
/// Operations on one reminder id are serialized, across processes too, through
/// a lease in the store; different ids proceed concurrently.
#[derive(Clone)]
pub struct ReminderScheduler {
    inner: Arc<Inner>,
}

/// Lifetime of a record lease. A crashed holder blocks others at most this long.
const LEASE_TTL: Duration = Duration::from_secs(60);
/// Pause between attempts to take a lease held elsewhere.
const LEASE_RETRY: Duration = Duration::from_millis(5);
/// Give up on a contended lease after this long.
const LEASE_WAIT: Duration = Duration::from_secs(90);

struct Inner {
    store: Arc<dyn ReminderStore>,
    notifier: Arc<dyn NotificationFacility>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// In-process queue per record, so local callers do not poll the lease.
    locks: DashMap<ReminderId, Arc<Mutex<()>>>,
    /// Lease owner name of this scheduler instance.
    owner: String,
}

/// Exclusive hold on one record: the local mutex plus, once taken, the store
/// lease. Dropping it releases both and prunes the idle local mutex.
struct RecordLock<'a> {
    inner: &'a Inner,
    id: ReminderId,
    local: Option<OwnedMutexGuard<()>>,
    leased: bool,
}

impl Drop for RecordLock<'_> {
    fn drop(&mut self) {
        if self.leased {
            if let Err(e) = self.inner.store.release_lease(&self.id, &self.inner.owner) {
                // The lease expires on its own after LEASE_TTL.
                warn!(reminder_id = %self.id, error = %e, "lease release failed");
            }
        }
        self.local.take();
        // Only the map still holds the mutex once nobody waits on it.
        self.inner
            .locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ReminderScheduler {
    /// `grant` proves notification permission was set up beforehand.
    pub fn new(
        store: Arc<dyn ReminderStore>,
        notifier: Arc<dyn NotificationFacility>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        grant: PermissionGrant,
    ) -> Result<Self> {
        config.validate()?;
        let owner = Uuid::new_v4().to_string();
        debug!(
            ?grant,
            %owner,
            max = config.max_occurrences,
            horizon_days = config.horizon_days,
            "reminder scheduler ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                notifier,
                clock,
                config,
                locks: DashMap::new(),
                owner,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Create a reminder and submit triggers for its next occurrences.
    ///
    /// Submission failures do not abort the batch: whatever handles were
    /// obtained are recorded, and the failures are listed in the outcome.
    pub async fn create(&self, draft: ReminderDraft) -> Result<ScheduleOutcome> {
        draft.validate()?;
        let inner = self.inner.clone();
        run_detached(async move { inner.insert(draft).await }).await
    }

    /// Replace a reminder's definition and its whole trigger batch.
    ///
    /// The handles cancelled are the ones currently stored for `id`, not those
    /// of any copy the caller holds, so a stale copy cannot leak triggers.
    pub async fn update(&self, id: &ReminderId, draft: ReminderDraft) -> Result<ScheduleOutcome> {
        draft.validate()?;
        let id = id.clone();
        let inner = self.inner.clone();
        run_detached(async move { inner.reschedule(id, Some(draft)).await }).await
    }

    /// Re-materialise the trigger horizon of one reminder with its current
    /// definition.
    pub async fn refresh(&self, id: &ReminderId) -> Result<ScheduleOutcome> {
        let id = id.clone();
        let inner = self.inner.clone();
        run_detached(async move { inner.reschedule(id, None).await }).await
    }

    /// Refresh every stored reminder. One reminder failing does not stop the
    /// others; results are returned per id in store order.
    pub async fn refresh_all(&self) -> Result<Vec<(ReminderId, Result<ScheduleOutcome>)>> {
        let records = self.inner.store.query_all()?;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = self.refresh(&record.id).await;
            if let Err(ref e) = result {
                warn!(reminder_id = %record.id, error = %e, "refresh failed");
            }
            results.push((record.id, result));
        }
        Ok(results)
    }

    /// Cancel every recorded trigger, then remove the reminder.
    pub async fn delete(&self, id: &ReminderId) -> Result<DeleteOutcome> {
        let id = id.clone();
        let inner = self.inner.clone();
        run_detached(async move { inner.remove(id).await }).await
    }

    pub fn get(&self, id: &ReminderId) -> Result<Option<ReminderRecord>> {
        Ok(self.inner.store.get_by_id(id)?)
    }

    pub fn list(&self) -> Result<Vec<ReminderRecord>> {
        Ok(self.inner.store.query_all()?)
    }

    /// The next `dashboard_limit` reminders to fire, soonest first.
    pub fn upcoming(&self) -> Result<Vec<UpcomingReminder>> {
        let records = self.inner.store.query_all()?;
        Ok(dashboard_upcoming(
            records,
            self.inner.clock.now(),
            self.inner.config.dashboard_limit,
        ))
    }

    /// Every reminder with a future occurrence, soonest first.
    pub fn list_upcoming(&self) -> Result<Vec<UpcomingReminder>> {
        let records = self.inner.store.query_all()?;
        Ok(dashboard_upcoming(records, self.inner.clock.now(), usize::MAX))
    }
}

/// Pair each record with its next occurrence after `now`, drop records with
/// none, and return the `limit` soonest. Equal instants keep input order.
pub fn dashboard_upcoming(
    records: Vec<ReminderRecord>,
    now: NaiveDateTime,
    limit: usize,
) -> Vec<UpcomingReminder> {
    let mut upcoming: Vec<UpcomingReminder> = records
        .into_iter()
        .filter_map(|record| {
            next_occurrence(&record.recurrence, now)
                .map(|occurrence| UpcomingReminder { record, occurrence })
        })
        .collect();
    // Stable sort keeps insertion order for ties.
    upcoming.sort_by_key(|u| u.occurrence);
    upcoming.truncate(limit);
    upcoming
}

/// Run `fut` on its own task so that a caller dropping the returned future
/// (e.g. on timeout) cannot interrupt a half-submitted batch before its
/// handles are recorded.
async fn run_detached<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| SchedulerError::Internal(format!("scheduler task failed: {e}")))?
}

impl Inner {
    /// Wait for the local mutex, then for the store lease on `id`.
    async fn lock(&self, id: &ReminderId) -> Result<RecordLock<'_>> {
        let local = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let mut guard = RecordLock {
            inner: self,
            id: id.clone(),
            local: Some(local.lock_owned().await),
            leased: false,
        };

        let deadline = tokio::time::Instant::now() + LEASE_WAIT;
        while !self.store.try_lease(id, &self.owner, LEASE_TTL)? {
            if tokio::time::Instant::now() >= deadline {
                warn!(reminder_id = %id, "gave up waiting for reminder lease");
                return Err(SchedulerError::Busy { id: id.clone() });
            }
            tokio::time::sleep(LEASE_RETRY).await;
        }
        guard.leased = true;
        Ok(guard)
    }

    async fn insert(&self, draft: ReminderDraft) -> Result<ScheduleOutcome> {
        let (name, content) = draft.validate()?;
        let id = ReminderId::new();
        let _guard = self.lock(&id).await?;
        let now = self.clock.now();
        let (handles, submission_failures) =
            self.submit_batch(&id, &draft.recurrence, &content, now).await;
        let stamp = Utc::now().to_rfc3339();
        let record = ReminderRecord {
            id,
            name,
            category: draft.category,
            recurrence: draft.recurrence,
            content,
            notification_handles: handles,
            created_at: stamp.clone(),
            updated_at: stamp,
        };
        self.persist(&record)?;
        info!(
            reminder_id = %record.id,
            name = %record.name,
            triggers = record.notification_handles.len(),
            failed = submission_failures.len(),
            "reminder created"
        );
        Ok(ScheduleOutcome {
            record,
            submission_failures,
            cancellation_failures: Vec::new(),
        })
    }

    async fn remove(&self, id: ReminderId) -> Result<DeleteOutcome> {
        let guard = self.lock(&id).await?;
        let record = self
            .store
            .get_by_id(&id)?
            .ok_or_else(|| SchedulerError::NotFound { id: id.clone() })?;

        let total = record.notification_handles.len();
        let cancellation_failures = self
            .cancel_handles(&id, &record.notification_handles)
            .await;

        // Only after every handle had its cancellation attempt.
        self.store.delete(&id)?;
        drop(guard);

        let cancelled = total - cancellation_failures.len();
        info!(
            reminder_id = %id,
            cancelled,
            failed = cancellation_failures.len(),
            "reminder deleted"
        );
        Ok(DeleteOutcome {
            id,
            cancelled,
            cancellation_failures,
        })
    }

    /// Update (`draft = Some`) or refresh (`draft = None`) under the record lock.
    #[instrument(skip(self, draft), fields(reminder_id = %id))]
    async fn reschedule(
        &self,
        id: ReminderId,
        draft: Option<ReminderDraft>,
    ) -> Result<ScheduleOutcome> {
        let _guard = self.lock(&id).await?;
        let existing = self
            .store
            .get_by_id(&id)?
            .ok_or_else(|| SchedulerError::NotFound { id: id.clone() })?;
        let draft = draft.unwrap_or_else(|| ReminderDraft::from_record(&existing));
        let (name, content) = draft.validate()?;

        // Phase 1: cancel. Failed handles are still dropped; they are no longer actionable.
        let cancellation_failures = self
            .cancel_handles(&id, &existing.notification_handles)
            .await;

        // Phase 2: submit the fresh batch.
        let now = self.clock.now();
        let (handles, submission_failures) = self
            .submit_batch(&id, &draft.recurrence, &content, now)
            .await;

        let record = ReminderRecord {
            id,
            name,
            category: draft.category,
            recurrence: draft.recurrence,
            content,
            notification_handles: handles,
            created_at: existing.created_at,
            updated_at: Utc::now().to_rfc3339(),
        };
        self.persist(&record)?;
        info!(
            triggers = record.notification_handles.len(),
            replaced = existing.notification_handles.len(),
            failed = submission_failures.len(),
            "reminder rescheduled"
        );
        Ok(ScheduleOutcome {
            record,
            submission_failures,
            cancellation_failures,
        })
    }

    /// Submit one trigger per upcoming occurrence of `recurrence`.
    ///
    /// Handles are returned in occurrence order; failures never discard
    /// handles already obtained.
    async fn submit_batch(
        &self,
        id: &ReminderId,
        recurrence: &RecurrenceSpec,
        content: &ReminderContent,
        now: NaiveDateTime,
    ) -> (Vec<HandleId>, Vec<SubmissionFailure>) {
        let occurrences: Vec<Occurrence> = next_occurrences(
            recurrence,
            now,
            self.config.max_occurrences,
            self.config.horizon_days,
        );
        let mut handles = Vec::with_capacity(occurrences.len());
        let mut failures = Vec::new();
        for occurrence in occurrences {
            match self.notifier.submit_one_shot(content, occurrence).await {
                Ok(handle) => {
                    debug!(reminder_id = %id, %handle, at = %occurrence, "trigger submitted");
                    handles.push(handle);
                }
                Err(error) => {
                    warn!(reminder_id = %id, at = %occurrence, %error, "trigger submission failed");
                    failures.push(SubmissionFailure { occurrence, error });
                }
            }
        }
        (handles, failures)
    }

    /// Best-effort cancel of every handle. Returns the ones that failed.
    async fn cancel_handles(
        &self,
        id: &ReminderId,
        handles: &[HandleId],
    ) -> Vec<CancellationFailure> {
        let mut failures = Vec::new();
        for handle in handles {
            match self.notifier.cancel_by_id(handle).await {
                Ok(()) => debug!(reminder_id = %id, %handle, "trigger cancelled"),
                Err(error) => {
                    warn!(
                        reminder_id = %id,
                        %handle,
                        %error,
                        "stale trigger could not be cancelled; dropping it"
                    );
                    failures.push(CancellationFailure {
                        handle: handle.clone(),
                        error,
                    });
                }
            }
        }
        failures
    }

    fn persist(&self, record: &ReminderRecord) -> Result<()> {
        self.store.save(record).map_err(|source| {
            error!(
                reminder_id = %record.id,
                live = record.notification_handles.len(),
                error = %source,
                "reminder not persisted; live triggers are unrecorded"
            );
            SchedulerError::Persistence {
                reminder_id: record.id.clone(),
                live_handles: record.notification_handles.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use careminder_core::Category;
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        clock::FixedClock,
        error::NotifyError,
        store::SqliteReminderStore,
        types::{RecurrenceSpec, TimeOfDay},
    };

    /// Accepts everything and numbers its handles.
    #[derive(Default)]
    struct CountingFacility {
        submitted: AtomicUsize,
    }

    #[async_trait]
    impl NotificationFacility for CountingFacility {
        async fn request_permission(&self) -> std::result::Result<PermissionGrant, NotifyError> {
            Ok(PermissionGrant::granted())
        }

        async fn submit_one_shot(
            &self,
            _content: &ReminderContent,
            _at: NaiveDateTime,
        ) -> std::result::Result<HandleId, NotifyError> {
            let n = self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(HandleId::from(format!("h{n}")))
        }

        async fn cancel_by_id(&self, _handle: &HandleId) -> std::result::Result<(), NotifyError> {
            Ok(())
        }
    }

    fn setup() -> (ReminderScheduler, Arc<SqliteReminderStore>) {
        let store = Arc::new(SqliteReminderStore::open_in_memory().unwrap());
        let now = NaiveDate::from_ymd_opt(2024, 1, 7)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let scheduler = ReminderScheduler::new(
            store.clone(),
            Arc::new(CountingFacility::default()),
            Arc::new(FixedClock::new(now)),
            SchedulerConfig::default(),
            PermissionGrant::granted(),
        )
        .unwrap();
        (scheduler, store)
    }

    fn draft() -> ReminderDraft {
        let recurrence = RecurrenceSpec::daily(TimeOfDay::new(9, 0).unwrap());
        ReminderDraft::new("Water", Category::Hydration, recurrence)
    }

    #[tokio::test]
    async fn unknown_ids_leave_no_lock_behind() {
        let (scheduler, _store) = setup();
        let id = ReminderId::from("missing");
        for _ in 0..3 {
            let refreshed = scheduler.refresh(&id).await;
            assert!(matches!(refreshed, Err(SchedulerError::NotFound { .. })));
            let updated = scheduler.update(&id, draft()).await;
            assert!(matches!(updated, Err(SchedulerError::NotFound { .. })));
            let deleted = scheduler.delete(&id).await;
            assert!(matches!(deleted, Err(SchedulerError::NotFound { .. })));
        }
        assert!(scheduler.inner.locks.is_empty());
    }

    #[tokio::test]
    async fn lease_is_released_after_each_operation() {
        let (scheduler, store) = setup();
        let id = scheduler.create(draft()).await.unwrap().record.id;
        scheduler.refresh(&id).await.unwrap();

        assert!(scheduler.inner.locks.is_empty());
        assert!(store.try_lease(&id, "someone-else", LEASE_TTL).unwrap());
    }

    #[tokio::test]
    async fn operation_waits_for_a_lease_held_elsewhere() {
        let (scheduler, store) = setup();
        let id = scheduler.create(draft()).await.unwrap().record.id;

        assert!(store
            .try_lease(&id, "other-process", Duration::from_millis(80))
            .unwrap());
        let started = std::time::Instant::now();
        scheduler.refresh(&id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
