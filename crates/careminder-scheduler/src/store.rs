use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use careminder_core::{Category, HandleId, ReminderContent, ReminderId};
use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, instrument, warn};

use crate::{
    db::init_db,
    error::StoreError,
    types::{RecurrenceSpec, ReminderRecord, TimeOfDay, WeekdaySet},
};

/// Durable home of reminder records.
///
/// A single `save` must be atomic at record level: either the whole record,
/// handle list included, is written or nothing is.
pub trait ReminderStore: Send + Sync {
    /// Insert or replace the record with this id.
    fn save(&self, record: &ReminderRecord) -> Result<(), StoreError>;

    /// Remove the record. Returns `false` when no such record existed.
    fn delete(&self, id: &ReminderId) -> Result<bool, StoreError>;

    /// All records in insertion order.
    fn query_all(&self) -> Result<Vec<ReminderRecord>, StoreError>;

    /// `Ok(None)` when no row exists; a row that cannot be decoded is
    /// [`StoreError::Corrupt`].
    fn get_by_id(&self, id: &ReminderId) -> Result<Option<ReminderRecord>, StoreError>;

    /// Take or extend the lease on `id` for `owner` until `ttl` from now.
    ///
    /// Returns `false` while another owner holds an unexpired lease. Leases
    /// serialize operations on one reminder across every process sharing
    /// the store.
    fn try_lease(&self, id: &ReminderId, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop `owner`'s lease on `id`. A lease held by someone else is left alone.
    fn release_lease(&self, id: &ReminderId, owner: &str) -> Result<(), StoreError>;
}

/// [`ReminderStore`] backed by the SQLite `reminders` table.
///
/// Wraps a single connection in a `Mutex`; every method is one statement, so
/// record-level atomicity comes from SQLite itself.
pub struct SqliteReminderStore {
    db: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "SELECT id, name, category, hour, minute, weekdays, content, handles,
            created_at, updated_at
     FROM reminders";

impl SqliteReminderStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Convenience for tests and one-off tools.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl ReminderStore for SqliteReminderStore {
    #[instrument(
        skip(self, record),
        fields(reminder_id = %record.id, handles = record.notification_handles.len())
    )]
    fn save(&self, record: &ReminderRecord) -> Result<(), StoreError> {
        let weekdays = serde_json::to_string(&record.recurrence.weekdays())?;
        let content = serde_json::to_string(&record.content)?;
        let handles = serde_json::to_string(&record.notification_handles)?;
        let time = record.recurrence.time();

        let db = self.conn()?;
        db.execute(
            "INSERT INTO reminders
             (id, name, category, hour, minute, weekdays, content, handles, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                hour = excluded.hour,
                minute = excluded.minute,
                weekdays = excluded.weekdays,
                content = excluded.content,
                handles = excluded.handles,
                updated_at = excluded.updated_at",
            rusqlite::params![
                record.id.as_str(),
                record.name,
                record.category.to_string(),
                time.hour(),
                time.minute(),
                weekdays,
                content,
                handles,
                record.created_at,
                record.updated_at,
            ],
        )?;
        debug!("reminder saved");
        Ok(())
    }

    #[instrument(skip(self), fields(reminder_id = %id))]
    fn delete(&self, id: &ReminderId) -> Result<bool, StoreError> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM reminders WHERE id = ?1", [id.as_str()])?;
        Ok(n > 0)
    }

    fn query_all(&self) -> Result<Vec<ReminderRecord>, StoreError> {
        let db = self.conn()?;
        // rowid follows insertion; upserts keep the original row.
        let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} ORDER BY rowid"))?;
        let rows = stmt.query_map([], read_row)?;
        let mut records = Vec::new();
        for row in rows {
            match decode(row?) {
                Ok(record) => records.push(record),
                Err(reason) => warn!(%reason, "skipping unreadable reminder row"),
            }
        }
        Ok(records)
    }

    #[instrument(skip(self), fields(reminder_id = %id))]
    fn get_by_id(&self, id: &ReminderId) -> Result<Option<ReminderRecord>, StoreError> {
        let db = self.conn()?;
        let row = match db.query_row(
            &format!("{SELECT_COLUMNS} WHERE id = ?1"),
            [id.as_str()],
            read_row,
        ) {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Database(e)),
        };
        match decode(row) {
            Ok(record) => Ok(Some(record)),
            Err(reason) => {
                warn!(%reason, "stored reminder is unreadable");
                Err(StoreError::Corrupt {
                    id: id.clone(),
                    reason,
                })
            }
        }
    }

    #[instrument(skip(self, ttl), fields(reminder_id = %id))]
    fn try_lease(&self, id: &ReminderId, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let db = self.conn()?;
        // One statement: insert, or take over only when the lease is ours or expired.
        let n = db.execute(
            "INSERT INTO reminder_leases (reminder_id, owner, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(reminder_id) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE reminder_leases.owner = excluded.owner
                OR reminder_leases.expires_at <= ?4",
            rusqlite::params![id.as_str(), owner, expires_at, now],
        )?;
        Ok(n > 0)
    }

    #[instrument(skip(self), fields(reminder_id = %id))]
    fn release_lease(&self, id: &ReminderId, owner: &str) -> Result<(), StoreError> {
        let db = self.conn()?;
        db.execute(
            "DELETE FROM reminder_leases WHERE reminder_id = ?1 AND owner = ?2",
            rusqlite::params![id.as_str(), owner],
        )?;
        debug!("lease released");
        Ok(())
    }
}

/// Raw column values of one `reminders` row.
struct RawRow {
    id: String,
    name: String,
    category: String,
    hour: u8,
    minute: u8,
    weekdays: String,
    content: String,
    handles: String,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        hour: row.get(3)?,
        minute: row.get(4)?,
        weekdays: row.get(5)?,
        content: row.get(6)?,
        handles: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn decode(raw: RawRow) -> Result<ReminderRecord, String> {
    let category: Category = raw.category.parse()?;
    let time = TimeOfDay::new(raw.hour, raw.minute).map_err(|e| e.to_string())?;
    let weekdays: WeekdaySet = serde_json::from_str(&raw.weekdays).map_err(|e| e.to_string())?;
    let recurrence = RecurrenceSpec::new(time, weekdays).map_err(|e| e.to_string())?;
    let content: ReminderContent =
        serde_json::from_str(&raw.content).map_err(|e| e.to_string())?;
    let notification_handles: Vec<HandleId> =
        serde_json::from_str(&raw.handles).map_err(|e| e.to_string())?;
    Ok(ReminderRecord {
        id: ReminderId::from(raw.id),
        name: raw.name,
        category,
        recurrence,
        content,
        notification_handles,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, handles: &[&str]) -> ReminderRecord {
        let recurrence = RecurrenceSpec::new(
            TimeOfDay::new(9, 30).unwrap(),
            WeekdaySet::new([2, 4]).unwrap(),
        )
        .unwrap();
        ReminderRecord {
            id: ReminderId::new(),
            name: name.to_string(),
            category: Category::Medication,
            recurrence,
            content: Category::Medication.default_content(name),
            notification_handles: handles.iter().map(|h| HandleId::from(*h)).collect(),
            created_at: "2024-01-07T10:00:00+00:00".to_string(),
            updated_at: "2024-01-07T10:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn save_then_get() {
        let store = SqliteReminderStore::open_in_memory().unwrap();
        let r = record("Aspirin", &["h1", "h2"]);
        store.save(&r).unwrap();
        assert_eq!(store.get_by_id(&r.id).unwrap(), Some(r));
    }

    #[test]
    fn save_replaces_handles_and_keeps_order() {
        let store = SqliteReminderStore::open_in_memory().unwrap();
        let first = record("First", &["a"]);
        let second = record("Second", &["b"]);
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        let mut edited = first.clone();
        edited.notification_handles = vec![HandleId::from("c"), HandleId::from("d")];
        edited.updated_at = "2024-01-08T10:00:00+00:00".to_string();
        store.save(&edited).unwrap();

        let all = store.query_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], edited, "upsert must not move the record");
        assert_eq!(all[1].name, "Second");
    }

    #[test]
    fn delete_reports_presence() {
        let store = SqliteReminderStore::open_in_memory().unwrap();
        let r = record("Zinc", &[]);
        store.save(&r).unwrap();
        assert!(store.delete(&r.id).unwrap());
        assert!(!store.delete(&r.id).unwrap());
        assert_eq!(store.get_by_id(&r.id).unwrap(), None);
    }

    #[test]
    fn unreadable_rows_are_skipped() {
        let store = SqliteReminderStore::open_in_memory().unwrap();
        store.save(&record("Good", &[])).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO reminders
                 VALUES ('bad', 'Bad', 'sleep', 9, 0, '[2]', '{}', '[]', 'x', 'x')",
                [],
            )
            .unwrap();
        let all = store.query_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Good");

        let err = store.get_by_id(&ReminderId::from("bad")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref id, .. } if id.as_str() == "bad"));
    }

    #[test]
    fn lease_excludes_other_owners_until_released() {
        let store = SqliteReminderStore::open_in_memory().unwrap();
        let id = ReminderId::from("r1");
        let ttl = Duration::from_secs(30);

        assert!(store.try_lease(&id, "a", ttl).unwrap());
        assert!(store.try_lease(&id, "a", ttl).unwrap(), "owner may extend");
        assert!(!store.try_lease(&id, "b", ttl).unwrap());

        store.release_lease(&id, "b").unwrap();
        assert!(!store.try_lease(&id, "b", ttl).unwrap(), "b cannot release a's lease");

        store.release_lease(&id, "a").unwrap();
        assert!(store.try_lease(&id, "b", ttl).unwrap());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let store = SqliteReminderStore::open_in_memory().unwrap();
        let id = ReminderId::from("r1");
        assert!(store.try_lease(&id, "crashed", Duration::ZERO).unwrap());
        assert!(store.try_lease(&id, "b", Duration::from_secs(30)).unwrap());
    }
}
