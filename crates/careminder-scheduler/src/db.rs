use chrono::NaiveDateTime;
use rusqlite::Connection;

/// Local wall-clock timestamps are stored as fixed-width text so that string
/// comparison in SQL matches chronological order.
pub(crate) const LOCAL_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub(crate) fn format_local(ts: NaiveDateTime) -> String {
    ts.format(LOCAL_TS_FORMAT).to_string()
}

pub(crate) fn parse_local(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, LOCAL_TS_FORMAT).ok()
}

/// Initialise the careminder schema in `conn`.
///
/// Creates the `reminders` table used by the reminder store, the
/// `reminder_leases` table that serializes operations on one reminder across
/// processes, and the `triggers` table used by the local notifier (all
/// idempotent), plus an index on `triggers.fire_at` for the polling query.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reminders (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            category    TEXT    NOT NULL,
            hour        INTEGER NOT NULL,
            minute      INTEGER NOT NULL,
            weekdays    TEXT    NOT NULL,   -- JSON array of 1..=7 (1 = Sunday)
            content     TEXT    NOT NULL,   -- JSON {title, body}
            handles     TEXT    NOT NULL,   -- JSON array of trigger handles
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS reminder_leases (
            reminder_id TEXT    NOT NULL PRIMARY KEY,
            owner       TEXT    NOT NULL,
            expires_at  INTEGER NOT NULL    -- unix millis
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            id          TEXT    NOT NULL PRIMARY KEY,
            title       TEXT    NOT NULL,
            body        TEXT    NOT NULL,
            fire_at     TEXT    NOT NULL,   -- local time, LOCAL_TS_FORMAT
            status      TEXT    NOT NULL DEFAULT 'pending',
            created_at  TEXT    NOT NULL,
            fired_at    TEXT
        ) STRICT;

        -- Efficient polling: SELECT … WHERE status = 'pending' AND fire_at <= ?
        CREATE INDEX IF NOT EXISTS idx_triggers_fire_at ON triggers (status, fire_at);
        ",
    )?;
    Ok(())
}
