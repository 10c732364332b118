//! `careminder-scheduler`: recurring reminders on top of a one-shot
//! notification facility.
//!
//! # Overview
//!
//! A reminder repeats at a time of day on a set of weekdays, but the
//! notification facility can only fire non-repeating triggers. The
//! [`scheduler::ReminderScheduler`] therefore expands each reminder into the
//! next few concrete occurrences (see [`schedule`]), submits one trigger per
//! occurrence, and records the returned handles on the reminder so that edits
//! and deletes cancel exactly that set.
//!
//! # Components
//!
//! | Module      | Role                                                       |
//! |-------------|------------------------------------------------------------|
//! | `schedule`  | Pure occurrence arithmetic and display labels              |
//! | `scheduler` | Create / update / refresh / delete with handle bookkeeping |
//! | `store`     | `ReminderStore` trait and its SQLite implementation        |
//! | `notify`    | `NotificationFacility` trait and permission grant          |
//! | `engine`    | Local SQLite-backed one-shot notifier and its poll loop    |
//!
//! Weekdays are numbered 1 = Sunday … 7 = Saturday.

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod notify;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{NotifierEngine, NotifierHandle};
pub use error::{NotifyError, Result, SchedulerError, StoreError};
pub use notify::{NotificationFacility, PermissionGrant};
pub use schedule::{format_relative, format_time, next_occurrence, next_occurrences};
pub use scheduler::{dashboard_upcoming, ReminderScheduler};
pub use store::{ReminderStore, SqliteReminderStore};
pub use types::{
    Occurrence, RecurrenceSpec, ReminderDraft, ReminderRecord, ScheduleOutcome, TimeOfDay,
    UpcomingReminder, WeekdaySet,
};
