use std::fmt;

use careminder_core::{Category, HandleId, ReminderContent, ReminderId};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, SchedulerError};

/// A concrete local wall-clock instant at which a reminder fires.
pub type Occurrence = NaiveDateTime;

/// Hour and minute a reminder fires at. Always in range once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawTimeOfDay")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

#[derive(Deserialize)]
struct RawTimeOfDay {
    hour: u8,
    minute: u8,
}

impl TryFrom<RawTimeOfDay> for TimeOfDay {
    type Error = String;

    fn try_from(raw: RawTimeOfDay) -> std::result::Result<Self, Self::Error> {
        TimeOfDay::new(raw.hour, raw.minute).map_err(|e| e.to_string())
    }
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self, SchedulerError> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::Validation(format!(
                "time {hour:02}:{minute:02} is out of range"
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    /// The time with seconds and sub-seconds zeroed.
    pub fn to_naive(&self) -> NaiveTime {
        // Range is checked at construction.
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Parses `"HH:MM"` (24-hour).
impl std::str::FromStr for TimeOfDay {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| SchedulerError::Validation(format!("expected HH:MM, got '{s}'")))?;
        let hour = h
            .parse()
            .map_err(|_| SchedulerError::Validation(format!("invalid hour in '{s}'")))?;
        let minute = m
            .parse()
            .map_err(|_| SchedulerError::Validation(format!("invalid minute in '{s}'")))?;
        TimeOfDay::new(hour, minute)
    }
}

const DAY_ABBREVIATIONS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Weekday number of `date`: 1 = Sunday … 7 = Saturday.
pub fn weekday_number(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8 + 1
}

/// Set of weekdays numbered 1 = Sunday … 7 = Saturday.
///
/// Bit `n` is set when weekday `n` is a member; bit 0 is never used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    const ALL: u8 = 0b1111_1110;
    const WEEKDAYS: u8 = 0b0111_1100;
    const WEEKENDS: u8 = 0b1000_0010;

    pub fn every_day() -> Self {
        Self(Self::ALL)
    }

    pub fn new<I: IntoIterator<Item = u8>>(days: I) -> Result<Self, SchedulerError> {
        let mut bits = 0u8;
        for day in days {
            if !(1..=7).contains(&day) {
                return Err(SchedulerError::Validation(format!(
                    "weekday {day} is out of range 1..=7"
                )));
            }
            bits |= 1 << day;
        }
        Ok(Self(bits))
    }

    pub fn contains(&self, day: u8) -> bool {
        (1..=7).contains(&day) && self.0 & (1 << day) != 0
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.contains(weekday_number(date))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=7u8).filter(move |d| self.contains(*d))
    }

    /// Short human description: "Daily", "Weekdays", "Weekends" or a day list.
    pub fn summary(&self) -> String {
        match self.0 {
            Self::ALL => "Daily".to_string(),
            Self::WEEKDAYS => "Weekdays".to_string(),
            Self::WEEKENDS => "Weekends".to_string(),
            0 => "Never".to_string(),
            _ => self
                .iter()
                .map(|d| DAY_ABBREVIATIONS[(d - 1) as usize])
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl TryFrom<Vec<u8>> for WeekdaySet {
    type Error = String;

    fn try_from(days: Vec<u8>) -> std::result::Result<Self, Self::Error> {
        WeekdaySet::new(days).map_err(|e| e.to_string())
    }
}

impl From<WeekdaySet> for Vec<u8> {
    fn from(set: WeekdaySet) -> Self {
        set.iter().collect()
    }
}

/// Parses `"daily"`, `"weekdays"`, `"weekends"`, or a comma-separated list
/// of day names (`"mon,wed"`) or numbers (`"2,4"`).
impl std::str::FromStr for WeekdaySet {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "every day" | "all" => return Ok(Self::every_day()),
            "weekdays" => return Ok(Self(Self::WEEKDAYS)),
            "weekends" => return Ok(Self(Self::WEEKENDS)),
            _ => {}
        }
        let mut days = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let lower = part.to_ascii_lowercase();
            let day = match DAY_ABBREVIATIONS
                .iter()
                .position(|abbr| lower.starts_with(&abbr.to_ascii_lowercase()))
            {
                Some(idx) => idx as u8 + 1,
                None => lower
                    .parse()
                    .map_err(|_| SchedulerError::Validation(format!("unknown weekday '{part}'")))?,
            };
            days.push(day);
        }
        WeekdaySet::new(days)
    }
}

/// When a reminder repeats: a time of day on a set of weekdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceSpec {
    pub(crate) time: TimeOfDay,
    pub(crate) weekdays: WeekdaySet,
}

impl RecurrenceSpec {
    /// Rejects an empty weekday set.
    pub fn new(time: TimeOfDay, weekdays: WeekdaySet) -> Result<Self, SchedulerError> {
        if weekdays.is_empty() {
            return Err(SchedulerError::Validation(
                "at least one weekday is required".to_string(),
            ));
        }
        Ok(Self { time, weekdays })
    }

    pub fn daily(time: TimeOfDay) -> Self {
        Self {
            time,
            weekdays: WeekdaySet::every_day(),
        }
    }

    pub fn time(&self) -> TimeOfDay {
        self.time
    }

    pub fn weekdays(&self) -> WeekdaySet {
        self.weekdays
    }
}

impl fmt::Display for RecurrenceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.time, self.weekdays.summary())
    }
}

/// A persisted reminder together with the triggers implementing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub id: ReminderId,
    pub name: String,
    pub category: Category,
    pub recurrence: RecurrenceSpec,
    pub content: ReminderContent,
    /// Handles of the outstanding one-shot triggers, in firing order.
    pub notification_handles: Vec<HandleId>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    /// RFC3339 timestamp of the last create/update/refresh.
    pub updated_at: String,
}

/// User input for creating or editing a reminder.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderDraft {
    pub name: String,
    pub category: Category,
    pub recurrence: RecurrenceSpec,
    /// Overrides the category's default content when set.
    pub content: Option<ReminderContent>,
}

impl ReminderDraft {
    pub fn new(name: impl Into<String>, category: Category, recurrence: RecurrenceSpec) -> Self {
        Self {
            name: name.into(),
            category,
            recurrence,
            content: None,
        }
    }

    pub fn with_content(mut self, content: ReminderContent) -> Self {
        self.content = Some(content);
        self
    }

    /// Draft reproducing an existing record's definition.
    pub fn from_record(record: &ReminderRecord) -> Self {
        Self {
            name: record.name.clone(),
            category: record.category,
            recurrence: record.recurrence,
            content: Some(record.content.clone()),
        }
    }

    /// Check the draft and return the trimmed name and the effective content.
    pub fn validate(&self) -> Result<(String, ReminderContent), SchedulerError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SchedulerError::Validation(
                "reminder name must not be empty".to_string(),
            ));
        }
        if self.recurrence.weekdays.is_empty() {
            return Err(SchedulerError::Validation(
                "at least one weekday is required".to_string(),
            ));
        }
        let content = self
            .content
            .clone()
            .unwrap_or_else(|| self.category.default_content(name));
        Ok((name.to_string(), content))
    }
}

/// One occurrence the facility refused to schedule.
#[derive(Debug)]
pub struct SubmissionFailure {
    pub occurrence: Occurrence,
    pub error: NotifyError,
}

/// One stale handle the facility could not cancel. The handle has still been
/// dropped from the record.
#[derive(Debug)]
pub struct CancellationFailure {
    pub handle: HandleId,
    pub error: NotifyError,
}

/// Result of a create, update or refresh that reached the store.
#[derive(Debug)]
pub struct ScheduleOutcome {
    /// The record as persisted.
    pub record: ReminderRecord,
    /// Occurrences that have no trigger because submission failed.
    pub submission_failures: Vec<SubmissionFailure>,
    /// Stale handles whose cancellation failed (update/refresh only).
    pub cancellation_failures: Vec<CancellationFailure>,
}

impl ScheduleOutcome {
    /// Every computed occurrence got a trigger.
    pub fn is_complete(&self) -> bool {
        self.submission_failures.is_empty()
    }
}

/// Result of a delete.
#[derive(Debug)]
pub struct DeleteOutcome {
    pub id: ReminderId,
    /// Handles cancelled successfully.
    pub cancelled: usize,
    pub cancellation_failures: Vec<CancellationFailure>,
}

/// A reminder paired with its next occurrence, for upcoming-reminder lists.
#[derive(Debug, Clone, PartialEq)]
pub struct UpcomingReminder {
    pub record: ReminderRecord,
    pub occurrence: Occurrence,
}

/// Lifecycle state of a one-shot trigger in the local notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Waiting for its fire time.
    Pending,
    /// Delivered.
    Fired,
    /// Its fire time passed while the notifier was not running.
    Missed,
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerStatus::Pending => "pending",
            TriggerStatus::Fired => "fired",
            TriggerStatus::Missed => "missed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TriggerStatus::Pending),
            "fired" => Ok(TriggerStatus::Fired),
            "missed" => Ok(TriggerStatus::Missed),
            other => Err(format!("unknown trigger status: {other}")),
        }
    }
}

/// A one-shot trigger as stored by the local notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub handle: HandleId,
    pub content: ReminderContent,
    pub fire_at: NaiveDateTime,
    pub status: TriggerStatus,
}

/// A trigger delivered by the local notifier engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredNotification {
    pub handle: HandleId,
    pub content: ReminderContent,
    pub fire_at: NaiveDateTime,
    pub fired_at: NaiveDateTime,
}
