use careminder_core::{CareminderError, HandleId, ReminderId};
use thiserror::Error;

/// Failures reported by a notification facility for a single call.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The process never obtained permission to post notifications.
    #[error("Notification permission denied")]
    PermissionDenied,

    /// The facility refused to schedule the trigger (e.g. instant in the past).
    #[error("Trigger rejected: {0}")]
    Rejected(String),

    /// No pending trigger with this handle; it already fired, expired, or was cancelled.
    #[error("Unknown trigger handle: {handle}")]
    UnknownHandle { handle: HandleId },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Notifier state lock poisoned")]
    LockPoisoned,
}

/// Failures of the persistent reminder store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Reminder store lock poisoned")]
    LockPoisoned,

    /// The row exists but cannot be decoded into a record.
    #[error("Stored reminder {id} is unreadable: {reason}")]
    Corrupt { id: ReminderId, reason: String },
}

/// Errors surfaced by [`ReminderScheduler`](crate::scheduler::ReminderScheduler) operations.
///
/// Individual submission and cancellation failures are not errors: they are
/// reported inside the operation outcome, because the operation still
/// completes and records what it could.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The draft was rejected before any trigger was submitted.
    #[error("Invalid reminder: {0}")]
    Validation(String),

    #[error("Reminder not found: {id}")]
    NotFound { id: ReminderId },

    /// Another scheduler, possibly in another process, kept the reminder's
    /// lease for longer than the wait allows.
    #[error("Reminder {id} is busy with another operation")]
    Busy { id: ReminderId },

    /// Triggers are live but the store write recording them failed.
    ///
    /// `live_handles` are outstanding with no durable record; the caller owns
    /// cancelling or re-recording them.
    #[error(
        "Failed to persist reminder {reminder_id}; {} live trigger(s) are unrecorded: {source}",
        .live_handles.len()
    )]
    Persistence {
        reminder_id: ReminderId,
        live_handles: Vec<HandleId>,
        #[source]
        source: StoreError,
    },

    /// A store read or delete failed; no triggers were left unrecorded.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CareminderError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// True when live triggers may exist that no stored record accounts for.
    pub fn has_orphaned_triggers(&self) -> bool {
        matches!(self, SchedulerError::Persistence { live_handles, .. } if !live_handles.is_empty())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
