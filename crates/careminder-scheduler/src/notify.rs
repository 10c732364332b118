//! Boundary to the one-shot notification facility.

use async_trait::async_trait;
use careminder_core::{HandleId, ReminderContent};
use chrono::NaiveDateTime;

use crate::error::NotifyError;

/// Proof that notification permission was requested and granted.
///
/// Obtained once per process from [`NotificationFacility::request_permission`]
/// and handed to [`ReminderScheduler::new`](crate::scheduler::ReminderScheduler::new).
/// The scheduler never performs permission setup itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionGrant {
    _private: (),
}

impl PermissionGrant {
    /// For facility implementations, once the platform reports the grant.
    pub fn granted() -> Self {
        Self { _private: () }
    }
}

/// A facility that can only schedule non-repeating triggers.
///
/// Every call fails independently; there is no batch or transactional API,
/// so callers submit and cancel one handle at a time.
#[async_trait]
pub trait NotificationFacility: Send + Sync {
    /// Process-wide permission and presentation setup.
    async fn request_permission(&self) -> Result<PermissionGrant, NotifyError>;

    /// Schedule `content` to be delivered once at `at`. Returns the handle
    /// needed to cancel it.
    async fn submit_one_shot(
        &self,
        content: &ReminderContent,
        at: NaiveDateTime,
    ) -> Result<HandleId, NotifyError>;

    /// Cancel a pending trigger. Fails with [`NotifyError::UnknownHandle`]
    /// when the trigger already fired or was never issued.
    async fn cancel_by_id(&self, handle: &HandleId) -> Result<(), NotifyError>;
}
