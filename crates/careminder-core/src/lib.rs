//! `careminder-core`: types shared by every careminder crate.
//!
//! Holds configuration loading, the top-level error type, identifier
//! newtypes and the reminder category / notification content model.

pub mod config;
pub mod error;
pub mod reminder;
pub mod types;

pub use error::{CareminderError, Result};
pub use reminder::{Category, ReminderContent};
pub use types::{HandleId, ReminderId};
