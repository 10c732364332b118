//! Reminder categories and the notification content attached to each trigger.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a reminder is about. Selects the default notification wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Medication,
    Hydration,
    Nutrition,
}

impl Category {
    /// Notification title shown for every trigger of this category.
    pub fn title(&self) -> &'static str {
        match self {
            Category::Medication => "Medication Reminder",
            Category::Hydration => "Hydration Reminder",
            Category::Nutrition => "Nutrition Reminder",
        }
    }

    /// Default content for a reminder called `name`.
    pub fn default_content(&self, name: &str) -> ReminderContent {
        let body = match self {
            Category::Medication => format!("Time to take {name}."),
            Category::Hydration | Category::Nutrition => format!("Time for {name}."),
        };
        ReminderContent {
            title: self.title().to_string(),
            body,
        }
    }

    /// Medication reminders carry an explicit weekday choice; the other
    /// categories fire every day unless told otherwise.
    pub fn defaults_to_daily(&self) -> bool {
        !matches!(self, Category::Medication)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Medication => "medication",
            Category::Hydration => "hydration",
            Category::Nutrition => "nutrition",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "medication" | "med" => Ok(Category::Medication),
            "hydration" | "water" => Ok(Category::Hydration),
            "nutrition" | "meal" => Ok(Category::Nutrition),
            other => Err(format!("unknown reminder category: {other}")),
        }
    }
}

/// Payload delivered with each one-shot trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderContent {
    pub title: String,
    pub body: String,
}
