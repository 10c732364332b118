use thiserror::Error;

#[derive(Debug, Error)]
pub enum CareminderError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CareminderError {
    /// Short, stable error code for display layers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CareminderError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CareminderError>;
