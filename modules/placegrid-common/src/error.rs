use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("Invalid area: {0}")]
    InvalidArea(String),

    #[error("Invalid search term: {0:?}")]
    InvalidSearchTerm(String),

    #[error("Result cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Budget state unreadable: {0}")]
    BudgetPersistence(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Geocoding error: {0}")]
    Geocoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlannerError>;
