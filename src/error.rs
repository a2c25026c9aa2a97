use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Missing required columns: {}", missing.join(", "))]
    Schema { missing: Vec<String> },

    #[error("No usable rows after normalization: {total_rows} rows read, {unparseable_dates} with unparseable dates, {missing_revenue} without recoverable revenue")]
    EmptyDataset {
        total_rows: usize,
        unparseable_dates: usize,
        missing_revenue: usize,
    },

    #[error("Insufficient history for a week-over-week comparison: {weeks} usable week(s), need at least 2")]
    InsufficientHistory { weeks: usize },

    #[error("Week-over-week change for {week} is undefined: the preceding week {previous_week} had zero revenue")]
    UndefinedChange {
        week: NaiveDate,
        previous_week: NaiveDate,
    },

    #[error("Invalid analysis configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Collaborator failed: {0}")]
    Collaborator(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReviewError>;
