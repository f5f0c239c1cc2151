//! # Pipeline Error Types
//!
//! Structured error handling for the summarization pipeline using thiserror
//! instead of `Box<dyn Error>` patterns. The taxonomy distinguishes terminal
//! failures (drop the message) from retryable ones (requeue with a delay).

use thiserror::Error;

/// Errors surfaced by the pipeline components
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The queue payload can never become valid. Callers acknowledge (drop)
    /// these rather than requeue.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Terminal at the storage boundary: the record's date cannot be parsed.
    #[error("invalid date: {value}")]
    InvalidDate { value: String },

    /// Terminal at the storage boundary: the record is structurally unusable.
    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    /// A reduce dependency blob does not exist yet. Expected race, requeue.
    #[error("missing dependency blob: {locator}")]
    MissingDependency { locator: String },

    /// Failure reported by the generation service.
    #[error("upstream generation failure: {message}")]
    Upstream {
        message: String,
        status: Option<u16>,
        retryable: bool,
        retry_after_secs: Option<u64>,
    },

    /// Blob store failure (fetch, put, existence check).
    #[error("blob store error: {operation} on {locator}: {message}")]
    Blob {
        operation: String,
        locator: String,
        message: String,
    },

    /// Table store failure surfaced by the storage writer.
    #[error("table store error: {operation}: {message}")]
    Table { operation: String, message: String },

    /// Queue transport failure (receive, publish, delete, visibility).
    #[error("queue error: {operation}: {message}")]
    Queue { operation: String, message: String },

    /// Startup or environment configuration failure.
    #[error("configuration error: {component}: {message}")]
    Configuration { component: String, message: String },
}

impl PipelineError {
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub fn invalid_date(value: impl Into<String>) -> Self {
        Self::InvalidDate {
            value: value.into(),
        }
    }

    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }

    pub fn missing_dependency(locator: impl Into<String>) -> Self {
        Self::MissingDependency {
            locator: locator.into(),
        }
    }

    pub fn blob(
        operation: impl Into<String>,
        locator: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Blob {
            operation: operation.into(),
            locator: locator.into(),
            message: message.into(),
        }
    }

    pub fn table(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Table {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Queue {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the error can never succeed on retry and the message should be
    /// dropped instead of requeued.
    pub fn is_terminal_drop(&self) -> bool {
        matches!(self, Self::InvalidMessage { .. })
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PipelineError::table("query", "no rows found"),
            sqlx::Error::Database(db_err) => PipelineError::table("database", db_err.to_string()),
            sqlx::Error::PoolTimedOut => PipelineError::table("pool", "connection pool timed out"),
            sqlx::Error::Configuration(config_err) => {
                PipelineError::configuration("database", config_err.to_string())
            }
            other => PipelineError::table("connection", other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::invalid_message(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
