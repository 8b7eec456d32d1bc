//! Error types for parcelflow.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Outbound channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Failed to deliver to conversation {conversation_id}: {reason}")]
    DeliveryFailed {
        conversation_id: i64,
        reason: String,
    },

    #[error("Invalid outbound message: {0}")]
    InvalidMessage(String),

    #[error("Webhook server failed to start: {reason}")]
    StartupFailed { reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Conversation-flow errors.
///
/// `Validation` is the re-prompt path: the session does not advance and the
/// user is asked again. `External` reverts the flow to the failed step's
/// predecessor. Both are expected during normal operation.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Invalid input for step {step}: {message}")]
    Validation { step: String, message: String },

    #[error("External service failed at step {step}: {reason}")]
    External { step: String, reason: String },

    #[error("Unknown step name: {0}")]
    UnknownStep(String),

    #[error("Event {event} not accepted at step {step}")]
    UnexpectedEvent { step: String, event: String },
}

/// Payment-processing errors.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Invoice creation failed: {reason}")]
    InvoiceFailed { reason: String },

    #[error("Unknown payment status: {0}")]
    UnknownStatus(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the operation that produced this error is worth retrying.
    ///
    /// Durable-state errors fail closed and are not retried here; transport
    /// errors and rate limits are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Channel(ChannelError::RateLimited { .. }) => true,
            Self::Channel(ChannelError::DeliveryFailed { .. }) => true,
            Self::Channel(ChannelError::Http(_)) => true,
            Self::Payment(PaymentError::Http(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable() {
        let err = Error::from(ChannelError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = Error::from(FlowError::Validation {
            step: "from_zip".to_string(),
            message: "expected a 5-digit zip".to_string(),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn database_errors_fail_closed() {
        let err = Error::from(DatabaseError::Query("locked".to_string()));
        assert!(!err.is_retryable());
    }
}
