use std::fmt;
use serde::{Deserialize, Serialize};

/// Main error type for the billing engine.
///
/// Variants mirror the error taxonomy the engine is specified against:
/// each one surfaces through a distinct propagation policy (fail fast,
/// return the prior outcome, or get swallowed and retried by a worker).
#[derive(Debug)]
pub enum Error {
    /// Malformed input, unknown enum, out-of-range number, currency mismatch.
    Validation(String),

    /// Referenced entity missing.
    NotFound(String),

    /// Subscription/invoice/payment cannot make the requested transition.
    IllegalStateTransition(String),

    /// Duplicate email, duplicate idempotency-key replay, duplicate period.
    /// Callers should treat this as "here is the prior outcome", not a hard failure.
    Conflict(String),

    /// Write rejected because the owning account is blocked.
    AccountBlocked(String),

    /// Gateway/tax/webhook timeout or 5xx. Never surfaced as success; the
    /// caller (a worker) is expected to retry per its own schedule.
    ExternalTransient(String),

    /// Card declined, tax API returned a definitive error. A domain
    /// outcome (e.g. payment.failed), not a bug.
    ExternalPermanent(String),

    /// Invariant violation or database error. Logged with full context.
    Internal(String),

    /// Database errors (sqlx wrapped), folded into `Internal` at the
    /// `Display`/`category` boundary but kept distinct for `source()`.
    Database(sqlx::Error),

    /// Configuration errors, surfaced at process start.
    Config(String),

    /// Serialization errors.
    Serialization(serde_json::Error),

    /// IO errors.
    Io(std::io::Error),
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::IllegalStateTransition(msg) => write!(f, "illegal state transition: {}", msg),
            Error::Conflict(msg) => write!(f, "conflict: {}", msg),
            Error::AccountBlocked(msg) => write!(f, "account blocked: {}", msg),
            Error::ExternalTransient(msg) => write!(f, "external transient error: {}", msg),
            Error::ExternalPermanent(msg) => write!(f, "external error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Database(e) => write!(f, "database error: {}", e),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Serialization(e) => write!(f, "serialization error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            Error::ExternalTransient(error.to_string())
        } else {
            Error::ExternalPermanent(error.to_string())
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Validation(format!("invalid uuid: {}", error))
    }
}

impl Error {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn illegal_state<T: Into<String>>(msg: T) -> Self {
        Error::IllegalStateTransition(msg.into())
    }

    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn account_blocked<T: Into<String>>(msg: T) -> Self {
        Error::AccountBlocked(msg.into())
    }

    pub fn external_transient<T: Into<String>>(msg: T) -> Self {
        Error::ExternalTransient(msg.into())
    }

    pub fn external_permanent<T: Into<String>>(msg: T) -> Self {
        Error::ExternalPermanent(msg.into())
    }

    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Error::Internal(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// HTTP-flavoured status for whatever thin edge ends up wrapping this crate.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::IllegalStateTransition(_) => 409,
            Error::Conflict(_) => 409,
            Error::AccountBlocked(_) => 403,
            Error::ExternalTransient(_) => 503,
            Error::ExternalPermanent(_) => 502,
            Error::Internal(_) => 500,
            Error::Database(_) => 500,
            Error::Config(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
        }
    }

    /// Taxonomy name, stable across renames of the Display message, for monitoring.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::IllegalStateTransition(_) => "illegal_state_transition",
            Error::Conflict(_) => "conflict",
            Error::AccountBlocked(_) => "account_blocked",
            Error::ExternalTransient(_) => "external_transient",
            Error::ExternalPermanent(_) => "external_permanent",
            Error::Internal(_) => "internal",
            Error::Database(_) => "internal",
            Error::Config(_) => "internal",
            Error::Serialization(_) => "internal",
            Error::Io(_) => "internal",
        }
    }

    /// Whether the calling worker should requeue this operation for a later retry
    /// rather than record a terminal domain failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ExternalTransient(_))
    }
}

/// Detailed field-level validation errors, for callers that want more than
/// a single message string (e.g. request DTO validation).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_error(self) -> Error {
        Error::Validation(
            serde_json::to_string(&self).unwrap_or_else(|_| "validation failed".to_string()),
        )
    }
}
