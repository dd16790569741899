//! Ledger error types

use thiserror::Error;

/// Ledger-specific errors
///
/// Expected business outcomes (insufficient funds, duplicate payment
/// references, invalid amounts) are NOT errors; they are variants of the
/// per-operation outcome enums. Everything here is an infrastructure or
/// configuration failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Could not resolve webhook event to a user: {0}")]
    UserResolutionFailed(String),

    #[error("Lock wait timed out for user {0}; retry")]
    LockTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<stripe::StripeError> for LedgerError {
    fn from(err: stripe::StripeError) -> Self {
        LedgerError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        // 55P03 = lock_not_available, raised when SET LOCAL lock_timeout fires
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("55P03") {
                return LedgerError::LockTimeout("row lock wait exceeded".to_string());
            }
        }
        LedgerError::Database(err.to_string())
    }
}

impl LedgerError {
    /// Whether the caller may safely retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::LockTimeout(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_is_the_only_retryable_error() {
        assert!(LedgerError::LockTimeout("row lock wait exceeded".into()).is_retryable());
        assert!(!LedgerError::Database("connection reset".into()).is_retryable());
        assert!(!LedgerError::WebhookSignatureInvalid.is_retryable());
        assert!(!LedgerError::InvalidInput("negative amount".into()).is_retryable());
    }
}
