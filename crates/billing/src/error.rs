//! Billing error types.

/// Errors produced by the billing core.
///
/// The taxonomy matters operationally:
/// - `Validation` is rejected before any write and is never retried.
/// - `Gateway` is surfaced only after the bounded retry policy is exhausted;
///   cap mutations compensate (roll back) before returning it.
/// - `Consistency` blocks further cap mutations on the affected school until
///   reconciled.
/// - `ConcurrentModification` means an optimistic-lock miss; callers may
///   retry the whole operation.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Billing consistency violation: {0}")]
    Consistency(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),
}

impl BillingError {
    /// Whether a retry of the whole operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Gateway(_) | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BillingError::Gateway("timeout".into()).is_retryable());
        assert!(BillingError::ConcurrentModification("version".into()).is_retryable());
        assert!(!BillingError::Validation("cap too low".into()).is_retryable());
        assert!(!BillingError::Consistency("cap drift".into()).is_retryable());
    }
}
