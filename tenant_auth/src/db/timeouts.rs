//! Database query timeout helpers
//!
//! Every store call is bounded so an unresponsive database surfaces as
//! `AuthError::StoreUnavailable` instead of a hung request.

use std::time::Duration;
use tokio::time::timeout;

use crate::errors::AuthError;

/// Default timeout for single statements (5 seconds)
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for sweeps over many rows (30 seconds)
pub const LONG_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for timeout operations
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    /// Operation timed out
    #[error("Database operation timed out after {0:?}")]
    Timeout(Duration),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<TimeoutError> for AuthError {
    fn from(err: TimeoutError) -> Self {
        match err {
            TimeoutError::Timeout(_) => AuthError::StoreUnavailable(err.to_string()),
            TimeoutError::Database(e) => AuthError::from(e),
        }
    }
}

/// Result type for timeout operations
pub type TimeoutResult<T> = Result<T, TimeoutError>;

/// Execute a query with timeout
///
/// # Arguments
///
/// * `duration` - Timeout duration
/// * `future` - Async operation to execute
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> TimeoutResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match timeout(duration, future).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(TimeoutError::Database(e)),
        Err(_) => Err(TimeoutError::Timeout(duration)),
    }
}

/// Execute a query with default timeout (5 seconds)
pub async fn with_default_timeout<F, T>(future: F) -> TimeoutResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    with_timeout(DEFAULT_QUERY_TIMEOUT, future).await
}

/// Execute a long-running query with extended timeout (30 seconds)
pub async fn with_long_timeout<F, T>(future: F) -> TimeoutResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    with_timeout(LONG_OPERATION_TIMEOUT, future).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn test_timeout_maps_to_store_unavailable() {
        let result: TimeoutResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        let err = AuthError::from(result.unwrap_err());
        assert!(matches!(err, AuthError::StoreUnavailable(_)));
        assert_eq!(err.kind(), ErrorKind::ExternalDependency);
    }

    #[tokio::test]
    async fn test_completed_future_passes_through() {
        let value = with_default_timeout(async { Ok::<_, sqlx::Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_timeout_error_display() {
        let err = TimeoutError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("5s"));
    }
}
