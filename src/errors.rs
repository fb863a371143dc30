//! Error types for the connection pool

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::bag::EntryState;

/// Boxed error returned by [`ResourceFactory`](crate::ResourceFactory) implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A resource could not be created or failed its first validation.
///
/// Never returned on its own from `acquire`; it rides along as the cause of a
/// [`PoolError::Timeout`] or [`PoolError::Initialization`].
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ResourceSetupError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ResourceSetupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: BoxError) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("{pool} - Resource is not available, request timed out after {}ms", waited.as_millis())]
    Timeout {
        pool: String,
        waited: Duration,
        #[source]
        cause: Option<Arc<ResourceSetupError>>,
    },

    #[error("{pool} - Failed to initialize pool")]
    Initialization {
        pool: String,
        #[source]
        cause: Option<Arc<ResourceSetupError>>,
    },

    #[error("Attempt to {operation} an entry that was {found:?}")]
    UsageContract {
        operation: &'static str,
        found: EntryState,
    },

    #[error("Invalid pool configuration: {0}")]
    Configuration(String),

    #[error("{0} - Pool has been shut down")]
    Closed(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl PoolError {
    /// The factory failure attached to a timeout or initialization error, if any.
    pub fn setup_cause(&self) -> Option<&ResourceSetupError> {
        match self {
            PoolError::Timeout { cause, .. } | PoolError::Initialization { cause, .. } => {
                cause.as_deref()
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout { .. })
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn timeout_carries_setup_cause() {
        let cause = Arc::new(ResourceSetupError::with_source(
            "connect refused",
            "io: refused".into(),
        ));
        let err = PoolError::Timeout {
            pool: "db".to_string(),
            waited: Duration::from_millis(250),
            cause: Some(cause),
        };

        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "db - Resource is not available, request timed out after 250ms"
        );
        assert_eq!(err.setup_cause().map(|c| c.message()), Some("connect refused"));
        assert!(err.source().is_some());
    }

    #[test]
    fn contract_error_names_state() {
        let err = PoolError::UsageContract {
            operation: "remove",
            found: EntryState::Free,
        };
        assert_eq!(err.to_string(), "Attempt to remove an entry that was Free");
        assert!(err.setup_cause().is_none());
    }
}
