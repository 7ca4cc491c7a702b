use thiserror::Error;

/// Broker link failures. Only network-class errors are worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("broker rejected credentials: {0}")]
    Auth(String),
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("connect attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("gave up after {attempts} reconnect attempts (last error: {last})")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ConnectionError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Auth(_) | ConnectionError::Refused(_) | ConnectionError::RetriesExhausted { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("broker rejected topic filter {filter:?}")]
    Rejected { filter: String },
    #[error("subscribe request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("persisting batch of {batch} failed after {attempts} attempts: {last}")]
    RetriesExhausted { batch: usize, attempts: u32, last: String },
}

/// Everything that can end the logger process with a non-zero status.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_CONNECTION_ERROR: u8 = 2;
pub const EXIT_PERSISTENCE_ERROR: u8 = 3;
pub const EXIT_SUBSCRIPTION_ERROR: u8 = 4;
pub const EXIT_INTERNAL_ERROR: u8 = 5;

impl LoggerError {
    pub fn exit_code(&self) -> u8 {
        match self {
            LoggerError::Config(_) => EXIT_CONFIG_ERROR,
            LoggerError::Connection(_) => EXIT_CONNECTION_ERROR,
            LoggerError::Persistence(_) => EXIT_PERSISTENCE_ERROR,
            LoggerError::Subscription(_) => EXIT_SUBSCRIPTION_ERROR,
            LoggerError::Internal(_) => EXIT_INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ConnectionError::Auth("bad password".into()).is_fatal());
        assert!(ConnectionError::Refused("bad client id".into()).is_fatal());
        assert!(!ConnectionError::Network("connection reset".into()).is_fatal());
        assert!(!ConnectionError::Timeout(std::time::Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn exit_codes_are_non_zero_for_failures() {
        let errors = [
            LoggerError::Config("x".into()),
            LoggerError::Connection(ConnectionError::Auth("x".into())),
            LoggerError::Subscription(SubscriptionError::Rejected { filter: "a/#".into() }),
            LoggerError::Persistence(PersistenceError::RetriesExhausted { batch: 1, attempts: 3, last: "x".into() }),
        ];
        for e in errors {
            assert_ne!(e.exit_code(), EXIT_SUCCESS);
        }
    }
}
