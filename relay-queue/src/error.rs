use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Unknown queue driver `{requested}` (known drivers: {})", known.join(", "))]
    UnknownDriver { requested: String, known: Vec<String> },

    #[error("Invalid queue configuration: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Job execution failed: {0}")]
    JobFailed(#[from] JobError),

    #[error("Claim is no longer held: {0}")]
    StaleClaim(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Handle for job {0} was already terminated")]
    HandleTerminated(String),

    #[error("Job type not registered: {0}")]
    JobTypeNotRegistered(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether the backend could not be reached; workers back off on these
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether the error came from acknowledging a claim that is no longer valid
    pub fn is_acknowledgement(&self) -> bool {
        matches!(self, Self::StaleClaim(_) | Self::InvalidReceipt(_))
    }

    /// Whether the error is a startup configuration problem
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnknownDriver { .. } | Self::Configuration(_))
    }
}

/// Failure raised by user job code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The job handler returned an error
    #[error("{0}")]
    Handler(String),

    /// The recorded payload could not be turned into the job type
    #[error("Failed to deserialize job payload: {0}")]
    Deserialize(String),

    /// No job type is registered under the recorded name
    #[error("Unknown job type: {0}")]
    UnknownJob(String),
}

impl JobError {
    /// Create a handler error
    pub fn new(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Handler(msg) | Self::Deserialize(msg) | Self::UnknownJob(msg) => msg,
        }
    }

    /// Short classification used by backends that record an error type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "HandlerError",
            Self::Deserialize(_) => "DeserializeError",
            Self::UnknownJob(_) => "UnknownJob",
        }
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::JobFailed(inner) => inner,
            other => Self::Handler(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => Self::Connection(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Connection(err.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_driver_names_known_drivers() {
        let err = QueueError::UnknownDriver {
            requested: "redis".to_string(),
            known: vec!["broker".to_string(), "database".to_string()],
        };

        let msg = err.to_string();
        assert!(msg.contains("redis"));
        assert!(msg.contains("broker, database"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_job_error_survives_queue_error_roundtrip() {
        let original = JobError::new("smtp down");
        let wrapped: QueueError = original.clone().into();
        let back: JobError = wrapped.into();
        assert_eq!(back, original);
    }

    #[test]
    fn test_classification() {
        assert!(QueueError::Connection("refused".into()).is_connectivity());
        assert!(QueueError::InvalidReceipt("abc".into()).is_acknowledgement());
        assert!(!QueueError::Internal("x".into()).is_connectivity());
    }
}
