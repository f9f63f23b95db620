use sqlx::error::ErrorKind;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Every variant names the operation that failed. "Nothing found" is never
/// an error: reads return empty collections instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op}: constraint violation: {message}")]
    Constraint {
        op: &'static str,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("{op}: transient store failure: {source}")]
    Transient {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },

    #[error("{op}: database error: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid store config: {0}")]
    Config(#[from] newshound_common::ConfigError),
}

impl StoreError {
    /// Classify a driver error for `op`.
    pub fn from_sqlx(op: &'static str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if matches!(
                    db.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                ) =>
            {
                StoreError::Constraint {
                    op,
                    message: db.message().to_string(),
                    source: Some(err),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient { op, source: err },
            _ => StoreError::Database { op, source: err },
        }
    }

    pub(crate) fn constraint(op: &'static str, message: impl Into<String>) -> Self {
        StoreError::Constraint {
            op,
            message: message.into(),
            source: None,
        }
    }

    /// The operation this error was raised from, if known.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            StoreError::Constraint { op, .. }
            | StoreError::Transient { op, .. }
            | StoreError::Cancelled { op }
            | StoreError::Database { op, .. } => Some(op),
            StoreError::Migrate(_) | StoreError::Config(_) => None,
        }
    }

    /// Whether the caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled { .. })
    }
}
