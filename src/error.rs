//! Error types for pg-warehouse-sync.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pg-warehouse-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// PostgreSQL connection error
    #[error("PostgreSQL connection error: {message}")]
    PostgresConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// PostgreSQL query error
    #[error("PostgreSQL query error on table '{table}': {message}")]
    PostgresQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// MotherDuck connection error
    #[error("MotherDuck connection error: {message}")]
    MotherDuckConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// MotherDuck query error
    #[error("MotherDuck query error on table '{table}': {message}")]
    MotherDuckQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// Source collaborator error not tied to a specific client library
    #[error("Source error on table '{table}': {message}")]
    Source {
        /// Table name
        table: String,
        /// Error message
        message: String,
    },

    /// Destination collaborator error not tied to a specific client library
    #[error("Destination error on table '{table}': {message}")]
    Destination {
        /// Table name
        table: String,
        /// Error message
        message: String,
    },

    /// A freshly created destination table never became visible
    #[error("Table '{table}' is still not available after {attempts} existence checks")]
    TableNotReady {
        /// Table name
        table: String,
        /// Number of existence probes made
        attempts: u32,
    },

    /// Checkpoint document error
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint {
        /// Path of the checkpoint document
        path: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a PostgreSQL connection error.
    pub fn postgres_connection(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PostgresConnection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a PostgreSQL query error.
    pub fn postgres_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::PostgresQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a MotherDuck connection error.
    pub fn motherduck_connection(message: impl Into<String>, source: duckdb::Error) -> Self {
        Self::MotherDuckConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a MotherDuck query error.
    pub fn motherduck_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: duckdb::Error,
    ) -> Self {
        Self::MotherDuckQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a generic source error.
    pub fn source_error(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a generic destination error.
    pub fn destination_error(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Destination {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a checkpoint document error.
    pub fn checkpoint(
        path: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::PostgresConnection { .. } => "PG_CONNECTION_ERROR",
            Error::PostgresQuery { .. } => "PG_QUERY_ERROR",
            Error::MotherDuckConnection { .. } => "MD_CONNECTION_ERROR",
            Error::MotherDuckQuery { .. } => "MD_QUERY_ERROR",
            Error::Source { .. } => "SOURCE_ERROR",
            Error::Destination { .. } => "DESTINATION_ERROR",
            Error::TableNotReady { .. } => "TABLE_NOT_READY",
            Error::Checkpoint { .. } => "CHECKPOINT_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::config_with_source(message, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}
