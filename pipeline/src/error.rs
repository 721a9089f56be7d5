//! Error types and result definitions for pipeline operations.
//!
//! [`PipelineError`] carries an [`ErrorKind`] used for control flow (for example telling a
//! benign "slot already active" apart from a fatal stream failure), a static description,
//! optional dynamic detail and the callsite that created it. Several errors can be aggregated
//! into one, which is how failures of concurrently running tasks are reported.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the crate.
#[derive(Debug, Clone)]
pub struct PipelineError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Errors of several tasks that failed together.
    Many {
        errors: Vec<PipelineError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors raised by the pipeline.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    SourceConnectionFailed,
    AuthenticationError,

    // Query & Execution Errors
    SourceQueryFailed,
    SourceOperationCanceled,
    SourceSchemaError,
    MissingTableMetadata,

    // Decoding & Data Errors
    DecodingError,
    UnknownOperation,
    ConversionError,
    InvalidData,
    ValidationError,

    // Configuration Errors
    ConfigError,

    // IO & Serialization Errors
    IoError,
    SourceIoError,
    SerializationError,
    DeserializationError,
    EncryptionError,

    // State & Workflow Errors
    InvalidState,
    PreparationFailed,
    PipelineInternal,
    ProgressStoreError,
    ChannelClosed,
    TaskPanic,
    TaskCancelled,
    SinkError,

    // Replication Errors
    ReplicationSlotNotFound,
    ReplicationSlotAlreadyExists,
    ReplicationSlotAlreadyActive,
    SourceDatabaseShutdown,

    // General Errors
    SourceError,
    Unknown,

    // Raised by fault injection in tests.
    #[cfg(feature = "failpoints")]
    Injected,
}

impl PipelineError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// Aggregated errors report the kind of their first error, or [`ErrorKind::Unknown`]
    /// when empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description of this error, or of the first aggregated error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        PipelineError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    #[track_caller]
    fn from_source<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        PipelineError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for PipelineError {
    fn eq(&self, other: &PipelineError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail:", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace:", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, title: &str, body: &str) -> fmt::Result {
    write!(f, "\n  {title}")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for PipelineError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> PipelineError {
        PipelineError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for PipelineError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> PipelineError {
        PipelineError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is instead of being wrapped.
impl<E> From<Vec<E>> for PipelineError
where
    E: Into<PipelineError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> PipelineError {
        let location = Location::caller();
        let mut errors: Vec<PipelineError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        PipelineError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for PipelineError {
    #[track_caller]
    fn from(err: std::io::Error) -> PipelineError {
        PipelineError::from_source(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for PipelineError {
    #[track_caller]
    fn from(err: serde_json::Error) -> PipelineError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        PipelineError::from_source(kind, description, err)
    }
}

impl From<std::str::Utf8Error> for PipelineError {
    #[track_caller]
    fn from(err: std::str::Utf8Error) -> PipelineError {
        PipelineError::from_source(ErrorKind::DecodingError, "UTF-8 conversion failed", err)
    }
}

impl From<std::string::FromUtf8Error> for PipelineError {
    #[track_caller]
    fn from(err: std::string::FromUtf8Error) -> PipelineError {
        PipelineError::from_source(ErrorKind::DecodingError, "UTF-8 conversion failed", err)
    }
}

impl From<std::num::ParseIntError> for PipelineError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> PipelineError {
        PipelineError::from_source(ErrorKind::ConversionError, "Integer parsing failed", err)
    }
}

impl From<std::num::ParseFloatError> for PipelineError {
    #[track_caller]
    fn from(err: std::num::ParseFloatError) -> PipelineError {
        PipelineError::from_source(ErrorKind::ConversionError, "Float parsing failed", err)
    }
}

impl From<bigdecimal::ParseBigDecimalError> for PipelineError {
    #[track_caller]
    fn from(err: bigdecimal::ParseBigDecimalError) -> PipelineError {
        PipelineError::from_source(ErrorKind::ConversionError, "Numeric parsing failed", err)
    }
}

impl From<chrono::ParseError> for PipelineError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> PipelineError {
        PipelineError::from_source(ErrorKind::DecodingError, "Datetime parsing failed", err)
    }
}

/// Maps Postgres SQLSTATE codes onto error kinds.
///
/// `OBJECT_IN_USE` on a replication connection means another consumer holds the slot and
/// is reported as [`ErrorKind::ReplicationSlotAlreadyActive`], which the dumper treats as a
/// clean exit.
impl From<tokio_postgres::Error> for PipelineError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> PipelineError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => {
                use tokio_postgres::error::SqlState;

                match *sqlstate {
                    SqlState::OBJECT_IN_USE => (
                        ErrorKind::ReplicationSlotAlreadyActive,
                        "Replication slot is already active",
                    ),
                    SqlState::DUPLICATE_OBJECT => (
                        ErrorKind::ReplicationSlotAlreadyExists,
                        "Replication slot already exists",
                    ),
                    SqlState::UNDEFINED_OBJECT => (
                        ErrorKind::ReplicationSlotNotFound,
                        "Replication slot does not exist",
                    ),

                    SqlState::CONNECTION_EXCEPTION
                    | SqlState::CONNECTION_DOES_NOT_EXIST
                    | SqlState::CONNECTION_FAILURE
                    | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                    | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
                    | SqlState::TOO_MANY_CONNECTIONS => (
                        ErrorKind::SourceConnectionFailed,
                        "PostgreSQL connection failed",
                    ),

                    SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                        ErrorKind::AuthenticationError,
                        "PostgreSQL authentication failed",
                    ),

                    SqlState::DATA_EXCEPTION
                    | SqlState::INVALID_TEXT_REPRESENTATION
                    | SqlState::INVALID_DATETIME_FORMAT
                    | SqlState::NUMERIC_VALUE_OUT_OF_RANGE => (
                        ErrorKind::ConversionError,
                        "PostgreSQL data conversion failed",
                    ),

                    SqlState::UNDEFINED_TABLE
                    | SqlState::UNDEFINED_COLUMN
                    | SqlState::UNDEFINED_SCHEMA
                    | SqlState::FEATURE_NOT_SUPPORTED => (
                        ErrorKind::SourceSchemaError,
                        "PostgreSQL schema object not found",
                    ),

                    SqlState::SYNTAX_ERROR
                    | SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION
                    | SqlState::INSUFFICIENT_PRIVILEGE => (
                        ErrorKind::SourceQueryFailed,
                        "PostgreSQL syntax or access error",
                    ),

                    SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE => (
                        ErrorKind::InvalidState,
                        "PostgreSQL object not in prerequisite state",
                    ),

                    SqlState::IO_ERROR | SqlState::DISK_FULL => {
                        (ErrorKind::SourceIoError, "PostgreSQL I/O error")
                    }

                    SqlState::QUERY_CANCELED | SqlState::OPERATOR_INTERVENTION => (
                        ErrorKind::SourceOperationCanceled,
                        "PostgreSQL operation canceled",
                    ),
                    SqlState::ADMIN_SHUTDOWN | SqlState::CRASH_SHUTDOWN => (
                        ErrorKind::SourceDatabaseShutdown,
                        "PostgreSQL shutdown",
                    ),

                    _ => (ErrorKind::SourceError, "PostgreSQL error"),
                }
            }
            // Without a SQLSTATE the failure happened on the socket, not on the server.
            None => (ErrorKind::SourceIoError, "PostgreSQL stream failed"),
        };

        PipelineError::from_source(kind, description, err)
    }
}

impl From<sqlx::Error> for PipelineError {
    #[track_caller]
    fn from(err: sqlx::Error) -> PipelineError {
        let kind = match &err {
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                ErrorKind::SourceConnectionFailed
            }
            _ => ErrorKind::SourceQueryFailed,
        };

        PipelineError::from_source(kind, "Database operation failed", err)
    }
}

impl From<sqlx::migrate::MigrateError> for PipelineError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> PipelineError {
        PipelineError::from_source(ErrorKind::ProgressStoreError, "Migration failed", err)
    }
}

impl From<rustls::Error> for PipelineError {
    #[track_caller]
    fn from(err: rustls::Error) -> PipelineError {
        PipelineError::from_source(ErrorKind::EncryptionError, "TLS configuration failed", err)
    }
}

impl From<config::shared::ValidationError> for PipelineError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> PipelineError {
        PipelineError::from_source(ErrorKind::ConfigError, "Invalid configuration", err)
    }
}

impl From<postgres::replication::ReplicationSlotNameError> for PipelineError {
    #[track_caller]
    fn from(err: postgres::replication::ReplicationSlotNameError) -> PipelineError {
        PipelineError::from_source(
            ErrorKind::ValidationError,
            "Replication slot name is invalid",
            err,
        )
    }
}

impl From<postgres::types::ParseLsnError> for PipelineError {
    #[track_caller]
    fn from(err: postgres::types::ParseLsnError) -> PipelineError {
        PipelineError::from_source(ErrorKind::InvalidData, "Position parsing failed", err)
    }
}
