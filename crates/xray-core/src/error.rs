//! Error types for the chest X-ray classification pipeline.
//!
//! Pipeline stages wrap whatever failed inside them into
//! [`Error::Operation`], which records the stage name and the source location
//! that raised it. [`Error::kind`] looks through that wrapping so callers can
//! still branch on what actually went wrong.

use std::panic::Location;

use thiserror::Error;

/// Main error type for the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Model construction or state error
    #[error("Model error: {0}")]
    Model(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metric computation error
    #[error("Metric error: {0}")]
    Metric(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Failure inside a named pipeline operation
    #[error("{operation} failed at {location}: {source}")]
    Operation {
        operation: &'static str,
        location: &'static Location<'static>,
        #[source]
        source: Box<Error>,
    },
}

/// Error category, independent of any operation wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Image,
    Model,
    Dataset,
    Config,
    Metric,
    Serialization,
    InvalidArgument,
    NotFound,
    AlreadyExists,
}

impl Error {
    /// Wraps `source` as a failure of `operation`, recording the caller location.
    #[track_caller]
    pub fn during(operation: &'static str, source: Error) -> Self {
        Error::Operation {
            operation,
            location: Location::caller(),
            source: Box::new(source),
        }
    }

    /// Category of the underlying failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Image(_) => ErrorKind::Image,
            Error::Model(_) => ErrorKind::Model,
            Error::Dataset(_) => ErrorKind::Dataset,
            Error::Config(_) => ErrorKind::Config,
            Error::Metric(_) => ErrorKind::Metric,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Operation { source, .. } => source.kind(),
        }
    }

    /// Name of the outermost operation this error was raised in, if any.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Error::Operation { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// Innermost error, with every operation layer removed.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Attaches operation context to fallible results.
pub trait ResultExt<T> {
    /// Wraps an error as a failure of `operation`.
    #[track_caller]
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[track_caller]
    fn during(self, operation: &'static str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(Error::during(operation, err.into())),
        }
    }
}
