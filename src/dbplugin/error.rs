//! Errors returned by every `Database` implementation.

use std::error::Error as StdError;
use std::time::Duration;

use crate::protocol::status::{Code, Status};

/// Boxed source error carried by adapter failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error surface of the database plugin contract.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// A request failed validation.
    #[error("{0}")]
    InvalidArgument(String),

    /// The plugin process behind this handle has exited.
    #[error("plugin shut down")]
    PluginShutdown,

    /// Status received from the other side of the RPC boundary.
    #[error(transparent)]
    Status(#[from] Status),

    /// A connection URL failed to parse.
    #[error("{0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A control call exceeded its deadline.
    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),

    /// The adapter or its database rejected the operation.
    #[error("{message}")]
    Adapter {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl DatabaseError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        DatabaseError::InvalidArgument(message.into())
    }

    pub fn adapter(message: impl Into<String>) -> Self {
        DatabaseError::Adapter {
            message: message.into(),
            source: None,
        }
    }

    /// Adapter failure whose message is `"{context}: {source}"`.
    pub fn with_source<E>(context: impl AsRef<str>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        DatabaseError::Adapter {
            message: format!("{}: {}", context.as_ref(), source),
            source: Some(Box::new(source)),
        }
    }

    /// Status code this error maps to at the RPC boundary.
    pub fn code(&self) -> Code {
        match self {
            DatabaseError::InvalidArgument(_) => Code::InvalidArgument,
            DatabaseError::PluginShutdown => Code::Unavailable,
            DatabaseError::Status(status) => status.code,
            DatabaseError::InvalidUrl(_) => Code::Internal,
            DatabaseError::Timeout(_) => Code::DeadlineExceeded,
            DatabaseError::Adapter { .. } => Code::Internal,
        }
    }

    pub fn is_plugin_shutdown(&self) -> bool {
        matches!(self, DatabaseError::PluginShutdown)
    }

    /// Convert into the status sent back to the caller.
    pub fn to_status(&self) -> Status {
        match self {
            DatabaseError::Status(status) => status.clone(),
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
