use std::fmt;

use crate::AdapterState;

/// Error reported by the adapter itself, e.g. the cause of a failed connection attempt
/// or of a failed read. The engine never interprets it, only passes it on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdapterError {
    code: isize,
    description: String,
}

impl AdapterError {
    pub fn new(code: isize, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Adapter-specific error code.
    pub fn code(&self) -> isize {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (code {})", self.description, self.code)
    }
}

impl std::error::Error for AdapterError {}

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    description: String,
    cause: Option<AdapterError>,
}

impl Error {
    pub(in crate) fn adapter_unavailable(state: AdapterState) -> Self {
        Self {
            kind: ErrorKind::AdapterUnavailable(state),
            description: format!("Bluetooth adapter is unavailable ({:?})", state),
            cause: None,
        }
    }

    pub(in crate) fn connection_failed(cause: Option<AdapterError>) -> Self {
        Self {
            kind: ErrorKind::ConnectionFailed,
            description: "connection to the peripheral failed".into(),
            cause,
        }
    }

    pub(in crate) fn connection_cancelled() -> Self {
        Self {
            kind: ErrorKind::ConnectionCancelled,
            description: "connection was cancelled".into(),
            cause: None,
        }
    }

    pub(in crate) fn command_failed(cause: AdapterError) -> Self {
        Self {
            kind: ErrorKind::CommandFailed,
            description: "command failed".into(),
            cause: Some(cause),
        }
    }

    pub(in crate) fn timeout() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            description: "operation timed out".into(),
            cause: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error reported by the adapter, if this error originates from one.
    pub fn cause(&self) -> Option<&AdapterError> {
        self.cause.as_ref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.description)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The adapter is in a terminal state (unsupported or unauthorized), or is otherwise
    /// unable to perform an action that was required immediately.
    AdapterUnavailable(AdapterState),

    /// The adapter reported a failed connection attempt or lost the link before the
    /// operation completed.
    ConnectionFailed,

    /// The caller cancelled the connection before the operation completed.
    ConnectionCancelled,

    /// The adapter reported a failed discovery, read, write or subscription.
    CommandFailed,

    /// The configured timeout elapsed.
    Timeout,
}
