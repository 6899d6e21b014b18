use std::fmt;

use linkwire_core::TypeCoercionError;

/// The error type surfaced by `linkwire`'s public client/server API.
#[derive(Debug)]
pub enum Error {
    /// The client could not connect, or the server-side connection died
    /// mid-session.
    ServerNotRunning,
    /// A lookup by name or address did not match any connected client.
    ClientNotFound,
    /// A send targeted a group with no members.
    GroupNotFound,
    /// The client observed a protocol violation from the server.
    ClientException(String),
    /// The server observed a protocol violation from a client.
    ServerException(String),
    /// A value failed to encode or decode against its target type.
    TypeCoercion(TypeCoercionError),
    /// A handler was registered with an incompatible parameter shape for
    /// the command it claims (reserved commands only; user commands have a
    /// single optional message parameter and cannot mismatch).
    HandlerArity { command: String, expected: &'static str },
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ServerNotRunning => write!(f, "server is not running"),
            Error::ClientNotFound => write!(f, "client not found"),
            Error::GroupNotFound => write!(f, "group not found or empty"),
            Error::ClientException(msg) => write!(f, "client protocol error: {msg}"),
            Error::ServerException(msg) => write!(f, "server protocol error: {msg}"),
            Error::TypeCoercion(e) => write!(f, "{e}"),
            Error::HandlerArity { command, expected } => {
                write!(f, "handler for {command:?} must accept {expected}")
            }
            Error::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TypeCoercion(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<TypeCoercionError> for Error {
    fn from(e: TypeCoercionError) -> Self {
        Error::TypeCoercion(e)
    }
}

impl From<linkwire_core::CoreError> for Error {
    fn from(e: linkwire_core::CoreError) -> Self {
        match e {
            linkwire_core::CoreError::Disconnected => Error::ServerNotRunning,
            linkwire_core::CoreError::MalformedHeader { bytes } => {
                Error::ServerException(format!("malformed frame header: {bytes:?}"))
            }
            linkwire_core::CoreError::TypeCoercion(e) => Error::TypeCoercion(e),
            linkwire_core::CoreError::Io(e) => Error::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
