use std::fmt;

/// Failure kinds surfaced by the wire codec and dispatch core.
///
/// These are the transport/codec-level errors; the higher-level
/// client/server errors in `linkwire::Error` wrap these where relevant.
#[derive(Debug)]
pub enum CoreError {
    /// The peer closed the connection cleanly (zero bytes read where a
    /// header was expected).
    Disconnected,
    /// The header bytes did not parse as a non-negative decimal integer.
    MalformedHeader { bytes: Vec<u8> },
    /// A value failed to encode or decode against its target type.
    TypeCoercion(TypeCoercionError),
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Disconnected => write!(f, "peer disconnected"),
            CoreError::MalformedHeader { bytes } => {
                write!(f, "malformed frame header: {:?}", bytes)
            }
            CoreError::TypeCoercion(e) => write!(f, "{}", e),
            CoreError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            CoreError::TypeCoercion(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e)
    }
}

impl From<TypeCoercionError> for CoreError {
    fn from(e: TypeCoercionError) -> Self {
        CoreError::TypeCoercion(e)
    }
}

/// A value could not be encoded or decoded as the requested type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCoercionError {
    pub expected: &'static str,
    pub detail: String,
}

impl TypeCoercionError {
    pub fn new(expected: &'static str, detail: impl Into<String>) -> Self {
        TypeCoercionError {
            expected,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TypeCoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not coerce value to {}: {}",
            self.expected, self.detail
        )
    }
}

impl std::error::Error for TypeCoercionError {}
