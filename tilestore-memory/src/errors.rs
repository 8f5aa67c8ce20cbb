use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;
use std::sync::Arc;

/// Error kinds for memory tracking operations.
///
/// Each kind describes one category of failure so callers can tell a
/// recoverable budget refusal apart from a programming error.
///
/// # Examples
///
/// ```rust
/// use tilestore_memory::errors::{ErrorKind, MemoryError, MemoryResult};
///
/// fn example() -> MemoryResult<()> {
///     Err(MemoryError::new("over budget", ErrorKind::BudgetExceeded))
/// }
/// assert!(example().is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    /// An allocation would push tracked usage above the configured budget
    BudgetExceeded,
    /// The upstream resource could not satisfy an allocation
    AllocationFailed,
    /// The operation is not valid in the current state
    InvalidOperation,
    /// A configuration value could not be parsed or is out of range
    InvalidConfiguration,
    /// Generic IO error
    IOError,
    /// Error encoding or decoding data
    EncodingError,
    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::BudgetExceeded => write!(f, "Budget exceeded"),
            ErrorKind::AllocationFailed => write!(f, "Allocation failed"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::InvalidConfiguration => write!(f, "Invalid configuration"),
            ErrorKind::IOError => write!(f, "IO error"),
            ErrorKind::EncodingError => write!(f, "Encoding error"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Error type for the memory tracking layer.
///
/// `MemoryError` carries a message, a kind, an optional cause and the
/// backtrace captured where it was raised.
#[derive(Clone)]
pub struct MemoryError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<MemoryError>>,
    backtrace: Arc<Backtrace>,
}

impl MemoryError {
    /// Creates a new `MemoryError` with the specified message and error kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        MemoryError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: Arc::new(Backtrace::new()),
        }
    }

    /// Creates a new `MemoryError` chained to the error that caused it.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: MemoryError) -> Self {
        MemoryError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: Arc::new(Backtrace::new()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&MemoryError> {
        self.cause.as_deref()
    }

    /// Returns `true` if this error is a budget refusal.
    pub fn is_budget_exceeded(&self) -> bool {
        self.error_kind == ErrorKind::BudgetExceeded
    }
}

impl Display for MemoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for MemoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}\nCaused by: {:?}", self.message, cause),
            None => write!(f, "{}\n{:?}", self.message, self.backtrace),
        }
    }
}

impl Error for MemoryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// `MemoryResult<T>` is shorthand for `Result<T, MemoryError>`.
pub type MemoryResult<T> = Result<T, MemoryError>;

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        MemoryError::new(&format!("IO error: {}", err), ErrorKind::IOError)
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::new(
            &format!("JSON encoding error: {}", err),
            ErrorKind::EncodingError,
        )
    }
}

impl From<std::num::ParseIntError> for MemoryError {
    fn from(err: std::num::ParseIntError) -> Self {
        MemoryError::new(
            &format!("Integer parsing error: {}", err),
            ErrorKind::InvalidConfiguration,
        )
    }
}

impl From<std::alloc::LayoutError> for MemoryError {
    fn from(err: std::alloc::LayoutError) -> Self {
        MemoryError::new(
            &format!("Invalid allocation layout: {}", err),
            ErrorKind::AllocationFailed,
        )
    }
}
