use std::fmt;

/// Closed set of error categories a public CM operation can fail with.
///
/// Every public operation in the core returns a [`CmError`] wrapping one of
/// these kinds with a human-readable message; callers match on [`CmError::kind`]
/// rather than parsing the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadMessage,
    NotFound,
    AlreadyExists,
    NoMemory,
    Timeout,
    Unavailable,
    PermissionDenied,
    Internal,
    WrongState,
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BadMessage => "bad message",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::NoMemory => "no memory",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Internal => "internal",
            ErrorKind::WrongState => "wrong state",
            ErrorKind::InvalidArgument => "invalid argument",
        };
        f.write_str(s)
    }
}

/// An error produced by a core CM operation: an [`ErrorKind`] plus context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CmError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CmError { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        impl CmError {
            pub fn $name(message: impl Into<String>) -> Self {
                CmError::new(ErrorKind::$kind, message)
            }
        }
    };
}

ctor!(bad_message, BadMessage);
ctor!(not_found, NotFound);
ctor!(already_exists, AlreadyExists);
ctor!(no_memory, NoMemory);
ctor!(timeout, Timeout);
ctor!(unavailable, Unavailable);
ctor!(permission_denied, PermissionDenied);
ctor!(internal, Internal);
ctor!(wrong_state, WrongState);
ctor!(invalid_argument, InvalidArgument);

pub type CmResult<T> = Result<T, CmError>;
