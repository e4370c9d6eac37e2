use anyhow::Error as AnyError;
use thiserror::Error;

/// keel runtime errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed descriptor, version, path, or argument.
    #[error("Invalid argument: {}", _0)]
    InvalidArgument(String),

    /// An unknown module, symbol, namespace, or parameter.
    #[error("Not found: {}", _0)]
    NotFound(String),

    /// A duplicate module name, symbol export, or edge.
    #[error("Already exists: {}", _0)]
    AlreadyExists(String),

    /// An access tier violation, or a symbol read from a namespace that was not included.
    #[error("Permission denied: {}", _0)]
    PermissionDenied(String),

    #[error("Cyclic dependency: {}", _0)]
    CyclicDependency(String),

    /// A module is still depended on or locked, or a `finish`/`unload` is already in progress.
    #[error("Busy: {}", _0)]
    Busy(String),

    #[error("Unsupported: {}", _0)]
    Unsupported(String),

    /// A module constructor, dynamic export constructor, or start event returned an error.
    #[error("Construction of module `{}` failed: {}", module, source)]
    ConstructionFailed {
        module: String,
        #[source]
        source: AnyError,
    },

    /// A module-level value was malformed.
    #[error("Module error: {}", _0)]
    ModuleError(#[from] keel_module::Error),

    /// A catch-all for internal errors that are likely unrecoverable by the runtime user.
    #[error("Internal error: {}", _0)]
    InternalError(#[source] AnyError),
}

/// The coarse classification of an [`Error`], as seen across the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    CyclicDependency,
    Busy,
    Unsupported,
    ConstructionFailed,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::ModuleError(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::CyclicDependency(_) => ErrorKind::CyclicDependency,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::ConstructionFailed { .. } => ErrorKind::ConstructionFailed,
            Error::InternalError(_) => ErrorKind::Internal,
        }
    }
}

#[macro_export]
macro_rules! keel_bail {
    ($e:expr) => {
        return Err(keel_format_err!($e));
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(keel_format_err!($fmt, $($arg)*));
    };
}

#[macro_export(local_inner_macros)]
macro_rules! keel_ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            keel_bail!($e);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            keel_bail!($fmt, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! keel_format_err {
    ($($arg:tt)*) => { $crate::error::Error::InternalError(anyhow::format_err!($($arg)*)) }
}

/// Return early with the given error kind and a formatted message.
#[macro_export]
macro_rules! bail_kind {
    ($kind:ident, $($arg:tt)*) => {
        return Err($crate::error::Error::$kind(format!($($arg)*)))
    };
}
