//! Error translation for native status codes.
//!
//! librados reports failures as negated errno values. Every call that crosses
//! into the native layer routes its status through [`check`], which maps the
//! known codes onto typed variants and keeps the raw code for diagnostics.

use std::any::Any;
use std::fmt;

/// Errno values the binding distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Eperm,
    Enoent,
    Einval,
    Erofs,
    Edom,
    Eisconn,
    Etimedout,
    Einprogress,
}

impl ErrorCode {
    /// Look up a status code. Accepts both `-EPERM` and `EPERM`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code.unsigned_abs() as i32 {
            libc::EPERM => Some(Self::Eperm),
            libc::ENOENT => Some(Self::Enoent),
            libc::EINVAL => Some(Self::Einval),
            libc::EROFS => Some(Self::Erofs),
            libc::EDOM => Some(Self::Edom),
            libc::EISCONN => Some(Self::Eisconn),
            libc::ETIMEDOUT => Some(Self::Etimedout),
            libc::EINPROGRESS => Some(Self::Einprogress),
            _ => None,
        }
    }

    /// Positive errno value.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Eperm => libc::EPERM,
            Self::Enoent => libc::ENOENT,
            Self::Einval => libc::EINVAL,
            Self::Erofs => libc::EROFS,
            Self::Edom => libc::EDOM,
            Self::Eisconn => libc::EISCONN,
            Self::Etimedout => libc::ETIMEDOUT,
            Self::Einprogress => libc::EINPROGRESS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Eperm => "EPERM",
            Self::Enoent => "ENOENT",
            Self::Einval => "EINVAL",
            Self::Erofs => "EROFS",
            Self::Edom => "EDOM",
            Self::Eisconn => "EISCONN",
            Self::Etimedout => "ETIMEDOUT",
            Self::Einprogress => "EINPROGRESS",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Eperm => "Operation not permitted",
            Self::Enoent => "No such file or directory",
            Self::Einval => "Invalid argument",
            Self::Erofs => "Read-only file system",
            Self::Edom => "Numerical argument out of domain",
            Self::Eisconn => "Transport endpoint is already connected",
            Self::Etimedout => "Connection timed out",
            Self::Einprogress => "Operation now in progress",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

/// Errors returned by the binding.
///
/// Variants translated from a native status carry the rendered message and
/// the raw (negative) code.
#[derive(Debug, thiserror::Error)]
pub enum RadosError {
    #[error("{message}")]
    PermissionDenied { message: String, code: i32 },
    #[error("{message}")]
    NotFound { message: String, code: i32 },
    #[error("{message}")]
    InvalidArgument { message: String, code: i32 },
    #[error("{message}")]
    ReadOnly { message: String, code: i32 },
    #[error("{message}")]
    ArgumentOutOfDomain { message: String, code: i32 },
    #[error("{message}")]
    AlreadyConnected { message: String, code: i32 },
    #[error("{message}")]
    TimedOut { message: String, code: i32 },
    #[error("{message}")]
    InProgress { message: String, code: i32 },
    #[error("{message}")]
    Native { message: String, code: i32 },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("completion already released")]
    Released,
    #[error("no free completion handles")]
    RegistryExhausted,
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RadosError {
    /// Translate a negative status code into a typed error.
    pub fn from_code(code: i32, context: &str) -> Self {
        let Some(known) = ErrorCode::from_code(code) else {
            return Self::Native {
                message: format!("{context}; error code: {code}"),
                code,
            };
        };

        let message = format!("{context}; {known}");
        match known {
            ErrorCode::Eperm => Self::PermissionDenied { message, code },
            ErrorCode::Enoent => Self::NotFound { message, code },
            ErrorCode::Einval => Self::InvalidArgument { message, code },
            ErrorCode::Erofs => Self::ReadOnly { message, code },
            ErrorCode::Edom => Self::ArgumentOutOfDomain { message, code },
            ErrorCode::Eisconn => Self::AlreadyConnected { message, code },
            ErrorCode::Etimedout => Self::TimedOut { message, code },
            ErrorCode::Einprogress => Self::InProgress { message, code },
        }
    }

    /// Wrap a panic payload caught at a boundary.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Internal(format!("unexpected panic: {detail}"))
    }

    /// The raw native status code, when this error came from one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::PermissionDenied { code, .. }
            | Self::NotFound { code, .. }
            | Self::InvalidArgument { code, .. }
            | Self::ReadOnly { code, .. }
            | Self::ArgumentOutOfDomain { code, .. }
            | Self::AlreadyConnected { code, .. }
            | Self::TimedOut { code, .. }
            | Self::InProgress { code, .. }
            | Self::Native { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RadosError>;

/// Route a native status through the translator. Non-negative values pass
/// through unchanged.
pub fn check(rc: i32, context: impl AsRef<str>) -> Result<i32> {
    if rc < 0 {
        Err(RadosError::from_code(rc, context.as_ref()))
    } else {
        Ok(rc)
    }
}
