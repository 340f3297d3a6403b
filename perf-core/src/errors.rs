//! Error kinds surfaced across the engine.

/// Stable error-code constants, used for logging and HTTP mapping.
pub mod error_code {
    pub const NOT_FOUND: &str = "PERF_NOT_FOUND";
    pub const INVALID_INPUT: &str = "PERF_INVALID_INPUT";
    pub const TRANSIENT: &str = "PERF_TRANSIENT";
    pub const CONFLICT: &str = "PERF_CONFLICT";
    pub const CANCELLED: &str = "PERF_CANCELLED";
    pub const FATAL: &str = "PERF_FATAL";
}

/// Capability trait: every error exposes a stable code.
pub trait PerfErrorCode {
    fn error_code(&self) -> &'static str;
}

/// Errors that can occur anywhere in the engine.
#[derive(Debug, thiserror::Error)]
pub enum PerfError {
    /// Commit, regression, process id, or tile unknown.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Malformed query, file, or alert configuration.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// DB or network failure expected to be retriable.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Duplicate insert rejected. Usually absorbed by insert-if-absent.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The caller dropped the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Unrecoverable; the scanner should exit.
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl PerfError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal { message: message.into() }
    }

    /// True when a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl PerfErrorCode for PerfError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => error_code::NOT_FOUND,
            Self::InvalidInput { .. } => error_code::INVALID_INPUT,
            Self::Transient { .. } => error_code::TRANSIENT,
            Self::Conflict { .. } => error_code::CONFLICT,
            Self::Cancelled => error_code::CANCELLED,
            Self::Fatal { .. } => error_code::FATAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, PerfError>;
