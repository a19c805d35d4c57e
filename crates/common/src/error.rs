use thiserror::Error;

/// Canonical RSE error taxonomy used across crates.
///
/// Classification guidance:
/// - [`RseError::Transport`], [`RseError::Validation`], [`RseError::Corrupt`]: one fetch
///   went wrong; the location is retried after a host penalty
/// - [`RseError::Io`]: local spill/rename failures, fatal; fetch paths wrap remote read
///   failures as [`RseError::Transport`] instead
/// - [`RseError::Merge`], [`RseError::Coordinator`]: fatal for the whole shuffle
/// - [`RseError::ShuffleFailed`]: systemic fetch exhaustion, reported once to the coordinator
#[derive(Debug, Error)]
pub enum RseError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - zero copiers or a fan-in below 2
    /// - fractions outside `(0, 1]`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connecting to or reading from a producer host failed.
    ///
    /// Examples:
    /// - connect budget exhausted
    /// - read timeout on a body block
    #[error("transport error: {0}")]
    Transport(String),

    /// Response metadata did not match the request.
    ///
    /// Examples:
    /// - wrong attempt id or partition in the header
    /// - negative or inconsistent lengths
    /// - fewer bytes delivered than declared
    #[error("validation error: {0}")]
    Validation(String),

    /// Stored bytes failed checksum or framing checks.
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A merge pass could not complete.
    #[error("merge error: {0}")]
    Merge(String),

    /// The shuffle gave up: too many producers could not be fetched.
    #[error("shuffle failed: {0}")]
    ShuffleFailed(String),

    /// The completion-event source or fault sink failed.
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// Work was interrupted by shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl RseError {
    /// Whether this error, raised while fetching one producer output, should
    /// be treated as a per-fetch failure rather than a fatal fault.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Validation(_) | Self::Corrupt(_)
        )
    }
}

/// Standard RSE result alias.
pub type Result<T> = std::result::Result<T, RseError>;
