use std::fmt;

/// Convenience alias for the result type used throughout the scheduler.
pub type WeftResult<T> = Result<T, Error>;

/// Errors surfaced by the scheduling pipeline.
///
/// Internal invariant violations are deliberately not represented here: a
/// broken pipeline invariant means an upstream pass produced garbage and we
/// panic at the point of detection with full context instead of limping on.
#[derive(Debug, Clone)]
pub enum Error {
    /// The input uses a feature the BSP scheduler cannot handle (multiple
    /// clock domains, external combinational inputs, combinational cycles).
    /// The affected region or optimization is skipped.
    Unsupported(String),
    /// A hard resource bound (tiles, workers, per-tile memory) could not be
    /// satisfied even by best-effort fallback assignment.
    ResourceExhausted(String),
    /// Malformed input description.
    Misc(String),
    /// Failed to write an output or debug artifact.
    WriteFailure(String),
}

impl Error {
    pub fn unsupported<S: ToString>(msg: S) -> Self {
        Error::Unsupported(msg.to_string())
    }

    pub fn resource_exhausted<S: ToString>(msg: S) -> Self {
        Error::ResourceExhausted(msg.to_string())
    }

    pub fn misc<S: ToString>(msg: S) -> Self {
        Error::Misc(msg.to_string())
    }

    pub fn write_failure<S: ToString>(msg: S) -> Self {
        Error::WriteFailure(msg.to_string())
    }

    /// True for diagnostics that disable an optimization but let the rest of
    /// the pipeline continue.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(..))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            Error::ResourceExhausted(msg) => {
                write!(f, "insufficient resources: {}", msg)
            }
            Error::Misc(msg) => write!(f, "{}", msg),
            Error::WriteFailure(msg) => write!(f, "write failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::WriteFailure(err.to_string())
    }
}

impl From<std::fmt::Error> for Error {
    fn from(err: std::fmt::Error) -> Self {
        Error::WriteFailure(err.to_string())
    }
}
