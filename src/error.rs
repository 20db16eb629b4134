use std::io::Error as IoError;

/// Errors raised by the matrix assembly and clustering pipeline.
///
/// Recoverable degeneracies (a chromosome pair without data, a point with no
/// comparable coordinates, a balancer that never converges) are not errors:
/// they are logged and surface as NaN or skipped results. Everything here
/// aborts the stage that raised it.
#[derive(Debug)]
pub enum SubcompError {
    Io(IoError),
    InvalidInput(String),
    DimensionMismatch {
        stage: &'static str,
        expected: usize,
        found: usize,
    },
    EmptyMatrix {
        stage: &'static str,
    },
    Cancelled {
        stage: &'static str,
    },
    Cache(String),
}

impl std::fmt::Display for SubcompError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubcompError::Io(e) => write!(f, "IO error: {}", e),
            SubcompError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            SubcompError::DimensionMismatch {
                stage,
                expected,
                found,
            } => write!(
                f,
                "{}: dimension mismatch (expected {}, found {})",
                stage, expected, found
            ),
            SubcompError::EmptyMatrix { stage } => {
                write!(f, "{}: matrix has no rows or no columns", stage)
            }
            SubcompError::Cancelled { stage } => {
                write!(f, "{}: cancelled before completion", stage)
            }
            SubcompError::Cache(msg) => write!(f, "Matrix cache error: {}", msg),
        }
    }
}

impl std::error::Error for SubcompError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubcompError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for SubcompError {
    fn from(e: IoError) -> Self {
        SubcompError::Io(e)
    }
}

impl From<SubcompError> for IoError {
    fn from(e: SubcompError) -> Self {
        match e {
            SubcompError::Io(inner) => inner,
            SubcompError::InvalidInput(_) => {
                IoError::new(std::io::ErrorKind::InvalidInput, e.to_string())
            }
            other => IoError::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SubcompError>;
