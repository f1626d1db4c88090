pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Dimension mismatch {hint}: {reason}")]
    DimensionMismatch { hint: String, reason: String },

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Index {index} out of range, length is {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("Final position (offset {offset} + size {size}) exceeds capacity {capacity}")]
    OutOfBounds { offset: u64, size: u64, capacity: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: '{0}'")]
    NotFound(String),

    #[error("Failed to open '{name}'")]
    OpenFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O failure {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid stream data: {0}")]
    InvalidFormat(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn dims(hint: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::DimensionMismatch {
            hint: hint.into(),
            reason: reason.into(),
        }
    }
}
