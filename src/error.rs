//! Error types.

/// Ways that ray sampling and compositing can fail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RenderError {
    /// An index into a ray or a volume was out of range.
    #[error("index {index} out of range 0..{len}")]
    BadIndex {
        /// The offending index.
        index: i64,
        /// The exclusive upper bound.
        len: usize,
    },
    /// More variables were requested than a ray can hold.
    #[error("too many variables requested: {0}")]
    TooManyVariables(usize),
    /// Kernel accumulation was attempted without kernel based sampling.
    #[error("kernel based sampling is not enabled in the render context")]
    KernelSamplingDisabled,
    /// The requested compositing strategy cannot be used.
    #[error("invalid compositing strategy: {0}")]
    InvalidStrategy(String),
    /// A volume or patch message could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// The input mesh could not be turned into cells.
    #[error("mesh error: {0}")]
    Mesh(String),
    /// Writing or reading a file failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, RenderError>;

/// Shorthand to construct a [RenderError::BadIndex].
pub(crate) fn bad_index(index: impl TryInto<i64>, len: usize) -> RenderError {
    RenderError::BadIndex {
        index: index.try_into().unwrap_or(i64::MAX),
        len,
    }
}
