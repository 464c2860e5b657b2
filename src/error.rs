/// Crate-level error type for the cadenza accompaniment follower.
///
/// Only construction-time problems surface as errors. Runtime conditions
/// inside the real-time loop (bad frame shapes, dropped frames, end of
/// session) are counted or reported through return values instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid parameter value.
    #[error("invalid parameter `{name}`: got {value}, {reason}")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// Audio data is empty when a non-empty signal was required.
    #[error("audio data is empty")]
    EmptyAudio,

    /// Audio data contains non-finite values (NaN or Inf).
    #[error("audio data contains non-finite values")]
    NonFiniteAudio,

    /// Input array has incorrect shape for the operation.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// An array could not be built with the requested shape.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    /// A required dimension is zero or invalid.
    #[error("invalid size for `{name}`: {value} ({reason})")]
    InvalidSize {
        name: &'static str,
        value: usize,
        reason: &'static str,
    },

    /// A read asked the circular buffer for more frames than it holds.
    #[error("requested {requested} frames but only {available} are buffered")]
    InsufficientFrames { requested: usize, available: usize },

    /// Real FFT rejected its buffers.
    #[error(transparent)]
    Fft(#[from] realfft::FftError),

    /// Audio I/O errors.
    #[error(transparent)]
    Audio(#[from] crate::io::AudioError),

    /// Configuration could not be parsed or serialized.
    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// File I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, value: impl ToString, reason: &str) -> Self {
        Error::InvalidParameter {
            name,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience Result type for cadenza operations.
pub type Result<T> = std::result::Result<T, Error>;
