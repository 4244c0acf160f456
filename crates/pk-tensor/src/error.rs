use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: String, got: String },
    #[error("layout mismatch: expected {expected}, got {got}")]
    LayoutMismatch { expected: String, got: String },
    #[error("invalid axis {axis} for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },
    #[error("cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },
    #[error("tensor rank {0} exceeds the maximum of {max}", max = crate::shape::MAX_DIMS)]
    TooManyDims(usize),
    #[error("channel count {channels} is not a multiple of {packn}")]
    ChannelNotDivisible { channels: usize, packn: usize },
    #[error("buffer length {got} does not match {expected} elements")]
    LengthMismatch { expected: usize, got: usize },
    #[error("failed to allocate {bytes} bytes of scratch memory")]
    Allocation { bytes: usize },
    #[error("storage is shared and cannot be rewritten in place")]
    SharedStorage,
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
