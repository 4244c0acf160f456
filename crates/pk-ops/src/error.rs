use thiserror::Error;

use crate::op::OpKind;

#[derive(Error, Debug)]
pub enum OpError {
    #[error("tensor error: {0}")]
    Tensor(#[from] pk_tensor::TensorError),
    #[error("{op}: {detail}")]
    UnsupportedBroadcast { op: OpKind, detail: String },
    #[error("invalid parameters for {op}: {detail}")]
    InvalidParams { op: OpKind, detail: String },
    #[error("{op} expects {expected} inputs, got {got}")]
    InputCount { op: OpKind, expected: usize, got: usize },
    #[error("no kernel can run {op} on {dtype}")]
    NoKernel { op: OpKind, dtype: pk_tensor::DType },
    #[error("node {0} has not been initialized")]
    NotInitialized(OpKind),
    #[error("a kernel for ({op}, {dtype}) is already registered")]
    AlreadyRegistered { op: OpKind, dtype: pk_tensor::DType },
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, OpError>;

impl OpError {
    pub(crate) fn invalid(op: OpKind, detail: impl Into<String>) -> Self {
        OpError::InvalidParams {
            op,
            detail: detail.into(),
        }
    }
}
