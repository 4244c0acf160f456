//! `pk-tensor` - Tensor descriptors for the packed-kernel operator engine.
//!
//! This crate provides:
//! - A `Tensor` value: storage, shape, layout tag and quantization info
//! - Canonical and channel-blocked (`NC1HWC0`-family) layout tags
//! - Data type definitions (F32, F16, Int8, Int4, Int32)
//! - Shape utilities and broadcasting
//! - A scratch-allocation shim with recoverable allocation failure

pub mod dtype;
pub mod error;
pub mod layout;
pub mod quant;
pub mod scratch;
pub mod shape;
pub mod storage;
pub mod tensor;

// Re-export primary types at the crate root for convenience.
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use layout::Layout;
pub use quant::QuantInfo;
pub use shape::Shape;
pub use storage::CpuStorage;
pub use tensor::{Tensor, TensorSpec};
