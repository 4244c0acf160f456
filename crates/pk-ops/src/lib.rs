//! `pk-ops` - Operator dispatch for the packed-kernel engine.
//!
//! This crate provides:
//! - Operator kinds, parameters and shape inference
//! - Capability tiers and the `(op, dtype)` dispatch registry
//! - A portable reference backend covering every op and dtype
//! - The vector backend: packed convolution, GEMM, pooling and elementwise
//! - `Session` and `Node` for one-time init and repeated execution

pub(crate) mod convert;
pub mod error;
pub mod infer;
pub mod kernel;
pub mod op;
pub mod reference;
pub mod registry;
pub mod session;
pub mod tier;
pub mod vector;

pub use error::{OpError, Result};
pub use infer::{infer_output, output_spec};
pub use kernel::{ExecContext, Kernel, Prepared};
pub use op::{Conv2dParams, MatMulParams, OpKind, OpParams, PoolParams};
pub use reference::ReferenceKernel;
pub use registry::{Registry, Resolved};
pub use session::{Node, Session, SessionConfig};
pub use tier::Tier;
