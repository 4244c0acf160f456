//! `pk-kernels` - Compute kernels for the packed-kernel operator engine.
//!
//! This crate provides:
//! - `NCHW` ⇄ `NC1HWC0` packing at a register-derived block width
//! - Padding, im2col and col2im lowering for convolution
//! - A blocked GEMM micro-kernel family (f32, f16, int8, int4, mixed)
//! - Fixed-point requantization and zero-point fusion
//! - Depthwise convolution, pooling and broadcasting elementwise kernels
//!
//! Kernels operate on plain slices; tensor-level bookkeeping lives in
//! `pk-tensor` and operator dispatch in `pk-ops`.

pub mod depthwise;
pub mod element;
pub mod elementwise;
pub mod gemm;
pub mod im2col;
pub mod pack;
pub mod pad;
pub mod parallel;
pub mod pool;
pub mod profile;
pub mod quant;

pub use element::FloatElement;
pub use elementwise::BinaryOp;
pub use gemm::{GemmElement, TilingParams};
pub use im2col::ConvGeometry;
pub use pack::{pack, pack_inplace, try_pack_broadcast, unpack, unpack_inplace};
pub use pool::PoolKind;
pub use profile::VectorProfile;
pub use quant::ChannelRequant;
