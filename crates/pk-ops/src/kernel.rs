//! Kernel strategy objects.
//!
//! A [`Kernel`] is registered once per `(op, dtype)` pair. It answers the
//! capability query for concrete tensors and, at init, returns a
//! [`Prepared`] plan holding any reordered constant operands. The plan is
//! cached on the node and executed on every run.

use std::fmt::Debug;

use pk_kernels::{TilingParams, VectorProfile};
use pk_tensor::{Tensor, TensorSpec};

use crate::error::Result;
use crate::infer::estimate_macs;
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

/// Session-wide settings every kernel sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecContext {
    pub profile: VectorProfile,
    pub tiling: TilingParams,
    /// Fan groups and channel blocks out over the worker pool.
    pub parallel: bool,
    /// Constant weights already carry the kernel's reordered layout.
    pub prepacked: bool,
}

impl Default for ExecContext {
    fn default() -> Self {
        ExecContext {
            profile: VectorProfile::default(),
            tiling: TilingParams::default(),
            parallel: true,
            prepacked: false,
        }
    }
}

impl ExecContext {
    /// Block sizes for a GEMM that runs alone, with m-block fan-out.
    pub fn gemm_tiling(&self) -> TilingParams {
        self.tiling.with_parallel(self.parallel)
    }
}

/// An operator implementation for one or more `(op, dtype)` rows.
pub trait Kernel: Send + Sync + Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// How well this kernel runs `op` on these exact tensors.
    ///
    /// Must be pure: it is probed speculatively during resolution.
    fn capability(&self, op: OpKind, inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext) -> Tier;

    /// One-time preparation: validate, reorder constant operands and pick
    /// the exec path.
    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        output: &TensorSpec,
        ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>>;

    /// Rough cost of one run, in multiply-accumulates.
    fn estimate(&self, op: OpKind, inputs: &[&Tensor], params: &OpParams) -> u64 {
        estimate_macs(op, inputs, params)
    }

    /// Reorder constant weights offline into the layout `init` consumes
    /// when the session marks weights as pre-packed. `None` when the kernel
    /// has no such layout for this configuration.
    fn prepack(
        &self,
        _op: OpKind,
        _inputs: &[&Tensor],
        _params: &OpParams,
        _ctx: &ExecContext,
    ) -> Result<Option<Tensor>> {
        Ok(None)
    }
}

/// Exec strategy pinned on a node by [`Kernel::init`].
pub trait Prepared: Send + Sync + Debug {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor>;
}
