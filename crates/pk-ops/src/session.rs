//! Sessions own the registry and execution settings; nodes bind one
//! operator instance to the kernel resolved for its operands.
//!
//! ```text
//!   Session::new(config)
//!       │
//!   Node::new(op, params).setup(&session, inputs)   resolve + init, once
//!       │
//!   node.run(&session, inputs)                      exec, any number of times
//! ```

use std::sync::Arc;

use pk_kernels::{TilingParams, VectorProfile};
use pk_tensor::{QuantInfo, Tensor, TensorSpec};

use crate::error::{OpError, Result};
use crate::infer::output_spec;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::registry::Registry;
use crate::tier::Tier;

/// Execution settings of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Vector register width in bits.
    pub vlen_bits: usize,
    /// The target has int8 dot-product instructions.
    pub dot_product: bool,
    pub tiling: TilingParams,
    /// Constant weights were produced by [`Session::prepack_weights`].
    pub prepacked: bool,
    pub parallel: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            vlen_bits: 128,
            dot_product: false,
            tiling: TilingParams::default(),
            prepacked: false,
            parallel: true,
        }
    }
}

impl SessionConfig {
    pub fn with_vlen_bits(mut self, vlen_bits: usize) -> Self {
        self.vlen_bits = vlen_bits;
        self
    }

    pub fn with_dot_product(mut self, enabled: bool) -> Self {
        self.dot_product = enabled;
        self
    }

    pub fn with_tiling(mut self, tiling: TilingParams) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn with_prepacked(mut self, prepacked: bool) -> Self {
        self.prepacked = prepacked;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn context(&self) -> ExecContext {
        ExecContext {
            profile: VectorProfile::new(self.vlen_bits).with_dot_product(self.dot_product),
            tiling: self.tiling,
            parallel: self.parallel,
            prepacked: self.prepacked,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    ctx: ExecContext,
    registry: Registry,
}

impl Session {
    /// Session with the vector backend registered.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Ok(Self::with_registry(config, Registry::with_vector_backend()?))
    }

    pub fn with_registry(config: SessionConfig, registry: Registry) -> Self {
        let ctx = config.context();
        log::debug!(
            "[session] vlen={} dot={} parallel={} prepacked={} rows={}",
            ctx.profile.vlen_bits(),
            ctx.profile.has_dot_product(),
            ctx.parallel,
            ctx.prepacked,
            registry.len()
        );
        Session { config, ctx, registry }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn context(&self) -> &ExecContext {
        &self.ctx
    }

    pub fn profile(&self) -> &VectorProfile {
        &self.ctx.profile
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn node(&self, op: OpKind, params: impl Into<OpParams>) -> Node {
        Node::new(op, params)
    }

    /// Reorder the constant weights (`inputs[1]`) offline for the kernel
    /// that would run `op`. Feed the result to a session configured with
    /// `prepacked` set. `None` when that kernel keeps no offline layout.
    pub fn prepack_weights(&self, op: OpKind, inputs: &[&Tensor], params: &OpParams) -> Result<Option<Tensor>> {
        let resolved = self.registry.resolve(op, inputs, params, &self.ctx)?;
        let packed = resolved.kernel.prepack(op, inputs, params, &self.ctx)?;
        log::debug!(
            "[session] prepack {op} with {}: {}",
            resolved.kernel.name(),
            if packed.is_some() { "reordered" } else { "nothing to do" }
        );
        Ok(packed)
    }

    /// Set up and run a throwaway node.
    pub fn run_once(&self, op: OpKind, params: impl Into<OpParams>, inputs: &[&Tensor]) -> Result<Tensor> {
        let mut node = self.node(op, params);
        node.setup(self, inputs)?;
        node.run(self, inputs)
    }
}

/// What `setup` pinned on a node.
#[derive(Debug)]
struct Binding {
    kernel: Arc<dyn Kernel>,
    tier: Tier,
    plan: Box<dyn Prepared>,
    output: TensorSpec,
}

/// One operator instance.
#[derive(Debug)]
pub struct Node {
    op: OpKind,
    params: OpParams,
    output_qinfo: Option<Vec<QuantInfo>>,
    binding: Option<Binding>,
}

impl Node {
    pub fn new(op: OpKind, params: impl Into<OpParams>) -> Self {
        Node {
            op,
            params: params.into(),
            output_qinfo: None,
            binding: None,
        }
    }

    /// Output quantization; defaults to the first input's per-tensor entry.
    pub fn with_output_quant(mut self, qinfo: Vec<QuantInfo>) -> Self {
        self.output_qinfo = Some(qinfo);
        self
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn params(&self) -> &OpParams {
        &self.params
    }

    /// Resolve a kernel for `inputs` and run its one-time init.
    ///
    /// A node that is already set up keeps its binding.
    pub fn setup(&mut self, session: &Session, inputs: &[&Tensor]) -> Result<()> {
        let op = self.op;
        if self.binding.is_some() {
            log::debug!("[node] {op} already initialized, keeping its kernel");
            return Ok(());
        }
        let qinfo = match &self.output_qinfo {
            Some(q) => q.clone(),
            None => inputs.first().map(|t| vec![t.quant()]).unwrap_or_default(),
        };
        let output = output_spec(op, inputs, &self.params, qinfo)?;
        let ctx = session.context();
        let resolved = session.registry().resolve(op, inputs, &self.params, ctx)?;
        let plan = resolved.kernel.init(op, inputs, &self.params, &output, ctx)?;
        log::debug!(
            "[node] {op} -> {} at tier {} ({} MACs)",
            resolved.kernel.name(),
            resolved.tier,
            resolved.kernel.estimate(op, inputs, &self.params)
        );
        self.binding = Some(Binding {
            kernel: resolved.kernel,
            tier: resolved.tier,
            plan,
            output,
        });
        Ok(())
    }

    pub fn run(&self, session: &Session, inputs: &[&Tensor]) -> Result<Tensor> {
        let binding = self.binding.as_ref().ok_or(OpError::NotInitialized(self.op))?;
        binding.plan.exec(inputs, &binding.output, session.context())
    }

    pub fn is_initialized(&self) -> bool {
        self.binding.is_some()
    }

    pub fn tier(&self) -> Option<Tier> {
        self.binding.as_ref().map(|b| b.tier)
    }

    pub fn kernel_name(&self) -> Option<&'static str> {
        self.binding.as_ref().map(|b| b.kernel.name())
    }

    pub fn output_spec(&self) -> Option<&TensorSpec> {
        self.binding.as_ref().map(|b| &b.output)
    }
}
