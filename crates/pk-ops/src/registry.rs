//! The dispatch registry: `(op, dtype)` rows bound to kernel strategies,
//! with the reference backend behind every lookup.

use std::collections::HashMap;
use std::sync::Arc;

use pk_tensor::{DType, Tensor};

use crate::error::{OpError, Result};
use crate::kernel::{ExecContext, Kernel};
use crate::op::{OpKind, OpParams};
use crate::reference::ReferenceKernel;
use crate::tier::Tier;

/// A resolved kernel together with the tier it reported.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub kernel: Arc<dyn Kernel>,
    pub tier: Tier,
}

/// Explicit dispatch table owned by a session.
///
/// Rows are added during construction and never replaced. Lookups that
/// miss, or whose kernel reports [`Tier::Unsupported`] for the concrete
/// tensors, fall through to the reference backend.
#[derive(Debug)]
pub struct Registry {
    rows: HashMap<(OpKind, DType), Arc<dyn Kernel>>,
    reference: Arc<dyn Kernel>,
}

impl Registry {
    /// A registry holding only the reference backend.
    pub fn new() -> Self {
        Registry {
            rows: HashMap::new(),
            reference: Arc::new(ReferenceKernel),
        }
    }

    /// A registry with every vector kernel registered.
    pub fn with_vector_backend() -> Result<Self> {
        let mut registry = Registry::new();
        crate::vector::register(&mut registry)?;
        Ok(registry)
    }

    /// Bind `kernel` to `(op, dtype)`.
    ///
    /// # Errors
    /// Returns [`OpError::AlreadyRegistered`] if the pair already has a row.
    pub fn register(&mut self, op: OpKind, dtype: DType, kernel: Arc<dyn Kernel>) -> Result<()> {
        if self.rows.contains_key(&(op, dtype)) {
            return Err(OpError::AlreadyRegistered { op, dtype });
        }
        log::debug!("[registry] {op}/{dtype} -> {}", kernel.name());
        self.rows.insert((op, dtype), kernel);
        Ok(())
    }

    pub fn get(&self, op: OpKind, dtype: DType) -> Option<&Arc<dyn Kernel>> {
        self.rows.get(&(op, dtype))
    }

    pub fn contains(&self, op: OpKind, dtype: DType) -> bool {
        self.rows.contains_key(&(op, dtype))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn reference(&self) -> &Arc<dyn Kernel> {
        &self.reference
    }

    /// Pick the kernel for `op` on these tensors.
    ///
    /// The row is keyed by the first input's dtype. A row reporting an
    /// accelerated tier wins; a row that only reaches `Reference`, reports
    /// `Unsupported`, or is missing hands over to the reference backend.
    /// The returned kernel never reports `Unsupported` for `inputs`.
    ///
    /// # Errors
    /// Returns [`OpError::NoKernel`] when even the reference backend
    /// rejects the inputs, which only happens for malformed operands.
    pub fn resolve(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        ctx: &ExecContext,
    ) -> Result<Resolved> {
        let dtype = inputs
            .first()
            .map(|t| t.dtype())
            .ok_or(OpError::InputCount { op, expected: op.arity().0, got: 0 })?;

        if let Some(kernel) = self.get(op, dtype) {
            let tier = kernel.capability(op, inputs, params, ctx);
            if tier.is_accelerated() {
                log::debug!("[registry] {op}/{dtype}: {} at tier {tier}", kernel.name());
                return Ok(Resolved {
                    kernel: Arc::clone(kernel),
                    tier,
                });
            }
            if tier == Tier::Reference {
                log::debug!("[registry] {op}/{dtype}: {} delegates to the reference backend", kernel.name());
            } else {
                log::warn!(
                    "[registry] {op}/{dtype}: {} cannot run these operands, using the reference backend",
                    kernel.name()
                );
            }
        } else {
            log::warn!("[registry] {op}/{dtype}: no kernel registered, using the reference backend");
        }

        let tier = self.reference.capability(op, inputs, params, ctx);
        if !tier.is_supported() {
            return Err(OpError::NoKernel { op, dtype });
        }
        Ok(Resolved {
            kernel: Arc::clone(&self.reference),
            tier,
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Prepared;
    use crate::op::{Conv2dParams, PoolParams};
    use pk_tensor::{Shape, TensorSpec};

    /// Kernel that refuses everything.
    #[derive(Debug)]
    struct Never;

    impl Kernel for Never {
        fn name(&self) -> &'static str {
            "never"
        }

        fn capability(&self, _: OpKind, _: &[&Tensor], _: &OpParams, _: &ExecContext) -> Tier {
            Tier::Unsupported
        }

        fn init(
            &self,
            op: OpKind,
            _: &[&Tensor],
            _: &OpParams,
            _: &TensorSpec,
            _: &ExecContext,
        ) -> Result<Box<dyn Prepared>> {
            Err(OpError::NoKernel { op, dtype: DType::F32 })
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        registry.register(OpKind::Relu, DType::F32, Arc::new(Never)).unwrap();
        let err = registry.register(OpKind::Relu, DType::F32, Arc::new(Never)).unwrap_err();
        assert!(matches!(err, OpError::AlreadyRegistered { .. }));
        assert!(registry.register(OpKind::Relu, DType::F16, Arc::new(Never)).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unsupported_row_falls_back() {
        let mut registry = Registry::new();
        registry.register(OpKind::Relu, DType::F32, Arc::new(Never)).unwrap();
        let x = Tensor::zeros(Shape::from_slice(&[1, 4]));
        let r = registry
            .resolve(OpKind::Relu, &[&x], &OpParams::None, &ExecContext::default())
            .unwrap();
        assert_eq!(r.kernel.name(), "reference");
        assert_eq!(r.tier, Tier::Reference);
    }

    #[test]
    fn test_dispatch_monotonicity() {
        let registry = Registry::with_vector_backend().unwrap();
        let ctx = ExecContext::default();
        let x = Tensor::zeros(Shape::from_slice(&[1, 8, 6, 6]));
        let odd = Tensor::zeros(Shape::from_slice(&[1, 3, 6, 6]));
        let w = Tensor::zeros(Shape::from_slice(&[8, 8, 3, 3])).into_const();
        let w_odd = Tensor::zeros(Shape::from_slice(&[8, 3, 3, 3])).into_const();
        let conv: OpParams = Conv2dParams::new(3, 3).with_pad(1).into();
        let pool: OpParams = PoolParams::new(3, 1).into();

        let cases: Vec<(OpKind, Vec<&Tensor>, OpParams)> = vec![
            (OpKind::Conv2d, vec![&x, &w], conv),
            (OpKind::Conv2d, vec![&odd, &w_odd], conv),
            (OpKind::MaxPool2d, vec![&x], pool),
            (OpKind::MaxPool2d, vec![&odd], pool),
            (OpKind::Relu, vec![&x], OpParams::None),
            (OpKind::Add, vec![&x, &x], OpParams::None),
        ];
        for (op, inputs, params) in cases {
            let r = registry.resolve(op, &inputs, &params, &ctx).unwrap();
            assert!(r.tier.is_supported());
            assert_eq!(r.kernel.capability(op, &inputs, &params, &ctx), r.tier);
        }
    }

    #[test]
    fn test_malformed_inputs_have_no_kernel() {
        let registry = Registry::with_vector_backend().unwrap();
        let x = Tensor::zeros(Shape::from_slice(&[4]));
        let err = registry
            .resolve(OpKind::MaxPool2d, &[&x], &PoolParams::new(2, 2).into(), &ExecContext::default())
            .unwrap_err();
        assert!(matches!(err, OpError::NoKernel { .. }));
    }
}
