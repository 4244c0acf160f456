//! Regular and grouped convolution on the blocked GEMM.
//!
//! Each `(batch item, group)` pair is one GEMM: the group's reordered
//! weights on the left, the group's columns on the right. Columns come
//! straight from the input for pointwise kernels and from im2col
//! otherwise, blocked when the channels split evenly. Weights are read in
//! the reduction order of the columns they meet.

use pk_kernels::gemm::int8::{requantize_rows, requantize_rows_i4, Int8Path};
use pk_kernels::gemm::mixed::QuantizedLhs;
use pk_kernels::gemm::{gemm_blocked, reorder_a_with, reorder_b_with};
use pk_kernels::parallel::try_for_each_chunk;
use pk_kernels::{pack, unpack, ChannelRequant, ConvGeometry, TilingParams};
use pk_tensor::{scratch, CpuStorage, DType, Tensor, TensorSpec};

use crate::error::{OpError, Result};
use crate::infer::logical_dims;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

use super::capability::{self, ColumnMode};
use super::columns::{k_split, Columns};
use super::{finish, float_values, int8_values, rejected, VecFloat};

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorConv;

impl Kernel for VectorConv {
    fn name(&self) -> &'static str {
        "vector_conv2d"
    }

    fn capability(&self, op: OpKind, inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext) -> Tier {
        capability::conv(op, inputs, params, ctx).0
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        output: &TensorSpec,
        ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        let (tier, mode) = capability::conv(op, inputs, params, ctx);
        if !tier.is_supported() {
            return Err(rejected(op, inputs));
        }
        let shape = ConvShape::new(op, inputs, params, ctx, mode)?;
        log::debug!(
            "[vector_conv2d] {op} {} {mode:?} tier={tier} groups={} m={} k={} n={}",
            inputs[0].dtype(),
            shape.groups,
            shape.ocg,
            shape.kdim,
            shape.geo.out_size()
        );
        Ok(match inputs[0].dtype() {
            DType::F32 => Box::new(FloatPlan::<f32>::new(inputs, shape, ctx)?),
            DType::F16 => Box::new(FloatPlan::<half::f16>::new(inputs, shape, ctx)?),
            DType::Int8 | DType::Int4 => Box::new(QuantPlan::new(op, inputs, output, shape, ctx)?),
            DType::Int32 => return Err(rejected(op, inputs)),
        })
    }

    fn prepack(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        ctx: &ExecContext,
    ) -> Result<Option<Tensor>> {
        let (tier, mode) = capability::conv(op, inputs, params, ctx);
        if !tier.is_accelerated() || !takes_prepacked(inputs) {
            return Ok(None);
        }
        let shape = ConvShape::new(op, inputs, params, ctx, mode)?;
        let w = inputs[1];
        let storage = match w.dtype() {
            DType::F32 => f32::into_storage(reorder_weights(&float_values::<f32>(w)?, &shape, &ctx.tiling)?),
            DType::F16 => {
                half::f16::into_storage(reorder_weights(&float_values::<half::f16>(w)?, &shape, &ctx.tiling)?)
            }
            _ => return Ok(None),
        };
        let packed = Tensor::from_storage(storage, w.shape().clone(), w.layout())?.into_const();
        Ok(Some(packed))
    }
}

/// Float weights of the activation dtype are the only ones with an
/// offline layout; quantized weights are always prepared at init.
fn takes_prepacked(inputs: &[&Tensor]) -> bool {
    let (x, w) = (inputs[0], inputs[1]);
    x.dtype().is_float() && w.dtype() == x.dtype()
}

/// Per-group GEMM dimensions.
#[derive(Debug, Clone, Copy)]
struct ConvShape {
    mode: ColumnMode,
    geo: ConvGeometry,
    batch: usize,
    groups: usize,
    /// Input channels per group.
    icg: usize,
    /// Output channels per group (GEMM M).
    ocg: usize,
    /// Reduction length (GEMM K).
    kdim: usize,
    /// Column tile width.
    gemm_packn: usize,
}

impl ConvShape {
    fn new(op: OpKind, inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext, mode: ColumnMode) -> Result<Self> {
        let p = params.conv(op)?;
        let (x, w) = (inputs[0], inputs[1]);
        let xd = logical_dims(x);
        let geo = p
            .geometry(xd[2], xd[3])
            .ok_or_else(|| OpError::invalid(op, "kernel does not fit the padded input"))?;
        let groups = p.groups.max(1);
        let icg = xd[1] / groups;
        Ok(ConvShape {
            mode,
            geo,
            batch: xd[0],
            groups,
            icg,
            ocg: w.shape().dim(0) / groups,
            kdim: icg * geo.maxk(),
            gemm_packn: ctx.profile.packn(x.dtype()),
        })
    }

    /// Offset of weight `[g*ocg + r, c, kk]` for reduction index `kidx`.
    fn weight_index(&self, g: usize, r: usize, kidx: usize) -> usize {
        let maxk = self.geo.maxk();
        let (c, kk) = k_split(self.mode, kidx, self.icg, maxk);
        ((g * self.ocg + r) * self.icg + c) * maxk + kk
    }

    fn units(&self) -> usize {
        self.batch * self.groups
    }

    fn out_chunk(&self) -> usize {
        self.ocg * self.geo.out_size()
    }

    /// Input planes of `unit`; channel blocks never straddle groups.
    fn group_input<'a, T>(&self, src: &'a [T], unit: usize) -> &'a [T] {
        let plane = self.icg * self.geo.in_size();
        let (b, g) = (unit / self.groups, unit % self.groups);
        &src[(b * self.groups + g) * plane..][..plane]
    }

    /// Units fan out when there are several; a lone GEMM fans out its
    /// m blocks instead.
    fn tiling(&self, ctx: &ExecContext) -> TilingParams {
        if self.units() > 1 {
            ctx.tiling.with_parallel(false)
        } else {
            ctx.gemm_tiling()
        }
    }
}

/// Bring the input into the layout `mode` reads.
fn columns_input(x: &Tensor, mode: ColumnMode) -> pk_tensor::Result<Tensor> {
    match mode {
        ColumnMode::Direct { packn } | ColumnMode::Packed { packn } if packn > 1 => pack(x, packn),
        _ => unpack(x),
    }
}

fn reorder_weights<T: VecFloat>(w: &[T], shape: &ConvShape, tiling: &TilingParams) -> Result<Vec<T>> {
    let per_group = shape.ocg * shape.kdim;
    let mut out = scratch::alloc(shape.groups * per_group)?;
    for (g, dst) in out.chunks_exact_mut(per_group).enumerate() {
        reorder_a_with(dst, shape.ocg, shape.kdim, tiling, |r, kidx| w[shape.weight_index(g, r, kidx)]);
    }
    Ok(out)
}

#[derive(Debug)]
struct FloatPlan<T> {
    shape: ConvShape,
    weights: Vec<T>,
    bias: Option<Vec<T>>,
}

impl<T: VecFloat> FloatPlan<T> {
    fn new(inputs: &[&Tensor], shape: ConvShape, ctx: &ExecContext) -> Result<Self> {
        let w = inputs[1];
        let weights = if ctx.prepacked && takes_prepacked(inputs) {
            T::slice(w)?.to_vec()
        } else {
            reorder_weights(&float_values::<T>(w)?, &shape, &ctx.tiling)?
        };
        let bias = inputs.get(2).map(|b| float_values::<T>(b)).transpose()?;
        Ok(FloatPlan { shape, weights, bias })
    }
}

impl<T: VecFloat> Prepared for FloatPlan<T> {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let s = &self.shape;
        let x = columns_input(inputs[0], s.mode)?;
        let src = T::slice(&x)?;
        let n = s.geo.out_size();
        let tiling = s.tiling(ctx);
        let mut out = scratch::alloc::<T>(s.units() * s.out_chunk())?;

        try_for_each_chunk(&mut out, s.out_chunk(), ctx.parallel, |unit, dst| {
            let g = unit % s.groups;
            let cols = Columns::build(s.mode, s.group_input(src, unit), s.icg, &s.geo, T::default())?;
            let mut sb = scratch::alloc(s.kdim * n)?;
            reorder_b_with(&mut sb, s.kdim, n, s.gemm_packn, &tiling, |p, j| cols.at(p, j));
            let sa = &self.weights[g * s.ocg * s.kdim..][..s.ocg * s.kdim];
            let bias = self.bias.as_deref().map(|b| &b[g * s.ocg..][..s.ocg]);
            gemm_blocked(dst, sa, &sb, bias, s.ocg, s.kdim, n, s.gemm_packn, &tiling);
            Ok(())
        })?;
        finish(T::into_storage(out), output, inputs[0])
    }
}

/// Int8 and int4 plans; int4 operands are widened and run the int8 kernels.
#[derive(Debug)]
struct QuantPlan {
    shape: ConvShape,
    lhs: Vec<QuantizedLhs>,
    folded: Vec<Vec<i32>>,
    requant: ChannelRequant,
    x_zp: i32,
    /// Stored value of padded taps.
    pad: i8,
    int4: bool,
}

impl QuantPlan {
    fn new(
        op: OpKind,
        inputs: &[&Tensor],
        output: &TensorSpec,
        shape: ConvShape,
        ctx: &ExecContext,
    ) -> Result<Self> {
        let (x, w) = (inputs[0], inputs[1]);
        let x_zp = x.quant().zero_point;
        let pad = i8::try_from(x_zp)
            .map_err(|_| OpError::invalid(op, format!("input zero point {x_zp} does not fit the stored type")))?;
        let weights = int8_values(w)?;
        let bias = inputs.get(2).map(|b| b.data_i32()).transpose()?;
        let path = Int8Path::for_profile(&ctx.profile);
        let (ocg, kdim) = (shape.ocg, shape.kdim);

        let mut lhs = Vec::with_capacity(shape.groups);
        let mut folded = Vec::with_capacity(shape.groups);
        for g in 0..shape.groups {
            let mut rows = scratch::alloc(ocg * kdim)?;
            for (r, row) in rows.chunks_exact_mut(kdim).enumerate() {
                for (kidx, v) in row.iter_mut().enumerate() {
                    *v = weights[shape.weight_index(g, r, kidx)];
                }
            }
            let zero_points = match w.qinfo() {
                [] => vec![0],
                [q] => vec![q.zero_point],
                per_channel => per_channel[g * ocg..][..ocg].iter().map(|q| q.zero_point).collect(),
            };
            let group = QuantizedLhs::prepare(&rows, ocg, kdim, zero_points, path)?;
            folded.push(group.folded_bias(bias.map(|b| &b[g * ocg..][..ocg]), x_zp));
            lhs.push(group);
        }
        Ok(QuantPlan {
            shape,
            lhs,
            folded,
            requant: ChannelRequant::resolve(x.quant(), w.qinfo(), output.quant()),
            x_zp,
            pad,
            int4: x.dtype() == DType::Int4,
        })
    }
}

/// Int4 activations widened to int8, keeping layout and quant entries.
fn widen_activations(x: &Tensor) -> Result<Tensor> {
    let values = x.storage().to_i4_values()?;
    let t = Tensor::from_parts(CpuStorage::I8(values), x.shape().clone(), x.layout(), x.channel_tail())?;
    Ok(t.with_qinfo(x.qinfo().to_vec()))
}

impl Prepared for QuantPlan {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let s = &self.shape;
        let x = if self.int4 {
            widen_activations(inputs[0])?
        } else {
            inputs[0].clone()
        };
        let x = columns_input(&x, s.mode)?;
        let src = x.data_i8()?;
        let n = s.geo.out_size();
        let out_zp = output.quant().zero_point;
        let requantize = if self.int4 { requantize_rows_i4 } else { requantize_rows };
        let mut out = scratch::alloc::<i8>(s.units() * s.out_chunk())?;

        try_for_each_chunk(&mut out, s.out_chunk(), ctx.parallel, |unit, dst| {
            let g = unit % s.groups;
            let lhs = &self.lhs[g];
            let cols = Columns::build(s.mode, s.group_input(src, unit), s.icg, &s.geo, self.pad)?;
            let mut sb = scratch::alloc(n * lhs.path.reduction_len(s.kdim))?;
            lhs.path.reorder_b_with(&mut sb, s.kdim, n, s.gemm_packn, |p, j| cols.at(p, j));
            let col_sums = if lhs.zero_points.iter().any(|&z| z != 0) {
                cols.col_sums(s.kdim, n)
            } else {
                Vec::new()
            };
            let mut acc = scratch::alloc::<i32>(s.ocg * n)?;
            lhs.gemm(&mut acc, &sb, n, s.gemm_packn, &self.folded[g], &col_sums);
            requantize(&acc, dst, n, None, &self.requant, g * s.ocg, out_zp);
            Ok(())
        })?;

        let storage = if self.int4 {
            CpuStorage::from_i4_values(&out)
        } else {
            CpuStorage::I8(out)
        };
        finish(storage, output, inputs[0])
    }
}
