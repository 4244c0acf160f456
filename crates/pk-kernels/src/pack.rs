//! Conversions between canonical channel-major layouts and channel-blocked
//! (`NC1..C0`) layouts.
//!
//! A packed batch item stores `C1 = C / packn` full blocks followed by an
//! optional tail block of `C % packn` channels. Inside a block the channel
//! lanes of one spatial position are contiguous:
//!
//! ```text
//!   canonical  [C, S]            packed  [C1, S, packn] ++ [S, tail]
//!   c0: s0 s1 s2 ...             block0: s0(c0..c3) s1(c0..c3) ...
//!   c1: s0 s1 s2 ...             tail:   s0(c4 c5)  s1(c4 c5)  ...
//! ```
//!
//! The tail block is narrower, never zero padded.

use pk_tensor::scratch;
use pk_tensor::{CpuStorage, Layout, Result, Shape, Tensor, TensorError};

/// Offset of channel `c` at spatial position `s` inside one packed batch
/// item. With `packn == 1` this is the canonical offset.
#[inline]
pub fn packed_offset(c: usize, s: usize, channels: usize, inner: usize, packn: usize) -> usize {
    let block = c / packn;
    let width = packn.min(channels - block * packn);
    block * packn * inner + s * width + c % packn
}

/// Canonical `[C, S]` to packed, one batch item.
pub fn pack1ton<T: Copy>(src: &[T], dst: &mut [T], channels: usize, inner: usize, packn: usize) {
    let mut out = 0;
    let mut c0 = 0;
    while c0 < channels {
        let vl = packn.min(channels - c0);
        for s in 0..inner {
            for lane in 0..vl {
                dst[out] = src[(c0 + lane) * inner + s];
                out += 1;
            }
        }
        c0 += vl;
    }
}

/// Packed to canonical `[C, S]`, one batch item.
pub fn packnto1<T: Copy>(src: &[T], dst: &mut [T], channels: usize, inner: usize, packn: usize) {
    let mut idx = 0;
    let mut c0 = 0;
    while c0 < channels {
        let vl = packn.min(channels - c0);
        for s in 0..inner {
            for lane in 0..vl {
                dst[(c0 + lane) * inner + s] = src[idx];
                idx += 1;
            }
        }
        c0 += vl;
    }
}

/// Re-block between two packing factors, one batch item.
pub fn packnton<T: Copy>(
    src: &[T],
    dst: &mut [T],
    channels: usize,
    inner: usize,
    from: usize,
    to: usize,
) {
    for c in 0..channels {
        for s in 0..inner {
            dst[packed_offset(c, s, channels, inner, to)] =
                src[packed_offset(c, s, channels, inner, from)];
        }
    }
}

/// Geometry of a batch of channel planes.
#[derive(Debug, Clone, Copy)]
struct Relayout {
    batch: usize,
    channels: usize,
    inner: usize,
    from: usize,
    to: usize,
}

impl Relayout {
    fn apply<T: Copy>(&self, src: &[T], dst: &mut [T]) {
        let item = self.channels * self.inner;
        if item == 0 {
            return;
        }
        for (s, d) in src.chunks_exact(item).zip(dst.chunks_exact_mut(item)).take(self.batch) {
            match (self.from, self.to) {
                (f, t) if f == t => d.copy_from_slice(s),
                (1, t) => pack1ton(s, d, self.channels, self.inner, t),
                (f, 1) => packnto1(s, d, self.channels, self.inner, f),
                (f, t) => packnton(s, d, self.channels, self.inner, f, t),
            }
        }
    }

    fn run<T: Copy + Default>(&self, src: &[T]) -> Result<Vec<T>> {
        let mut dst = scratch::alloc(src.len())?;
        self.apply(src, &mut dst);
        Ok(dst)
    }

    fn storage(&self, src: &CpuStorage) -> Result<CpuStorage> {
        Ok(match src {
            CpuStorage::F32(v) => CpuStorage::F32(self.run(v)?),
            CpuStorage::F16(v) => CpuStorage::F16(self.run(v)?),
            CpuStorage::I8(v) => CpuStorage::I8(self.run(v)?),
            CpuStorage::I32(v) => CpuStorage::I32(self.run(v)?),
            CpuStorage::I4 { .. } => CpuStorage::from_i4_values(&self.run(&src.to_i4_values()?)?),
        })
    }
}

/// Target shape, layout and tail of a packing step.
struct Target {
    relayout: Relayout,
    shape: Shape,
    layout: Layout,
    tail: usize,
}

fn spatial_dims(t: &Tensor) -> &[usize] {
    let dims = t.shape().dims();
    if t.layout().is_packed() {
        &dims[2..dims.len() - 1]
    } else {
        &dims[2..]
    }
}

fn pack_target(t: &Tensor, packn: usize) -> Result<Target> {
    if packn == 0 {
        return Err(TensorError::Other("packn must be non-zero".to_string()));
    }
    let layout = if t.layout().is_packed() {
        t.layout()
    } else {
        t.layout().activation_equivalent()
    };
    let packed = layout.packed().ok_or_else(|| TensorError::LayoutMismatch {
        expected: "channel-major layout of rank 2..=5".to_string(),
        got: t.layout().to_string(),
    })?;
    let channels = t.channels();
    let spatial = spatial_dims(t);
    Ok(Target {
        relayout: Relayout {
            batch: t.batch(),
            channels,
            inner: t.spatial_size(),
            from: t.packn(),
            to: packn,
        },
        shape: Shape::blocked(t.batch(), channels, spatial, packn),
        layout: packed,
        tail: channels % packn,
    })
}

fn unpack_target(t: &Tensor) -> Result<Target> {
    if !t.layout().is_packed() {
        return Err(TensorError::LayoutMismatch {
            expected: "packed layout".to_string(),
            got: t.layout().to_string(),
        });
    }
    Ok(Target {
        relayout: Relayout {
            batch: t.batch(),
            channels: t.channels(),
            inner: t.spatial_size(),
            from: t.packn(),
            to: 1,
        },
        shape: Shape::channel_major(t.batch(), t.channels(), spatial_dims(t)),
        layout: t.layout().unpacked(),
        tail: 0,
    })
}

fn materialize(t: &Tensor, target: Target) -> Result<Tensor> {
    log::trace!("[pack] {} {} -> {} {}", t.layout(), t.shape(), target.layout, target.shape);
    let storage = target.relayout.storage(t.storage())?;
    let out = Tensor::from_parts(storage, target.shape, target.layout, target.tail)?
        .with_qinfo(t.qinfo().to_vec());
    Ok(if t.is_const() { out.into_const() } else { out })
}

fn copy_back(t: &mut Tensor, target: Target) -> Result<()> {
    log::trace!("[pack] in place {} {} -> {} {}", t.layout(), t.shape(), target.layout, target.shape);
    let fresh = target.relayout.storage(t.storage())?;
    let dst = t.storage_mut()?;
    match (dst, &fresh) {
        (CpuStorage::F32(d), CpuStorage::F32(s)) => d.copy_from_slice(s),
        (CpuStorage::F16(d), CpuStorage::F16(s)) => d.copy_from_slice(s),
        (CpuStorage::I8(d), CpuStorage::I8(s)) => d.copy_from_slice(s),
        (CpuStorage::I32(d), CpuStorage::I32(s)) => d.copy_from_slice(s),
        (CpuStorage::I4 { bytes: d, .. }, CpuStorage::I4 { bytes: s, .. }) => d.copy_from_slice(s),
        _ => return Err(TensorError::Other("storage type changed while packing".to_string())),
    }
    t.relabel(target.shape, target.layout, target.tail)
}

/// Pack a canonical (or differently packed) tensor at `packn`, returning a
/// new tensor value.
///
/// Weight layouts are relabelled to their activation equivalent first.
/// A channel count that is not a multiple of `packn` produces a tail block.
pub fn pack(t: &Tensor, packn: usize) -> Result<Tensor> {
    if t.layout().is_packed() && t.packn() == packn {
        return Ok(t.clone());
    }
    let target = pack_target(t, packn)?;
    materialize(t, target)
}

/// Unpack to the canonical layout, returning a new tensor value.
pub fn unpack(t: &Tensor) -> Result<Tensor> {
    if !t.layout().is_packed() {
        return Ok(t.clone());
    }
    materialize(t, unpack_target(t)?)
}

/// Pack into the tensor's existing allocation.
///
/// Fails with [`TensorError::SharedStorage`] when the buffer is shared.
pub fn pack_inplace(t: &mut Tensor, packn: usize) -> Result<()> {
    if t.layout().is_packed() && t.packn() == packn {
        return Ok(());
    }
    let target = pack_target(t, packn)?;
    copy_back(t, target)
}

/// Unpack into the tensor's existing allocation.
pub fn unpack_inplace(t: &mut Tensor) -> Result<()> {
    if !t.layout().is_packed() {
        return Ok(());
    }
    let target = unpack_target(t)?;
    copy_back(t, target)
}

/// Pack an elementwise-broadcast operand.
///
/// Channels divisible by `packn` are packed normally; a single channel is
/// relabelled with a block width of one, keeping element order. Anything else
/// cannot be broadcast against a packed operand.
pub fn try_pack_broadcast(t: &Tensor, packn: usize) -> Result<Tensor> {
    if t.layout().is_packed() {
        return Ok(t.clone());
    }
    let channels = t.channels();
    if channels % packn == 0 {
        return pack(t, packn);
    }
    if channels == 1 {
        let layout = t
            .layout()
            .activation_equivalent()
            .packed()
            .ok_or_else(|| TensorError::LayoutMismatch {
                expected: "channel-major layout of rank 2..=5".to_string(),
                got: t.layout().to_string(),
            })?;
        let shape = Shape::blocked(t.batch(), 1, spatial_dims(t), 1);
        let out = Tensor::from_parts(t.storage().clone(), shape, layout, 0)?
            .with_qinfo(t.qinfo().to_vec());
        return Ok(out);
    }
    Err(TensorError::ChannelNotDivisible { channels, packn })
}
