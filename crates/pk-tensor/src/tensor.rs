use std::sync::Arc;

use half::f16;

use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::layout::Layout;
use crate::quant::QuantInfo;
use crate::shape::{Shape, MAX_DIMS};
use crate::storage::CpuStorage;

/// A dense tensor: storage plus shape, layout tag and quantization info.
///
/// The storage sits behind an `Arc` so constant weights can be shared
/// between nodes without copies. Layout transforms never mutate a shared
/// buffer; they produce a new tensor value (or rewrite an exclusively owned
/// one through [`Tensor::storage_mut`]).
///
/// A packed tensor whose channel count is not a multiple of `packn` keeps
/// `C1 = C / packn` (rounded down) in its shape and stores the remaining
/// `channel_tail` channels as a narrower final block.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Arc<CpuStorage>,
    shape: Shape,
    layout: Layout,
    qinfo: Vec<QuantInfo>,
    channel_tail: usize,
    is_const: bool,
}

/// Descriptor of a tensor that has not been materialized yet.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
    pub layout: Layout,
    pub qinfo: Vec<QuantInfo>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape, layout: Layout) -> Self {
        TensorSpec {
            dtype,
            shape,
            layout,
            qinfo: vec![QuantInfo::default()],
        }
    }

    pub fn with_qinfo(mut self, qinfo: Vec<QuantInfo>) -> Self {
        self.qinfo = qinfo;
        self
    }

    /// Per-tensor (first) quantization entry.
    pub fn quant(&self) -> QuantInfo {
        self.qinfo.first().copied().unwrap_or_default()
    }
}

fn default_layout(rank: usize) -> Layout {
    Layout::canonical_for_rank(rank).unwrap_or(Layout::N)
}

impl Tensor {
    /// Create a new f32 tensor from data and a shape, in canonical layout.
    ///
    /// # Panics
    /// Panics if `data.len() != shape.numel()`.
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "data length {} does not match shape {:?} (numel={})",
            data.len(),
            shape,
            shape.numel()
        );
        let layout = default_layout(shape.ndim());
        Tensor {
            storage: Arc::new(CpuStorage::from_f32_vec(data)),
            shape,
            layout,
            qinfo: vec![QuantInfo::default()],
            channel_tail: 0,
            is_const: false,
        }
    }

    /// Create a tensor from storage, validating length, rank and layout.
    pub fn from_storage(storage: CpuStorage, shape: Shape, layout: Layout) -> Result<Self> {
        Self::from_parts(storage, shape, layout, 0)
    }

    /// Create a packed tensor that carries a `channel_tail` block.
    pub fn from_parts(
        storage: CpuStorage,
        shape: Shape,
        layout: Layout,
        channel_tail: usize,
    ) -> Result<Self> {
        validate(&storage, &shape, layout, channel_tail)?;
        Ok(Tensor {
            storage: Arc::new(storage),
            shape,
            layout,
            qinfo: vec![QuantInfo::default()],
            channel_tail,
            is_const: false,
        })
    }

    /// Create a zero-filled f32 tensor with the given shape.
    pub fn zeros(shape: Shape) -> Self {
        let n = shape.numel();
        Tensor::new(vec![0.0; n], shape)
    }

    /// Create an f32 tensor filled with ones with the given shape.
    pub fn ones(shape: Shape) -> Self {
        let n = shape.numel();
        Tensor::new(vec![1.0; n], shape)
    }

    pub fn from_f16(data: Vec<f16>, shape: Shape) -> Result<Self> {
        let layout = default_layout(shape.ndim());
        Self::from_storage(CpuStorage::F16(data), shape, layout)
    }

    pub fn from_i8(data: Vec<i8>, shape: Shape, qinfo: Vec<QuantInfo>) -> Result<Self> {
        let layout = default_layout(shape.ndim());
        Ok(Self::from_storage(CpuStorage::I8(data), shape, layout)?.with_qinfo(qinfo))
    }

    /// Create an int4 tensor from one value per element (each in `-8..=7`).
    pub fn from_i4(values: &[i8], shape: Shape, qinfo: Vec<QuantInfo>) -> Result<Self> {
        let layout = default_layout(shape.ndim());
        Ok(Self::from_storage(CpuStorage::from_i4_values(values), shape, layout)?.with_qinfo(qinfo))
    }

    pub fn from_i32(data: Vec<i32>, shape: Shape) -> Result<Self> {
        let layout = default_layout(shape.ndim());
        Self::from_storage(CpuStorage::I32(data), shape, layout)
    }

    /// Relabel the layout without moving data.
    pub fn with_layout(mut self, layout: Layout) -> Result<Self> {
        validate(&self.storage, &self.shape, layout, self.channel_tail)?;
        self.layout = layout;
        Ok(self)
    }

    pub fn with_qinfo(mut self, qinfo: Vec<QuantInfo>) -> Self {
        self.qinfo = qinfo;
        self
    }

    /// Mark the tensor as a shared, read-only constant (weights, bias).
    pub fn into_const(mut self) -> Self {
        self.is_const = true;
        self
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn is_const(&self) -> bool {
        self.is_const
    }

    pub fn channel_tail(&self) -> usize {
        self.channel_tail
    }

    pub fn qinfo(&self) -> &[QuantInfo] {
        &self.qinfo
    }

    /// Number of quantization entries; above one means channel-quantized.
    pub fn quant_channel(&self) -> usize {
        self.qinfo.len()
    }

    /// Per-tensor (first) quantization entry.
    pub fn quant(&self) -> QuantInfo {
        self.qinfo.first().copied().unwrap_or_default()
    }

    /// Quantization entry for channel `c`, falling back to the per-tensor
    /// entry when the tensor is not channel-quantized.
    pub fn qinfo_for_channel(&self, c: usize) -> QuantInfo {
        if self.qinfo.len() > 1 {
            self.qinfo.get(c).copied().unwrap_or_default()
        } else {
            self.quant()
        }
    }

    /// Batch (outer) dimension, or 1 for rank-0 tensors.
    pub fn batch(&self) -> usize {
        self.shape.dims().first().copied().unwrap_or(1)
    }

    /// Logical channel count, including any packed tail.
    pub fn channels(&self) -> usize {
        let dims = self.shape.dims();
        if self.layout.is_packed() {
            dims[1] * dims[dims.len() - 1] + self.channel_tail
        } else if self.layout.is_channel_last() {
            dims[dims.len() - 1]
        } else if dims.len() >= 2 {
            dims[1]
        } else {
            1
        }
    }

    /// Elements per channel per batch item.
    pub fn spatial_size(&self) -> usize {
        let dims = self.shape.dims();
        if self.layout.is_packed() {
            dims[2..dims.len() - 1].iter().product()
        } else if self.layout.is_channel_last() {
            dims[1..dims.len() - 1].iter().product()
        } else if dims.len() >= 2 {
            dims[2..].iter().product()
        } else {
            1
        }
    }

    /// Channel blocking factor of a packed tensor, 1 otherwise.
    pub fn packn(&self) -> usize {
        if self.layout.is_packed() {
            self.shape.dims()[self.shape.ndim() - 1]
        } else {
            1
        }
    }

    /// Number of stored elements.
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    /// Size of the data buffer in bytes.
    pub fn byte_size(&self) -> usize {
        self.storage.byte_size()
    }

    pub fn data_f32(&self) -> Result<&[f32]> {
        self.storage.as_f32_slice()
    }

    pub fn data_f16(&self) -> Result<&[f16]> {
        self.storage.as_f16_slice()
    }

    pub fn data_i8(&self) -> Result<&[i8]> {
        self.storage.as_i8_slice()
    }

    pub fn data_i32(&self) -> Result<&[i32]> {
        self.storage.as_i32_slice()
    }

    /// Returns the underlying storage reference.
    pub fn storage(&self) -> &CpuStorage {
        &self.storage
    }

    /// Exclusive access to the existing allocation.
    ///
    /// # Errors
    /// Returns [`TensorError::SharedStorage`] when another tensor holds the
    /// same buffer or the tensor is a constant.
    pub fn storage_mut(&mut self) -> Result<&mut CpuStorage> {
        if self.is_const {
            return Err(TensorError::SharedStorage);
        }
        Arc::get_mut(&mut self.storage).ok_or(TensorError::SharedStorage)
    }

    /// Replace shape, layout and tail together after the buffer has been
    /// rewritten in place.
    pub fn relabel(&mut self, shape: Shape, layout: Layout, channel_tail: usize) -> Result<()> {
        validate(&self.storage, &shape, layout, channel_tail)?;
        self.shape = shape;
        self.layout = layout;
        self.channel_tail = channel_tail;
        Ok(())
    }

    /// Descriptor of this tensor.
    pub fn spec(&self) -> TensorSpec {
        TensorSpec {
            dtype: self.dtype(),
            shape: self.shape.clone(),
            layout: self.layout,
            qinfo: self.qinfo.clone(),
        }
    }

    /// Reshape the tensor, returning a new tensor with the same data but
    /// a different shape and the canonical layout for the new rank.
    ///
    /// The total number of elements must remain the same.
    pub fn reshape(&self, new_shape: Shape) -> Result<Tensor> {
        if self.layout.is_packed() || self.shape.numel() != new_shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: new_shape.dims().to_vec(),
            });
        }
        let layout = default_layout(new_shape.ndim());
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            shape: new_shape,
            layout,
            qinfo: self.qinfo.clone(),
            channel_tail: 0,
            is_const: self.is_const,
        })
    }
}

fn validate(storage: &CpuStorage, shape: &Shape, layout: Layout, tail: usize) -> Result<()> {
    if shape.ndim() > MAX_DIMS {
        return Err(TensorError::TooManyDims(shape.ndim()));
    }
    if layout.rank() != shape.ndim() {
        return Err(TensorError::LayoutMismatch {
            expected: format!("rank-{} layout", shape.ndim()),
            got: layout.to_string(),
        });
    }
    let expected = if layout.is_packed() {
        let dims = shape.dims();
        let packn = dims[dims.len() - 1];
        if tail >= packn.max(1) {
            return Err(TensorError::Other(format!(
                "channel tail {} must be smaller than packn {}",
                tail, packn
            )));
        }
        let inner: usize = dims[2..dims.len() - 1].iter().product();
        dims[0] * (dims[1] * packn + tail) * inner
    } else {
        if tail != 0 {
            return Err(TensorError::Other(
                "only packed layouts carry a channel tail".to_string(),
            ));
        }
        shape.numel()
    };
    if storage.len() != expected {
        return Err(TensorError::LengthMismatch {
            expected,
            got: storage.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tensor() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![2, 3]));
        assert_eq!(t.shape().ndim(), 2);
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.layout(), Layout::NC);
        assert_eq!(t.channels(), 3);
        assert_eq!(t.data_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_zeros_ones() {
        let z = Tensor::zeros(Shape::new(vec![2, 3]));
        assert_eq!(z.data_f32().unwrap(), &[0.0; 6]);

        let o = Tensor::ones(Shape::new(vec![3]));
        assert_eq!(o.data_f32().unwrap(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_byte_size() {
        let t = Tensor::new(vec![0.0; 24], Shape::new(vec![1, 2, 3, 4]));
        assert_eq!(t.byte_size(), 4 * 24);
        let q = Tensor::from_i4(&[1, 2, 3], Shape::new(vec![3]), vec![]).unwrap();
        assert_eq!(q.byte_size(), 2);
    }

    #[test]
    fn test_reshape() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![2, 3]));
        let r = t.reshape(Shape::new(vec![3, 2])).unwrap();
        assert_eq!(r.shape().dims(), &[3, 2]);
        assert_eq!(r.data_f32().unwrap(), t.data_f32().unwrap());
    }

    #[test]
    fn test_reshape_mismatch() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0], Shape::new(vec![3]));
        assert!(t.reshape(Shape::new(vec![2, 2])).is_err());
    }

    #[test]
    #[should_panic]
    fn test_new_shape_mismatch_panics() {
        let _t = Tensor::new(vec![1.0, 2.0], Shape::new(vec![3]));
    }

    #[test]
    fn test_packed_tail_geometry() {
        // 6 channels at packn 4: one full block plus a tail of 2
        let t = Tensor::from_parts(
            CpuStorage::zeros(DType::F32, 6 * 3),
            Shape::new(vec![1, 1, 3, 4]),
            Layout::NC1WC0,
            2,
        )
        .unwrap();
        assert_eq!(t.channels(), 6);
        assert_eq!(t.spatial_size(), 3);
        assert_eq!(t.packn(), 4);
    }

    #[test]
    fn test_layout_rank_checked() {
        let t = Tensor::new(vec![0.0; 4], Shape::new(vec![2, 2]));
        assert!(t.clone().with_layout(Layout::NCHW).is_err());
        assert_eq!(t.with_layout(Layout::OI).unwrap().layout(), Layout::OI);
    }

    #[test]
    fn test_channel_qinfo_lookup() {
        let q = vec![QuantInfo::new(0.5, 0), QuantInfo::new(0.25, 1)];
        let t = Tensor::from_i8(vec![0; 2], Shape::new(vec![2, 1]), q).unwrap();
        assert_eq!(t.qinfo_for_channel(1).zero_point, 1);
        let single = t.clone().with_qinfo(vec![QuantInfo::new(2.0, 3)]);
        assert_eq!(single.qinfo_for_channel(1).zero_point, 3);
    }

    #[test]
    fn test_shared_storage_not_writable() {
        let mut t = Tensor::new(vec![1.0], Shape::new(vec![1]));
        let alias = t.clone();
        assert!(matches!(t.storage_mut(), Err(TensorError::SharedStorage)));
        drop(alias);
        assert!(t.storage_mut().is_ok());
    }

    #[test]
    fn test_f16_storage() {
        let data: Vec<f16> = [0.1f32, -2.5, 3.75].iter().map(|&v| f16::from_f32(v)).collect();
        let t = Tensor::from_f16(data, Shape::new(vec![3])).unwrap();
        assert_eq!(t.dtype(), DType::F16);
        assert_eq!(t.byte_size(), 6);
        for (got, want) in t.data_f16().unwrap().iter().zip([0.1f32, -2.5, 3.75]) {
            approx::assert_abs_diff_eq!(got.to_f32(), want, epsilon = 1e-3);
        }
    }
}
