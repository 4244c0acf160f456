use std::fmt;

use crate::error::{Result, TensorError};

/// Highest rank a tensor may have, the trailing `C0` of a packed 3-D
/// volume included.
pub const MAX_DIMS: usize = 6;

/// Physical dimension sizes of a tensor.
///
/// For a packed tensor these are the blocked dimensions
/// `[N, C1, spatial.., C0]`; the logical channel count also needs the
/// tensor's channel tail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// Like [`Shape::new`], rejecting ranks above [`MAX_DIMS`].
    pub fn try_new(dims: Vec<usize>) -> Result<Self> {
        if dims.len() > MAX_DIMS {
            return Err(TensorError::TooManyDims(dims.len()));
        }
        Ok(Shape { dims })
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }

    /// `[batch, channels, spatial..]`.
    pub fn channel_major(batch: usize, channels: usize, spatial: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(spatial.len() + 2);
        dims.push(batch);
        dims.push(channels);
        dims.extend_from_slice(spatial);
        Shape { dims }
    }

    /// `[batch, channels / packn, spatial.., packn]`. Channels past the last
    /// full block live in the tensor's tail and are not counted here.
    pub fn blocked(batch: usize, channels: usize, spatial: &[usize], packn: usize) -> Self {
        let mut dims = Vec::with_capacity(spatial.len() + 3);
        dims.push(batch);
        dims.push(channels / packn);
        dims.extend_from_slice(spatial);
        dims.push(packn);
        Shape { dims }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Product of the dimensions; 1 for a rank-0 shape.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Right-aligned broadcast of two shapes: each pair of sizes must match
    /// or contain a 1, and missing leading dimensions count as 1.
    pub fn broadcast_shape(a: &Shape, b: &Shape) -> Result<Shape> {
        let rank = a.ndim().max(b.ndim());
        let padded = |s: &Shape, i: usize| {
            let lead = rank - s.ndim();
            if i < lead {
                1
            } else {
                s.dims[i - lead]
            }
        };
        (0..rank)
            .map(|i| match (padded(a, i), padded(b, i)) {
                (x, y) if x == y || y == 1 => Ok(x),
                (1, y) => Ok(y),
                _ => Err(TensorError::BroadcastError {
                    a: a.dims.clone(),
                    b: b.dims.clone(),
                }),
            })
            .collect::<Result<Vec<_>>>()
            .map(Shape::new)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}
