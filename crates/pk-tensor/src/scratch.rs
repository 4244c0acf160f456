//! Scratch-buffer shim used by every layout transform and lowering step.
//!
//! Buffers are plain `Vec`s, so they are released on every exit path,
//! including early `?` returns. Allocation failure is reported as
//! [`TensorError::Allocation`] instead of aborting the process.

use crate::error::{Result, TensorError};

/// Allocate a buffer of `len` copies of `value`.
pub fn alloc_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let bytes = len.saturating_mul(std::mem::size_of::<T>());
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| TensorError::Allocation { bytes })?;
    buf.resize(len, value);
    log::trace!("[scratch] allocated {} bytes", bytes);
    Ok(buf)
}

/// Allocate a default-initialised buffer of `len` elements.
pub fn alloc<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    alloc_filled(len, T::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed() {
        let buf: Vec<f32> = alloc(4).unwrap();
        assert_eq!(buf, vec![0.0; 4]);
    }

    #[test]
    fn test_alloc_filled() {
        let buf = alloc_filled(3, -7i8).unwrap();
        assert_eq!(buf, vec![-7, -7, -7]);
    }

    #[test]
    fn test_alloc_failure_is_an_error() {
        let err = alloc::<u64>(usize::MAX / 4).unwrap_err();
        assert!(matches!(err, TensorError::Allocation { .. }));
    }
}
