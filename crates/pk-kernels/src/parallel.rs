//! Fan-out over disjoint output chunks.
//!
//! Workers only read shared inputs and write their own chunk, so no
//! locking is needed; any scratch a worker needs is allocated inside the
//! closure.

use std::convert::Infallible;

use pk_tensor::Result;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

fn drive<T, E, F>(data: &mut [T], chunk: usize, parallel: bool, f: F) -> std::result::Result<(), E>
where
    T: Send,
    E: Send,
    F: Fn(usize, &mut [T]) -> std::result::Result<(), E> + Send + Sync,
{
    if chunk == 0 || data.is_empty() {
        return Ok(());
    }
    #[cfg(feature = "parallel")]
    if parallel && data.len() > chunk {
        return data
            .par_chunks_mut(chunk)
            .enumerate()
            .try_for_each(|(i, c)| f(i, c));
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;
    data.chunks_mut(chunk).enumerate().try_for_each(|(i, c)| f(i, c))
}

/// Call `f(index, chunk)` for every `chunk`-sized piece of `data` (the last
/// piece may be shorter), in parallel when `parallel` is set and the crate
/// was built with the `parallel` feature.
pub fn try_for_each_chunk<T, F>(data: &mut [T], chunk: usize, parallel: bool, f: F) -> Result<()>
where
    T: Send,
    F: Fn(usize, &mut [T]) -> Result<()> + Send + Sync,
{
    drive(data, chunk, parallel, f)
}

/// Infallible form of [`try_for_each_chunk`].
pub fn for_each_chunk<T, F>(data: &mut [T], chunk: usize, parallel: bool, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    let done: std::result::Result<(), Infallible> = drive(data, chunk, parallel, |i, c| {
        f(i, c);
        Ok(())
    });
    match done {
        Ok(()) => {}
        Err(never) => match never {},
    }
}
