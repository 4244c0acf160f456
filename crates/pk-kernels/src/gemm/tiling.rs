use super::kernel::MAX_NR;

/// Row tile heights, widest first.
pub const ROW_TILES: [usize; 5] = [12, 8, 4, 2, 1];

/// Smallest m block before the scheduler takes the whole remainder.
pub const MIN_M_BLK: usize = 12;

/// Cache block sizes for the blocked scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingParams {
    pub m_blk: usize,
    pub k_blk: usize,
    pub n_blk: usize,
    /// Fan m blocks out over the worker pool.
    pub parallel: bool,
}

impl TilingParams {
    pub const fn new(m_blk: usize, k_blk: usize, n_blk: usize) -> Self {
        TilingParams {
            m_blk,
            k_blk,
            n_blk,
            parallel: false,
        }
    }

    /// One block covering the whole problem.
    pub const fn unblocked() -> Self {
        TilingParams::new(0, 0, 0)
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

impl Default for TilingParams {
    fn default() -> Self {
        TilingParams::new(32, 64, 64)
    }
}

/// Height of the next row tile given `remaining` rows.
#[inline]
pub fn row_tile(remaining: usize) -> usize {
    ROW_TILES
        .iter()
        .copied()
        .find(|&t| t <= remaining)
        .unwrap_or(1)
}

/// Width of the next column tile given `remaining` columns.
///
/// `packn` is clamped so a tile never exceeds [`MAX_NR`].
#[inline]
pub fn col_tile(remaining: usize, packn: usize) -> usize {
    let packn = packn.clamp(1, MAX_NR / 2);
    if remaining >= 2 * packn {
        2 * packn
    } else if remaining >= packn {
        packn
    } else {
        remaining
    }
}

/// Iterates `(start, len)` cache blocks along one dimension.
///
/// With halving enabled, a block that would overrun the edge is halved until
/// it fits; once it drops below `min` the whole remainder becomes the last
/// block. A block size of zero means "one block".
#[derive(Debug, Clone)]
pub struct BlockIterator {
    total: usize,
    idx: usize,
    blk: usize,
    min: usize,
    halving: bool,
}

impl BlockIterator {
    pub fn halving(total: usize, blk: usize, min: usize) -> Self {
        BlockIterator {
            total,
            idx: 0,
            blk: if blk == 0 { total } else { blk },
            min: min.max(1),
            halving: true,
        }
    }

    pub fn clipped(total: usize, blk: usize) -> Self {
        BlockIterator {
            total,
            idx: 0,
            blk: if blk == 0 { total } else { blk },
            min: 1,
            halving: false,
        }
    }
}

impl Iterator for BlockIterator {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.total {
            return None;
        }
        let remaining = self.total - self.idx;
        let mut size = self.blk;
        if self.halving {
            while size > remaining {
                size /= 2;
            }
            if size < self.min {
                size = remaining;
            }
        } else {
            size = size.min(remaining);
        }
        let start = self.idx;
        self.idx += size;
        Some((start, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_tiles() {
        assert_eq!(row_tile(17), 12);
        assert_eq!(row_tile(9), 8);
        assert_eq!(row_tile(7), 4);
        assert_eq!(row_tile(3), 2);
        assert_eq!(row_tile(1), 1);
    }

    #[test]
    fn test_col_tiles() {
        assert_eq!(col_tile(17, 4), 8);
        assert_eq!(col_tile(5, 4), 4);
        assert_eq!(col_tile(3, 4), 3);
    }

    #[test]
    fn test_halving_blocks() {
        let blocks: Vec<_> = BlockIterator::halving(17, 32, 12).collect();
        assert_eq!(blocks, vec![(0, 16), (16, 1)]);
        let blocks: Vec<_> = BlockIterator::halving(40, 32, 12).collect();
        assert_eq!(blocks, vec![(0, 32), (32, 8)]);
        let blocks: Vec<_> = BlockIterator::halving(60, 32, 12).collect();
        assert_eq!(blocks, vec![(0, 32), (32, 16), (48, 12)]);
    }

    #[test]
    fn test_clipped_blocks() {
        let blocks: Vec<_> = BlockIterator::clipped(130, 64).collect();
        assert_eq!(blocks, vec![(0, 64), (64, 64), (128, 2)]);
        assert_eq!(BlockIterator::clipped(5, 0).collect::<Vec<_>>(), vec![(0, 5)]);
        assert_eq!(BlockIterator::clipped(0, 8).count(), 0);
    }
}
