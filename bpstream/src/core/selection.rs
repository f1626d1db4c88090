//! Copies between row-major n-dimensional boxes.

/// An axis-aligned box: `start` and `count` per dimension, row-major.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region<'a> {
    pub(crate) start: &'a [usize],
    pub(crate) count: &'a [usize],
}

impl<'a> Region<'a> {
    pub(crate) fn new(start: &'a [usize], count: &'a [usize]) -> Self {
        Region { start, count }
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.count.len()];
        for i in (0..self.count.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.count[i + 1];
        }
        strides
    }

    fn offset_of(&self, index: &[usize], strides: &[usize]) -> usize {
        index
            .iter()
            .zip(self.start)
            .zip(strides)
            .map(|((i, s), stride)| (i - s) * stride)
            .sum()
    }
}

/// Copies the elements of `src` that fall inside `dst`, and inside `clip` when
/// given, into `dst`. `src` and `dst` are buffers laid out as their regions. All
/// regions share one coordinate system and dimensionality. Returns the number of
/// elements copied.
pub(crate) fn copy_region(
    src: &[u8],
    src_region: Region<'_>,
    dst: &mut [u8],
    dst_region: Region<'_>,
    clip: Option<Region<'_>>,
    element_size: usize,
) -> usize {
    let ndim = src_region.count.len();

    if ndim == 0 {
        let n = element_size.min(src.len()).min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        return 1;
    }

    let mut lo = vec![0usize; ndim];
    let mut hi = vec![0usize; ndim];
    for d in 0..ndim {
        lo[d] = src_region.start[d].max(dst_region.start[d]);
        hi[d] = (src_region.start[d] + src_region.count[d])
            .min(dst_region.start[d] + dst_region.count[d]);
        if let Some(clip) = clip {
            lo[d] = lo[d].max(clip.start[d]);
            hi[d] = hi[d].min(clip.start[d] + clip.count[d]);
        }
        if lo[d] >= hi[d] {
            return 0;
        }
    }

    let src_strides = src_region.strides();
    let dst_strides = dst_region.strides();
    let last = ndim - 1;
    let run = hi[last] - lo[last];
    let run_bytes = run * element_size;

    let mut index = lo.clone();
    let mut copied = 0;

    loop {
        let s = src_region.offset_of(&index, &src_strides) * element_size;
        let d = dst_region.offset_of(&index, &dst_strides) * element_size;
        dst[d..d + run_bytes].copy_from_slice(&src[s..s + run_bytes]);
        copied += run;

        // Odometer over every dimension but the innermost.
        let mut dim = last;
        loop {
            if dim == 0 {
                return copied;
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < hi[dim] {
                break;
            }
            index[dim] = lo[dim];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: usize, cols: usize) -> Vec<u8> {
        (0..rows * cols).map(|i| i as u8).collect()
    }

    #[test]
    fn copies_overlap_only() {
        // src covers rows 0..2 of a 4x4 array, dst asks for rows 1..3, columns 1..3.
        let src = grid(2, 4);
        let mut dst = vec![0xffu8; 4];
        let copied = copy_region(
            &src,
            Region::new(&[0, 0], &[2, 4]),
            &mut dst,
            Region::new(&[1, 1], &[2, 2]),
            None,
            1,
        );
        assert_eq!(copied, 2);
        assert_eq!(dst, vec![5, 6, 0xff, 0xff]);
    }

    #[test]
    fn disjoint_copies_nothing() {
        let src = grid(1, 2);
        let mut dst = vec![0u8; 2];
        let copied = copy_region(
            &src,
            Region::new(&[0], &[2]),
            &mut dst,
            Region::new(&[2], &[2]),
            None,
            1,
        );
        assert_eq!(copied, 0);
        assert_eq!(dst, vec![0, 0]);
    }

    #[test]
    fn clip_restricts_and_elements_are_wide() {
        let src: Vec<u8> = (0..9u16).flat_map(|v| v.to_le_bytes()).collect();
        let mut dst = vec![0u8; 18];
        let copied = copy_region(
            &src,
            Region::new(&[0, 0], &[3, 3]),
            &mut dst,
            Region::new(&[0, 0], &[3, 3]),
            Some(Region::new(&[1, 1], &[2, 1])),
            2,
        );
        assert_eq!(copied, 2);
        let values: Vec<u16> = dst
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![0, 0, 0, 0, 4, 0, 0, 7, 0]);
    }

    #[test]
    fn three_dimensions() {
        let src: Vec<u8> = (0..27).collect();
        let mut dst = vec![0u8; 8];
        let copied = copy_region(
            &src,
            Region::new(&[0, 0, 0], &[3, 3, 3]),
            &mut dst,
            Region::new(&[1, 1, 1], &[2, 2, 2]),
            None,
            1,
        );
        assert_eq!(copied, 8);
        assert_eq!(dst, vec![13, 14, 16, 17, 22, 23, 25, 26]);
    }
}
