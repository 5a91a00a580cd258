//! Frame placement for the physical pool.

use super::CoreMapEntry;

/// Picks the first free frame at or after the frame following the previous placement,
/// wrapping around once.
#[derive(Debug, Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

impl NextFit {
    pub fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();
        if total_frames == 0 {
            return None;
        }

        let start = self.position % total_frames;
        let found = (0..total_frames)
            .map(|i| (start + i) % total_frames)
            .find(|&frame| !core_map[frame].allocated())?;

        self.position = (found + 1) % total_frames;
        Some(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ops::Range;

    /// Marks the coremap entries in `range` as allocated.
    fn fill_coremap_range(core_map: &mut [CoreMapEntry], range: Range<usize>) {
        for i in range {
            assert!(!core_map[i].allocated());
            core_map[i] = core_map[i].with_allocated(true);
        }
    }

    #[test]
    fn test_next_fit() {
        let mut core_map = [CoreMapEntry::default(); 16];
        fill_coremap_range(&mut core_map, 1..4);
        fill_coremap_range(&mut core_map, 5..12);
        fill_coremap_range(&mut core_map, 14..16);

        // Frames left are 0, 4, 12-13 (inclusive)
        let mut algorithm = NextFit::default();
        assert_eq!(algorithm.place(&core_map), Some(0));
        fill_coremap_range(&mut core_map, 0..1);

        assert_eq!(algorithm.place(&core_map), Some(4));
        // The search continues after the previous placement even if it is freed again.
        core_map[0] = core_map[0].with_allocated(false);
        assert_eq!(algorithm.place(&core_map), Some(12));
    }

    #[test]
    fn test_next_fit_wrap_around() {
        let mut core_map = [CoreMapEntry::default(); 16];
        let mut algorithm = NextFit { position: 8 };
        fill_coremap_range(&mut core_map, 8..16);
        assert_eq!(algorithm.place(&core_map), Some(0));
    }

    #[test]
    fn test_next_fit_full() {
        let mut core_map = [CoreMapEntry::default(); 4];
        fill_coremap_range(&mut core_map, 0..4);
        assert_eq!(NextFit::default().place(&core_map), None);
        assert_eq!(NextFit::default().place(&[]), None);
    }
}
