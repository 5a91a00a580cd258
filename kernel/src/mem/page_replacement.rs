//! Victim selection when the frame pool runs dry.

use crate::mem::frame_table::{Frame, FrameMapping};

pub trait PageReplacementPolicy: Send {
    /// Chooses the index into `frames` of the frame to evict, or `None` if every frame is
    /// pinned.
    ///
    /// `test_and_clear_accessed` reports whether a page's accessed bit was set and clears it.
    fn select_victim(
        &mut self,
        frames: &[&Frame],
        test_and_clear_accessed: &mut dyn FnMut(&FrameMapping) -> bool,
    ) -> Option<usize>;
}

/// Second-chance replacement. A hand sweeps the frames in registration order; frames whose
/// pages were accessed since the last sweep get their bits cleared and are passed over once.
#[derive(Debug, Default)]
pub struct ClockEviction {
    hand: usize,
}

impl ClockEviction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageReplacementPolicy for ClockEviction {
    fn select_victim(
        &mut self,
        frames: &[&Frame],
        test_and_clear_accessed: &mut dyn FnMut(&FrameMapping) -> bool,
    ) -> Option<usize> {
        let total = frames.len();
        if total == 0 {
            return None;
        }

        let mut first_unpinned = None;
        for step in 0..total {
            let index = (self.hand + step) % total;
            let frame = frames[index];
            if frame.is_pinned() {
                continue;
            }
            first_unpinned.get_or_insert(index);

            // Every page's bit is cleared, even after one is found set.
            let recently_used = frame
                .pages()
                .iter()
                .fold(false, |used, page| test_and_clear_accessed(page) | used);
            if !recently_used {
                self.hand = (index + 1) % total;
                return Some(index);
            }
        }

        let victim = first_unpinned?;
        self.hand = (victim + 1) % total;
        Some(victim)
    }
}
