//! Visible window over the data set
//!
//! The window is positioned by a slider `mark` in `0..=max`, where `max`
//! is derived from the data length and window size with some headroom so
//! the last window is still reachable after new samples arrive.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Window size used until the user picks one
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Records moved by one micro-scroll step
pub const SCROLL_STEP: usize = 10;

/// Slider headroom factor
const SCALE_HEADROOM: f64 = 1.1;

/// Slider maximum for a data set of `len` records viewed `size` at a time:
/// `ceil(len / size * 1.1)`
pub fn scale_max(len: usize, size: usize) -> usize {
    if len == 0 || size == 0 {
        return 0;
    }
    (len as f64 / size as f64 * SCALE_HEADROOM).ceil() as usize
}

/// Carry a slider mark over to a new slider maximum
pub fn rescale_mark(mark: usize, old_max: usize, new_max: usize) -> usize {
    if old_max == 0 {
        return 0;
    }
    (mark as u64 * new_max as u64 / old_max as u64) as usize
}

/// Clamped index range of a window starting at `begin`
pub fn window_range(len: usize, begin: usize, size: usize) -> Range<usize> {
    if len == 0 {
        return 0..0;
    }
    let start = begin.min(len - 1);
    let end = start.saturating_add(size).min(len);
    start..end
}

/// Slider state plus the record index it resolves to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    /// Slider position, `0..=max`
    pub mark: usize,
    /// Slider maximum
    pub max: usize,
    /// Records shown at once
    pub size: usize,
    /// Index of the first visible record
    pub begin: usize,
}

impl Viewport {
    /// Record range this viewport covers
    pub fn range(&self, len: usize) -> Range<usize> {
        window_range(len, self.begin, self.size)
    }

    fn begin_for_mark(&self, len: usize) -> usize {
        if self.max == 0 || len == 0 {
            return 0;
        }
        let begin = (len as u64 * self.mark as u64 / self.max as u64) as usize;
        begin.min(len - 1)
    }

    fn mark_for_begin(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        ((self.begin as u64 * self.max as u64 / len as u64) as usize).min(self.max)
    }

    /// Initialize an unset viewport once data starts arriving
    pub(crate) fn ensure_initialized(&mut self, len: usize, default_size: usize) {
        if self.size == 0 {
            self.size = default_size.max(1);
        }
        if self.max == 0 {
            self.max = scale_max(len, self.size);
        }
    }

    /// Change the window size, keeping the slider at the same relative position
    ///
    /// Sizes larger than the data set are clamped to its length.
    pub fn resize(&mut self, new_size: usize, len: usize) {
        let size = if len > 0 {
            new_size.clamp(1, len)
        } else {
            new_size
        };
        let new_max = scale_max(len, size);

        self.mark = rescale_mark(self.mark, self.max, new_max).min(new_max);
        self.max = new_max;
        self.size = size;
        self.begin = self.begin_for_mark(len);
    }

    /// Move the slider
    pub fn set_mark(&mut self, mark: usize, len: usize) {
        self.mark = mark.min(self.max);
        self.begin = self.begin_for_mark(len);
    }

    /// Shift the window by `delta` records without moving the slider
    pub fn scroll(&mut self, delta: isize, len: usize) {
        if len == 0 {
            return;
        }
        let begin = self.begin as i64 + delta as i64;
        self.begin = begin.clamp(0, len as i64 - 1) as usize;
    }

    /// Position the window so record `index` sits in its middle.
    ///
    /// Returns the slider mark for the new position.
    pub fn show_record(&mut self, index: usize, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let index = index.min(len - 1);
        self.begin = index.saturating_sub(self.size / 2);
        self.mark = self.mark_for_begin(len);
        self.mark
    }

    /// Slider to the first record
    pub fn to_start(&mut self) {
        self.mark = 0;
        self.begin = 0;
    }

    /// Slider to the last full window
    pub fn to_end(&mut self, len: usize) {
        if len == 0 {
            self.to_start();
            return;
        }
        self.begin = len.saturating_sub(self.size.max(1));
        self.mark = self.mark_for_begin(len);
    }
}
