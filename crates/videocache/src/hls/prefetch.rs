//! Download prioritisation.
//!
//! Three priority classes keep the playhead fed: startup segments and the
//! window around the current playing segment first, the window after that
//! second, everything else last. Ordering is total — `(priority, segment
//! index, submission sequence)` — so equal-priority tasks drain in segment
//! order and nothing starves.

use std::cmp::Ordering;

/// Index assigned when a segment file name carries no digits at all.
pub(crate) const UNKNOWN_SEGMENT_INDEX: u64 = 999_999;

/// Highest priority: startup segments and the active playback window.
pub(crate) const PRIORITY_IMMEDIATE: u8 = 1;
/// The window right after the active one.
pub(crate) const PRIORITY_NEXT_WINDOW: u8 = 2;
/// Everything further out.
pub(crate) const PRIORITY_BACKGROUND: u8 = 3;

/// A queued segment download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentTask {
    pub priority: u8,
    /// Tie-break index parsed from the file name.
    pub index: u64,
    /// Submission order, making the ordering total even for identical names.
    pub seq: u64,
    pub url: String,
    pub file_name: String,
}

impl Ord for SegmentTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.index.cmp(&other.index))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for SegmentTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority class for the segment at playlist position `position`.
pub(crate) fn priority_for(
    position: usize,
    current_playing: usize,
    min_startup: usize,
    buffer_ahead: usize,
) -> u8 {
    if position < min_startup {
        return PRIORITY_IMMEDIATE;
    }
    let window_end = current_playing + buffer_ahead;
    if position >= current_playing && position <= window_end {
        return PRIORITY_IMMEDIATE;
    }
    if position > window_end && position <= window_end + buffer_ahead {
        return PRIORITY_NEXT_WINDOW;
    }
    PRIORITY_BACKGROUND
}

/// Parse the ordering index out of a segment file name: the digits between
/// the last `_` and the last `.`, else every digit in the name, else
/// [`UNKNOWN_SEGMENT_INDEX`].
pub(crate) fn segment_index(file_name: &str) -> u64 {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    if let Some((_, tail)) = stem.rsplit_once('_')
        && !tail.is_empty()
        && tail.bytes().all(|b| b.is_ascii_digit())
        && let Ok(index) = tail.parse()
    {
        return index;
    }

    let digits: String = file_name.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return UNKNOWN_SEGMENT_INDEX;
    }
    digits.parse().unwrap_or(UNKNOWN_SEGMENT_INDEX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    fn task(priority: u8, index: u64, seq: u64) -> SegmentTask {
        SegmentTask {
            priority,
            index,
            seq,
            url: format!("http://host/seg_{index}.ts"),
            file_name: format!("seg_{index}.ts"),
        }
    }

    #[test]
    fn index_comes_from_trailing_underscore_digits() {
        assert_eq!(segment_index("video_00042.ts"), 42);
        assert_eq!(segment_index("a_b_7.ts"), 7);
    }

    #[test]
    fn index_falls_back_to_all_digits() {
        assert_eq!(segment_index("seg12part3.ts"), 123);
        assert_eq!(segment_index("clip7.ts"), 7);
    }

    #[test]
    fn index_defaults_when_no_digits() {
        assert_eq!(segment_index("intro.ts"), UNKNOWN_SEGMENT_INDEX);
        assert_eq!(segment_index("media_x.ts"), UNKNOWN_SEGMENT_INDEX);
    }

    #[test]
    fn startup_segments_are_immediate() {
        assert_eq!(priority_for(0, 0, 3, 8), PRIORITY_IMMEDIATE);
        assert_eq!(priority_for(2, 20, 3, 8), PRIORITY_IMMEDIATE);
    }

    #[test]
    fn windows_around_playhead() {
        // Playing segment 10 with a buffer of 8: [10, 18] immediate,
        // (18, 26] next, beyond that background.
        assert_eq!(priority_for(10, 10, 3, 8), PRIORITY_IMMEDIATE);
        assert_eq!(priority_for(18, 10, 3, 8), PRIORITY_IMMEDIATE);
        assert_eq!(priority_for(19, 10, 3, 8), PRIORITY_NEXT_WINDOW);
        assert_eq!(priority_for(26, 10, 3, 8), PRIORITY_NEXT_WINDOW);
        assert_eq!(priority_for(27, 10, 3, 8), PRIORITY_BACKGROUND);
        assert_eq!(priority_for(5, 10, 3, 8), PRIORITY_BACKGROUND);
    }

    #[test]
    fn heap_drains_by_priority_then_index() {
        let mut heap = BinaryHeap::new();
        for t in [
            task(3, 0, 0),
            task(1, 5, 1),
            task(2, 2, 2),
            task(1, 1, 3),
            task(1, 1, 4),
        ] {
            heap.push(Reverse(t));
        }
        let order: Vec<(u8, u64, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|Reverse(t)| (t.priority, t.index, t.seq))
            .collect();
        assert_eq!(
            order,
            vec![(1, 1, 3), (1, 1, 4), (1, 5, 1), (2, 2, 2), (3, 0, 0)]
        );
    }
}
