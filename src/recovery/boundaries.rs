//! Volume chapter boundary probe for the dedup index tie-in.
//!
//! The backing volume stores a circular sequence of monotonically
//! increasing virtual chapter numbers with at most one contiguous run of
//! bad (unreadable or torn) chapters. The probe binary-searches for the
//! discontinuity, then scans backward over bad spots for the highest
//! chapter. Unreadable chapters count as the `u64::MAX` sentinel only
//! inside this probe.

use tracing::error;

use crate::error::{Result, VdoError};

/// Longest tolerated run of contiguous bad chapters.
pub const MAX_BAD_CHAPTERS: u32 = 100;

pub const BAD_CHAPTER: u64 = u64::MAX;

/// The lowest and highest virtual chapter numbers present, or None for an
/// empty volume.
pub fn find_chapter_boundaries<F>(
    chapter_limit: u64,
    max_bad_chapters: u32,
    mut probe: F,
) -> Result<Option<(u64, u64)>>
where
    F: FnMut(u64) -> Result<u64>,
{
    if chapter_limit == 0 {
        return Ok(None);
    }

    // A bad chapter 0 probes as the sentinel, which is fine: every real
    // value compares below it and the search still lands on the lowest.
    let first_vcn = probe(0)?;

    // Binary search for the end of the discontinuity in the increasing
    // sequence: the index of the smallest value less than the first. Going
    // off the end means chapter 0 already holds the lowest.
    let mut left: u64 = 0;
    let mut right: u64 = chapter_limit;
    while left < right {
        let mid = (left + right) / 2;
        let probed = probe(mid)?;
        if first_vcn <= probed {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    debug_assert_eq!(left, right);
    left %= chapter_limit;

    let lowest = probe(left)?;
    if lowest == BAD_CHAPTER {
        // Every chapter probed as bad.
        return Ok(None);
    }

    // Scan backward circularly over any bad spots to the highest value.
    let mut bad_chapters: u32 = 0;
    loop {
        right = (right + chapter_limit - 1) % chapter_limit;
        let highest = probe(right)?;
        if highest != BAD_CHAPTER {
            return Ok(Some((lowest, highest)));
        }
        bad_chapters += 1;
        if bad_chapters >= max_bad_chapters {
            error!(bad_chapters, "too many bad chapters in volume");
            return Err(VdoError::CorruptJournal(format!(
                "{bad_chapters} contiguous bad chapters in volume"
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_from(values: &[u64]) -> impl FnMut(u64) -> Result<u64> + '_ {
        move |chapter| Ok(values[chapter as usize])
    }

    #[test]
    fn clean_wrapped_volume() {
        // Highest immediately precedes lowest in a cleanly saved volume.
        let values = [8, 9, 10, 3, 4, 5, 6, 7];
        let bounds = find_chapter_boundaries(8, MAX_BAD_CHAPTERS, probe_from(&values)).unwrap();
        assert_eq!(bounds, Some((3, 10)));
    }

    #[test]
    fn unwrapped_volume() {
        let values = [1, 2, 3, 4, 5];
        let bounds = find_chapter_boundaries(5, MAX_BAD_CHAPTERS, probe_from(&values)).unwrap();
        assert_eq!(bounds, Some((1, 5)));
    }

    #[test]
    fn bad_run_in_the_middle() {
        let values = [20, 21, BAD_CHAPTER, BAD_CHAPTER, 16, 17, 18, 19];
        let bounds = find_chapter_boundaries(8, MAX_BAD_CHAPTERS, probe_from(&values)).unwrap();
        assert_eq!(bounds, Some((16, 21)));
    }

    #[test]
    fn bad_run_at_the_seam() {
        let values = [BAD_CHAPTER, 13, 14, 15, 16, 17, BAD_CHAPTER, BAD_CHAPTER];
        let bounds = find_chapter_boundaries(8, MAX_BAD_CHAPTERS, probe_from(&values)).unwrap();
        assert_eq!(bounds, Some((13, 17)));
    }

    #[test]
    fn single_chapter() {
        let values = [42];
        let bounds = find_chapter_boundaries(1, MAX_BAD_CHAPTERS, probe_from(&values)).unwrap();
        assert_eq!(bounds, Some((42, 42)));
    }

    #[test]
    fn too_many_bad_chapters_is_fatal() {
        let mut values = vec![BAD_CHAPTER; 200];
        values[0] = 7;
        let result = find_chapter_boundaries(200, MAX_BAD_CHAPTERS, probe_from(&values));
        assert!(result.is_err());
    }

    #[test]
    fn empty_limit_is_empty_volume() {
        let bounds =
            find_chapter_boundaries(0, MAX_BAD_CHAPTERS, |_| Ok(0u64)).unwrap();
        assert_eq!(bounds, None);
    }

    #[test]
    fn property_bounds_match_min_max() {
        // Circular monotone sequences with one bounded bad run: the probe
        // must find the global min and max of the good values.
        for rotation in 0..16u64 {
            for bad_start in 0..16usize {
                for bad_len in 0..4usize {
                    let limit = 16u64;
                    let mut values: Vec<u64> = (0..limit)
                        .map(|i| 100 + ((i + limit - rotation) % limit))
                        .collect();
                    // The bad run must sit at the discontinuity to keep the
                    // remaining sequence monotone, as unflushed writes do.
                    let seam = (rotation as usize + limit as usize - 1) % limit as usize;
                    let _ = bad_start;
                    for offset in 0..bad_len {
                        let index = (seam + limit as usize - offset) % limit as usize;
                        values[index] = BAD_CHAPTER;
                    }
                    let good: Vec<u64> = values
                        .iter()
                        .copied()
                        .filter(|&v| v != BAD_CHAPTER)
                        .collect();
                    if good.is_empty() {
                        continue;
                    }
                    let bounds =
                        find_chapter_boundaries(limit, MAX_BAD_CHAPTERS, probe_from(&values))
                            .unwrap();
                    let min = good.iter().copied().min();
                    let max = good.iter().copied().max();
                    assert_eq!(bounds, min.zip(max), "rotation {rotation} bad_len {bad_len}");
                }
            }
        }
    }
}
