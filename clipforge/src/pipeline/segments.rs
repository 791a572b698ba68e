//! Pure segment transforms: pad, clamp, merge, filter.
//!
//! Applied in that order between detection and rendering. All functions
//! are deterministic for a given input ordering; `merge` sorts by start
//! time first so callers do not have to.

use crate::config::ProcessingConfig;

/// A half-open time span `[start, end)` in seconds, with a detector score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub score: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64, score: f64) -> Self {
        Self { start, end, score }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Widen each segment by `padding` seconds of context on both sides.
pub fn pad(segments: &[Segment], padding: f64) -> Vec<Segment> {
    segments
        .iter()
        .map(|s| Segment::new(s.start - padding, s.end + padding, s.score))
        .collect()
}

/// Clamp segments to `[0, media_duration]`, dropping anything that
/// collapses to nothing.
pub fn clamp(segments: &[Segment], media_duration: f64) -> Vec<Segment> {
    segments
        .iter()
        .map(|s| Segment::new(s.start.max(0.0), s.end.min(media_duration), s.score))
        .filter(|s| s.duration() > 0.0)
        .collect()
}

/// Merge segments whose gap is at most `max_gap` seconds.
///
/// The merged segment keeps the maximum score of its parts. When
/// `max_duration` is set, a merge that would push the combined span past
/// the cap is refused and a new segment starts instead; an individual
/// segment already over the cap is truncated.
pub fn merge(segments: &[Segment], max_gap: f64, max_duration: Option<f64>) -> Vec<Segment> {
    if segments.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<Segment> = segments.to_vec();
    sorted.sort_by(|a, b| {
        a.start
            .partial_cmp(&b.start)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.end
                    .partial_cmp(&b.end)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });

    let mut merged: Vec<Segment> = Vec::new();
    let mut current = sorted[0];

    for s in &sorted[1..] {
        let gap = s.start - current.end;
        let combined_end = current.end.max(s.end);
        let would_exceed = max_duration
            .map(|cap| combined_end - current.start > cap)
            .unwrap_or(false);

        if gap <= max_gap && !would_exceed {
            current.end = combined_end;
            current.score = current.score.max(s.score);
        } else {
            merged.push(current);
            current = *s;
        }
    }
    merged.push(current);

    if let Some(cap) = max_duration {
        for s in &mut merged {
            if s.duration() > cap {
                s.end = s.start + cap;
            }
        }
    }

    merged
}

/// Drop segments shorter than `min_duration` seconds.
pub fn filter_min_duration(segments: &[Segment], min_duration: f64) -> Vec<Segment> {
    segments
        .iter()
        .filter(|s| s.duration() >= min_duration)
        .copied()
        .collect()
}

/// The full shaping pass: pad, clamp, merge, filter.
pub fn shape(events: &[Segment], config: &ProcessingConfig, media_duration: f64) -> Vec<Segment> {
    let padded = pad(events, config.context_padding_s);
    let clamped = clamp(&padded, media_duration);
    let merged = merge(&clamped, config.merge_gap_s, config.max_clip_duration_s);
    filter_min_duration(&merged, config.min_clip_duration_s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64) -> Segment {
        Segment::new(start, end, 1.0)
    }

    #[test]
    fn pad_widens_both_sides() {
        let padded = pad(&[seg(10.0, 12.0)], 1.5);
        assert_eq!(padded[0].start, 8.5);
        assert_eq!(padded[0].end, 13.5);
    }

    #[test]
    fn clamp_bounds_and_drops_empties() {
        let clamped = clamp(&[seg(-2.0, 3.0), seg(58.0, 65.0), seg(61.0, 65.0)], 60.0);
        assert_eq!(clamped.len(), 2);
        assert_eq!(clamped[0].start, 0.0);
        assert_eq!(clamped[1].end, 60.0);
    }

    #[test]
    fn merge_joins_close_segments_and_keeps_max_score() {
        let a = Segment::new(0.0, 5.0, 0.3);
        let b = Segment::new(6.0, 10.0, 0.9);
        let c = Segment::new(20.0, 25.0, 0.1);
        let merged = merge(&[c, a, b], 2.0, None);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].start, 0.0);
        assert_eq!(merged[0].end, 10.0);
        assert_eq!(merged[0].score, 0.9);
        assert_eq!(merged[1].start, 20.0);
    }

    #[test]
    fn merge_respects_duration_cap() {
        let merged = merge(&[seg(0.0, 20.0), seg(21.0, 40.0)], 2.0, Some(30.0));
        // Merging would make a 40s span; the cap refuses it.
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_truncates_single_oversized_segment() {
        let merged = merge(&[seg(0.0, 100.0)], 2.0, Some(30.0));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].end, 30.0);
    }

    #[test]
    fn overlapping_segments_merge_even_with_zero_gap_allowance() {
        let merged = merge(&[seg(0.0, 10.0), seg(5.0, 8.0)], 0.0, None);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].end, 10.0);
    }

    #[test]
    fn filter_drops_short_clips() {
        let kept = filter_min_duration(&[seg(0.0, 0.5), seg(1.0, 3.0)], 1.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].start, 1.0);
    }

    #[test]
    fn shape_composes_the_pipeline() {
        let config = ProcessingConfig {
            context_padding_s: 1.0,
            merge_gap_s: 2.0,
            min_clip_duration_s: 1.0,
            max_clip_duration_s: None,
        };
        // Two events close enough to merge once padded.
        let events = [Segment::new(5.0, 6.0, 0.5), Segment::new(9.0, 10.0, 0.8)];
        let shaped = shape(&events, &config, 60.0);
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].start, 4.0);
        assert_eq!(shaped[0].end, 11.0);
        assert_eq!(shaped[0].score, 0.8);
    }
}
