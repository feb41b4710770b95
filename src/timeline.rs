//! Conversion of raw PTS ticks into an absolute position on a single presentation timeline,
//! compensating for the PTS resets that recorders introduce at chapter boundaries.
//!
//! All substreams are anchored to the *video* timeline: only video PTS observations move the
//! offset, and audio/subtitle chunks are stamped with whatever offset the most recent video
//! packet established.  A PTS that moves backwards is taken to mean "a new recording segment
//! started here", and the previous segment's last PTS is added to the running offset.  That
//! heuristic is inherited behaviour: it can misfire on live captures with PTS jitter, and it
//! does not attempt to reconstruct multi-angle DVD timelines.

use crate::pes::Timestamp;
use log::debug;

/// Tracks the video PTS timeline of one demux session.
#[derive(Default)]
pub struct TimestampTracker {
    last_pts_seconds: f64,
    offset_seconds: f64,
    discontinuity_count: u32,
}

impl TimestampTracker {
    /// A tracker positioned at the start of its timeline.
    pub fn new() -> TimestampTracker {
        Self::default()
    }

    /// Feed one video PTS observation, returning the corrected absolute time in seconds.
    pub fn observe_video_pts(&mut self, pts: Timestamp) -> f64 {
        let seconds = pts.value() as f64 / Timestamp::TIMEBASE as f64;
        if seconds < self.last_pts_seconds {
            // PTS went backwards: new chapter
            self.offset_seconds += self.last_pts_seconds;
            self.discontinuity_count += 1;
            debug!(
                "PTS reset {} -> {}; discontinuity #{}, offset now {}s",
                self.last_pts_seconds, seconds, self.discontinuity_count, self.offset_seconds
            );
        }
        self.last_pts_seconds = seconds;
        self.offset_seconds + seconds
    }

    /// Stamp a non-video timestamp with the current video-derived offset, in seconds.
    pub fn stamp_seconds(&self, pts: Timestamp) -> f64 {
        self.offset_seconds + pts.value() as f64 / Timestamp::TIMEBASE as f64
    }

    /// Stamp a non-video timestamp with the current video-derived offset, in 90 kHz ticks.
    pub fn stamp_ticks(&self, pts: Timestamp) -> u64 {
        (self.stamp_seconds(pts) * Timestamp::TIMEBASE as f64).round() as u64
    }

    /// Number of PTS resets seen so far.
    pub fn discontinuity_count(&self) -> u32 {
        self.discontinuity_count
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts_seconds(s: f64) -> Timestamp {
        Timestamp::from_u64((s * Timestamp::TIMEBASE as f64) as u64)
    }

    #[test]
    fn monotonic_pts_passes_through() {
        let mut tracker = TimestampTracker::new();
        assert_eq!(tracker.observe_video_pts(ts_seconds(0.5)), 0.5);
        assert_eq!(tracker.observe_video_pts(ts_seconds(1.0)), 1.0);
        assert_eq!(tracker.discontinuity_count(), 0);
    }

    #[test]
    fn chapter_break_is_compensated() {
        let mut tracker = TimestampTracker::new();
        let inputs = [10.0, 10.5, 11.0, 2.0, 2.5];
        let expected = [10.0, 10.5, 11.0, 13.0, 13.5];
        for (input, want) in inputs.iter().zip(expected) {
            let got = tracker.observe_video_pts(ts_seconds(*input));
            assert!((got - want).abs() < 1e-9, "{} -> {} != {}", input, got, want);
        }
        assert_eq!(tracker.discontinuity_count(), 1);
    }

    #[test]
    fn other_streams_use_video_offset() {
        let mut tracker = TimestampTracker::new();
        tracker.observe_video_pts(ts_seconds(8.0));
        tracker.observe_video_pts(ts_seconds(1.0)); // reset; offset becomes 8s
        assert_eq!(tracker.stamp_ticks(ts_seconds(2.0)), 10 * Timestamp::TIMEBASE);
        assert!((tracker.stamp_seconds(ts_seconds(2.0)) - 10.0).abs() < 1e-9);
        // a subtitle observation must not advance the tracker
        assert_eq!(tracker.discontinuity_count(), 1);
    }
}
