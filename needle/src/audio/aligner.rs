use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::data::{AudioFingerprint, FrameHash};
use super::hasher::hamming_distance;
use crate::{Error, Result};

/// Kind of recurring segment.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// Intro, searched for at the start of each video.
    Opening,
    /// Credits, searched for at the end of each video.
    Ending,
}

impl Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentKind::Opening => write!(f, "Opening"),
            SegmentKind::Ending => write!(f, "Ending"),
        }
    }
}

/// A detected time range in a single video that can be skipped.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SkipRange {
    /// Opening or ending.
    pub kind: SegmentKind,
    /// Start of the range.
    pub start: Duration,
    /// End of the range.
    pub end: Duration,
}

impl SkipRange {
    /// Length of the range.
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Parameters that control how fingerprints are aligned.
///
/// All fields have defaults matching the `DEFAULT_*` constants in [needle::audio](super).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchConfig {
    /// Maximum Hamming distance for two hashes to count as a match (0 to 32).
    pub hash_match_threshold: u32,
    /// Openings must lie within this fraction of the start of the video.
    pub opening_search_percentage: f32,
    /// Endings must lie within this fraction of the end of the video.
    pub ending_search_percentage: f32,
    /// Shortest range reported as an opening.
    pub min_opening_duration: Duration,
    /// Shortest range reported as an ending.
    pub min_ending_duration: Duration,
    /// Amount by which detected ranges are widened on both sides.
    pub time_padding: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            hash_match_threshold: super::DEFAULT_HASH_MATCH_THRESHOLD as u32,
            opening_search_percentage: super::DEFAULT_OPENING_SEARCH_PERCENTAGE,
            ending_search_percentage: super::DEFAULT_ENDING_SEARCH_PERCENTAGE,
            min_opening_duration: Duration::from_secs(super::DEFAULT_MIN_OPENING_DURATION as u64),
            min_ending_duration: Duration::from_secs(super::DEFAULT_MIN_ENDING_DURATION as u64),
            time_padding: Duration::from_secs_f32(super::DEFAULT_OPENING_AND_ENDING_TIME_PADDING),
        }
    }
}

pub(crate) fn validate_percentage(p: f32) -> Result<()> {
    if p > 0.0 && p <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidSearchPercentage(p))
    }
}

impl SearchConfig {
    /// Checks that every field is within range.
    pub fn validate(&self) -> Result<()> {
        if self.hash_match_threshold > 32 {
            return Err(Error::InvalidHashMatchThreshold(self.hash_match_threshold));
        }
        validate_percentage(self.opening_search_percentage)?;
        validate_percentage(self.ending_search_percentage)?;
        Ok(())
    }

    fn min_duration(&self, kind: SegmentKind) -> Duration {
        match kind {
            SegmentKind::Opening => self.min_opening_duration,
            SegmentKind::Ending => self.min_ending_duration,
        }
    }
}

/// The part of a video in which a segment of a given kind is searched for.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchWindow {
    /// Start of the window.
    pub start: Duration,
    /// End of the window.
    pub end: Duration,
}

impl MatchWindow {
    /// Builds the window for `kind` in a video of the given duration.
    pub fn new(kind: SegmentKind, duration: Duration, config: &SearchConfig) -> Self {
        match kind {
            SegmentKind::Opening => Self {
                start: Duration::ZERO,
                end: duration.mul_f32(config.opening_search_percentage),
            },
            SegmentKind::Ending => Self {
                start: duration.mul_f32(1.0 - config.ending_search_percentage),
                end: duration,
            },
        }
    }

    /// Returns true if `t` lies inside the window.
    pub fn contains(&self, t: Duration) -> bool {
        t >= self.start && t <= self.end
    }

    // Hashes are sorted by timestamp, so the ones inside the window are contiguous.
    fn slice<'a>(&self, hashes: &'a [FrameHash]) -> &'a [FrameHash] {
        let lo = hashes.partition_point(|h| h.timestamp < self.start);
        let hi = hashes.partition_point(|h| h.timestamp <= self.end);
        &hashes[lo..hi.max(lo)]
    }
}

/// An aligned pair of skip ranges found by the [Aligner].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Match {
    /// Kind of segment.
    pub kind: SegmentKind,
    /// Range in the source video.
    pub src: SkipRange,
    /// Range in the destination video.
    pub dst: SkipRange,
    /// Number of matching hashes in the run.
    pub len: usize,
    /// Sum of the Hamming distances across the run.
    pub distance: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Run {
    src_start: usize,
    dst_start: usize,
    len: usize,
    distance: u32,
}

impl Run {
    // Longest first, then lowest distance, then earliest in the source, then in the dest.
    fn is_better_than(&self, other: &Run) -> bool {
        (other.len, self.distance, self.src_start, self.dst_start)
            < (self.len, other.distance, other.src_start, other.dst_start)
    }
}

/// Finds the longest run of matching hashes between two fingerprints.
///
/// A run is a sequence of hash pairs `(i, j), (i + 1, j + 1), ...` where every pair is within
/// the hash match threshold and consecutive hashes on both sides are exactly one hash period
/// apart. In other words, it is one contiguous stretch of audio that plays identically in both
/// videos, at a constant offset.
///
/// This runs in O(n * m) time and O(m) space, where `n` and `m` are the number of hashes in the
/// two match windows. The result only depends on the inputs.
#[derive(Clone, Debug, Default)]
pub struct Aligner {
    config: SearchConfig,
}

impl Aligner {
    /// Constructs a new [Aligner].
    pub fn new(config: SearchConfig) -> Self {
        Self { config }
    }

    /// Returns the search configuration.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Searches both fingerprints for a shared segment of the given kind.
    ///
    /// Returns `Ok(None)` if no run is long enough once padded.
    pub fn align(
        &self,
        src: &AudioFingerprint,
        dst: &AudioFingerprint,
        kind: SegmentKind,
    ) -> Result<Option<Match>> {
        let _g = tracing::span!(tracing::Level::TRACE, "align").entered();

        let period = src.hash_period();
        let tolerance = period.as_secs_f64() * super::HASH_PERIOD_TOLERANCE;
        let delta = if period > dst.hash_period() {
            period - dst.hash_period()
        } else {
            dst.hash_period() - period
        };
        if delta.as_secs_f64() > tolerance {
            return Err(Error::HashPeriodMismatch(period, dst.hash_period()));
        }

        let src_window = MatchWindow::new(kind, src.duration(), &self.config).slice(src.hashes());
        let dst_window = MatchWindow::new(kind, dst.duration(), &self.config).slice(dst.hashes());

        let run = match self.longest_run(src_window, dst_window, period) {
            Some(run) => run,
            None => return Ok(None),
        };

        let to_range = |window: &[FrameHash], start: usize, duration: Duration| {
            let start_time = window[start].timestamp;
            let end_time = start_time + period * run.len as u32;
            SkipRange {
                kind,
                start: start_time.saturating_sub(self.config.time_padding),
                end: (end_time + self.config.time_padding).min(duration),
            }
        };
        let src_range = to_range(src_window, run.src_start, src.duration());
        let dst_range = to_range(dst_window, run.dst_start, dst.duration());

        tracing::trace!(
            len = run.len,
            distance = run.distance,
            "longest {} run: {:?} / {:?}",
            kind,
            src_range,
            dst_range
        );

        let min_duration = self.config.min_duration(kind);
        if src_range.duration() < min_duration || dst_range.duration() < min_duration {
            return Ok(None);
        }

        Ok(Some(Match {
            kind,
            src: src_range,
            dst: dst_range,
            len: run.len,
            distance: run.distance,
        }))
    }

    fn longest_run(&self, src: &[FrameHash], dst: &[FrameHash], period: Duration) -> Option<Run> {
        if src.is_empty() || dst.is_empty() {
            return None;
        }

        let period = period.as_secs_f64();
        let tolerance = period * super::HASH_PERIOD_TOLERANCE;
        // follows[i] is true if hash i comes exactly one period after hash i - 1.
        let follows = |hashes: &[FrameHash]| -> Vec<bool> {
            std::iter::once(false)
                .chain(hashes.windows(2).map(|w| {
                    let delta = w[1].timestamp.saturating_sub(w[0].timestamp).as_secs_f64();
                    (delta - period).abs() <= tolerance
                }))
                .collect()
        };
        let (src_follows, dst_follows) = (follows(src), follows(dst));

        // Rolling rows of (run length, total distance) ending at (i, j).
        let mut prev: Vec<(usize, u32)> = vec![(0, 0); dst.len()];
        let mut cur: Vec<(usize, u32)> = vec![(0, 0); dst.len()];
        let mut best: Option<Run> = None;

        for (i, s) in src.iter().enumerate() {
            for (j, d) in dst.iter().enumerate() {
                let dist = hamming_distance(s.hash, d.hash);
                if dist > self.config.hash_match_threshold {
                    cur[j] = (0, 0);
                    continue;
                }

                let (len, distance) = if j > 0 && src_follows[i] && dst_follows[j] {
                    prev[j - 1]
                } else {
                    (0, 0)
                };
                let (len, distance) = (len + 1, distance + dist);
                cur[j] = (len, distance);

                let candidate = Run {
                    src_start: i + 1 - len,
                    dst_start: j + 1 - len,
                    len,
                    distance,
                };
                if best.map_or(true, |b| candidate.is_better_than(&b)) {
                    best = Some(candidate);
                }
            }
            std::mem::swap(&mut prev, &mut cur);
        }

        best
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::test_util::{fingerprint, random_hashes};

    fn config() -> SearchConfig {
        SearchConfig {
            hash_match_threshold: 0,
            opening_search_percentage: 0.5,
            ending_search_percentage: 0.5,
            min_opening_duration: Duration::from_secs(4),
            min_ending_duration: Duration::from_secs(4),
            time_padding: Duration::ZERO,
        }
    }

    // Two 40-hash fingerprints where `len` hashes of `src` starting at `src_at` are copied
    // into `dst` at `dst_at`.
    fn shared_run(src_at: usize, dst_at: usize, len: usize) -> (AudioFingerprint, AudioFingerprint) {
        let src = random_hashes(1, 40);
        let mut dst = random_hashes(2, 40);
        dst[dst_at..dst_at + len].copy_from_slice(&src[src_at..src_at + len]);
        (fingerprint(&src, 0.5), fingerprint(&dst, 0.5))
    }

    #[test]
    fn test_opening_detected() {
        let (src, dst) = shared_run(5, 0, 10);
        let aligner = Aligner::new(config());

        let m = aligner
            .align(&src, &dst, SegmentKind::Opening)
            .unwrap()
            .expect("opening should be detected");
        assert_eq!(m.kind, SegmentKind::Opening);
        assert_eq!(m.len, 10);
        assert_eq!(m.distance, 0);
        assert_eq!(m.src.start, Duration::from_millis(2500));
        assert_eq!(m.src.end, Duration::from_millis(7500));
        assert!(m.src.duration() >= Duration::from_secs(4));
        assert_eq!(m.dst.start, Duration::ZERO);
        assert_eq!(m.dst.end, Duration::from_secs(5));
    }

    #[test]
    fn test_short_run_rejected() {
        let (src, dst) = shared_run(5, 0, 5);
        let aligner = Aligner::new(config());
        assert_eq!(aligner.align(&src, &dst, SegmentKind::Opening).unwrap(), None);

        // The same run qualifies once the minimum is low enough.
        let aligner = Aligner::new(SearchConfig {
            min_opening_duration: Duration::from_secs(2),
            ..config()
        });
        let m = aligner.align(&src, &dst, SegmentKind::Opening).unwrap().unwrap();
        assert_eq!(m.len, 5);
    }

    #[test]
    fn test_time_padding_clamped() {
        let (src, dst) = shared_run(5, 0, 10);
        let aligner = Aligner::new(SearchConfig {
            time_padding: Duration::from_secs(3),
            ..config()
        });
        let m = aligner.align(&src, &dst, SegmentKind::Opening).unwrap().unwrap();
        assert_eq!(m.src.start, Duration::ZERO);
        assert_eq!(m.src.end, Duration::from_millis(10500));
        assert_eq!(m.dst.start, Duration::ZERO);
        assert_eq!(m.dst.end, Duration::from_secs(8));
    }

    #[test]
    fn test_ending_window() {
        // Shared run near the end of both videos.
        let (src, dst) = shared_run(28, 30, 10);
        let aligner = Aligner::new(config());

        assert_eq!(aligner.align(&src, &dst, SegmentKind::Opening).unwrap(), None);
        let m = aligner.align(&src, &dst, SegmentKind::Ending).unwrap().unwrap();
        assert_eq!(m.kind, SegmentKind::Ending);
        assert_eq!(m.src.start, Duration::from_secs(14));
        assert_eq!(m.dst.start, Duration::from_secs(15));
        assert_eq!(m.dst.end, Duration::from_secs(20));
    }

    #[test]
    fn test_run_outside_window_ignored() {
        // Opening window is the first 25% (5s); the run starts at 12s.
        let (src, dst) = shared_run(24, 24, 10);
        let aligner = Aligner::new(SearchConfig {
            opening_search_percentage: 0.25,
            ..config()
        });
        assert_eq!(aligner.align(&src, &dst, SegmentKind::Opening).unwrap(), None);
    }

    #[test]
    fn test_gap_breaks_run() {
        let hashes = random_hashes(3, 20);
        let src = fingerprint(&hashes, 0.5);

        // Same hashes, but with a missing second halfway through.
        let period = Duration::from_millis(500);
        let mut frame_hashes = src.hashes().to_vec();
        for h in frame_hashes.iter_mut().skip(10) {
            h.timestamp += period * 2;
        }
        let dst = AudioFingerprint::new(
            frame_hashes,
            src.sample_rate(),
            period,
            src.hash_duration(),
            src.duration() + period * 2,
            true,
            src.md5().to_string(),
        );

        let aligner = Aligner::new(SearchConfig {
            opening_search_percentage: 1.0,
            min_opening_duration: Duration::ZERO,
            ..config()
        });
        let m = aligner.align(&src, &dst, SegmentKind::Opening).unwrap().unwrap();
        assert_eq!(m.len, 10);
    }

    #[test]
    fn test_tie_breaks() {
        let src = random_hashes(4, 40);
        let mut dst = random_hashes(5, 40);
        // Two runs of the same length: the later one is an exact match, the earlier one is not.
        for k in 0..8 {
            dst[2 + k] = src[1 + k] ^ 0b1;
            dst[12 + k] = src[11 + k];
        }
        let (src, dst) = (fingerprint(&src, 0.5), fingerprint(&dst, 0.5));

        let aligner = Aligner::new(SearchConfig {
            hash_match_threshold: 1,
            min_opening_duration: Duration::from_secs(1),
            ..config()
        });
        let m = aligner.align(&src, &dst, SegmentKind::Opening).unwrap().unwrap();
        assert_eq!(m.distance, 0);
        assert_eq!(m.src.start, Duration::from_millis(5500));

        // With equal quality, the earliest run in the source wins.
        let mut src_hashes: Vec<u32> = src.hashes().iter().map(|h| h.hash).collect();
        for k in 0..8 {
            src_hashes[1 + k] = dst.hashes()[2 + k].hash;
        }
        let src = fingerprint(&src_hashes, 0.5);
        let m = aligner.align(&src, &dst, SegmentKind::Opening).unwrap().unwrap();
        assert_eq!(m.distance, 0);
        assert_eq!(m.src.start, Duration::from_millis(500));
    }

    #[test]
    fn test_deterministic() {
        let (src, dst) = shared_run(3, 7, 12);
        let aligner = Aligner::new(SearchConfig {
            hash_match_threshold: 8,
            ..config()
        });
        let expected = aligner.align(&src, &dst, SegmentKind::Opening).unwrap();
        assert!(expected.is_some());

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| aligner.align(&src, &dst, SegmentKind::Opening).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for result in results {
            assert_eq!(result, expected);
        }
    }

    #[test]
    fn test_threshold_monotonic() {
        let src = random_hashes(6, 40);
        let mut dst = random_hashes(7, 40);
        // A noisy copy: every hash in the run has a few bits flipped.
        for k in 0..12 {
            dst[4 + k] = src[6 + k] ^ (0b1011 << (k % 20));
        }
        let (src, dst) = (fingerprint(&src, 0.5), fingerprint(&dst, 0.5));

        let mut last_len = 0;
        for threshold in 0..=32 {
            let aligner = Aligner::new(SearchConfig {
                hash_match_threshold: threshold,
                opening_search_percentage: 1.0,
                min_opening_duration: Duration::ZERO,
                ..config()
            });
            let len = aligner
                .align(&src, &dst, SegmentKind::Opening)
                .unwrap()
                .map_or(0, |m| m.len);
            assert!(len >= last_len, "threshold {}: {} < {}", threshold, len, last_len);
            last_len = len;
        }
        assert_eq!(last_len, 40);
    }

    #[test]
    fn test_hash_period_mismatch() {
        let src = fingerprint(&random_hashes(8, 10), 0.5);
        let dst = fingerprint(&random_hashes(9, 10), 0.3);
        let aligner = Aligner::new(config());
        assert!(matches!(
            aligner.align(&src, &dst, SegmentKind::Opening),
            Err(Error::HashPeriodMismatch(..))
        ));
    }

    #[test]
    fn test_config_validate() {
        assert!(SearchConfig::default().validate().is_ok());
        let bad = SearchConfig {
            hash_match_threshold: 33,
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(Error::InvalidHashMatchThreshold(33))
        ));
        let bad = SearchConfig {
            opening_search_percentage: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidSearchPercentage(_))));
        let bad = SearchConfig {
            ending_search_percentage: 1.5,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidSearchPercentage(_))));
    }
}
