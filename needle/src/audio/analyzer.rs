#[cfg(feature = "rayon")]
extern crate rayon;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::aligner::validate_percentage;
use super::data::{AudioFingerprint, FingerprintStore, FrameHash};
use super::decoder::{default_decoder, Decoder};
use super::hasher::{Hasher, SpectralHasher};
use crate::{util, Error, Result};

// Hashing parameters for one run, snapped to whole samples at the hasher's rate.
#[derive(Clone, Copy, Debug)]
struct HashParams {
    sample_rate: u32,
    step: usize,
    window: usize,
    hash_period: Duration,
    hash_duration: Duration,
}

/// Analyzes one or more videos and converts them into [AudioFingerprint]s.
///
/// If `threaded_decoding` is set to `true`, the decoder is allowed to use multiple threads for
/// each video. If `force` is set, any existing fingerprint data on disk will be **ignored**.
///
/// At a high-level, the analyzer does the following for a given video:
///
/// 1. Reuses the cached fingerprint if it was built from the same file with the same settings
/// 2. Decodes the best audio stream into mono PCM at the hasher's sample rate
/// 3. Slides a `hash_duration` window across the audio, `hash_period` at a time, and hashes
///    each window (a trailing partial window is dropped)
/// 4. Returns an [AudioFingerprint] and (optionally) writes it to the [FingerprintStore]
///
/// If `include_endings` is false, only the opening search window (plus one hash duration) of
/// each video is decoded.
///
/// # Example
///
/// ```no_run
/// use std::path::PathBuf;
/// use needle::audio::Analyzer;
///
/// let video_paths: Vec<PathBuf> = vec!["/tmp/ep1.mkv".into(), "/tmp/ep2.mkv".into()];
/// let mut analyzer = Analyzer::from_files(video_paths, false, false);
/// let frame_hashes = analyzer.run(1.0, 3.0, false, false).unwrap();
/// ```
#[derive(Debug)]
pub struct Analyzer<P: AsRef<Path>> {
    pub(crate) videos: Vec<P>,
    pub(crate) opening_search_percentage: f32,
    pub(crate) ending_search_percentage: f32,
    pub(crate) include_endings: bool,
    threaded_decoding: bool,
    force: bool,
    pub(crate) decoder: Option<Arc<dyn Decoder>>,
    pub(crate) hasher: Arc<dyn Hasher>,
    pub(crate) store: FingerprintStore,
    pub(crate) frame_hashes: Vec<AudioFingerprint>,
}

impl<P: AsRef<Path>> Default for Analyzer<P> {
    fn default() -> Self {
        Self {
            videos: Default::default(),
            opening_search_percentage: super::DEFAULT_OPENING_SEARCH_PERCENTAGE,
            ending_search_percentage: super::DEFAULT_ENDING_SEARCH_PERCENTAGE,
            include_endings: false,
            threaded_decoding: false,
            force: false,
            decoder: None,
            hasher: Arc::new(SpectralHasher::new()),
            store: FingerprintStore::default(),
            frame_hashes: Vec::new(),
        }
    }
}

impl<P: AsRef<Path>> Analyzer<P> {
    /// Constructs and validates a new [Analyzer].
    pub fn new(
        videos: impl Into<Vec<P>>,
        opening_search_percentage: f32,
        ending_search_percentage: f32,
        include_endings: bool,
        threaded_decoding: bool,
        force: bool,
    ) -> Result<Self> {
        let analyzer = Self::from_files(videos, threaded_decoding, force)
            .with_opening_search_percentage(opening_search_percentage)
            .with_ending_search_percentage(ending_search_percentage)
            .with_include_endings(include_endings);
        analyzer.validate()?;
        Ok(analyzer)
    }

    /// Constructs a new [Analyzer] from a list of video paths.
    pub fn from_files(videos: impl Into<Vec<P>>, threaded_decoding: bool, force: bool) -> Self {
        let mut analyzer = Self::default()
            .with_threaded_decoding(threaded_decoding)
            .with_force(force);
        analyzer.videos = videos.into();
        analyzer
    }

    /// Returns the video paths used by this analyzer.
    pub fn videos(&self) -> &[P] {
        &self.videos
    }

    /// Returns a new [Analyzer] with the provided `opening_search_percentage`.
    pub fn with_opening_search_percentage(mut self, opening_search_percentage: f32) -> Self {
        self.opening_search_percentage = opening_search_percentage;
        self
    }

    /// Returns a new [Analyzer] with the provided `ending_search_percentage`.
    pub fn with_ending_search_percentage(mut self, ending_search_percentage: f32) -> Self {
        self.ending_search_percentage = ending_search_percentage;
        self
    }

    /// Returns a new [Analyzer] with the provided `include_endings`.
    pub fn with_include_endings(mut self, include_endings: bool) -> Self {
        self.include_endings = include_endings;
        self
    }

    /// Returns a new [Analyzer] with `thread_decoding` set to the provided value.
    pub fn with_threaded_decoding(mut self, threaded_decoding: bool) -> Self {
        self.threaded_decoding = threaded_decoding;
        self
    }

    /// Returns a new [Analyzer] with `force` set to the provided value.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Returns a new [Analyzer] that decodes audio with the provided [Decoder].
    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Returns a new [Analyzer] that hashes audio with the provided [Hasher].
    pub fn with_hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Returns a new [Analyzer] that caches fingerprints in the provided [FingerprintStore].
    pub fn with_store(mut self, store: FingerprintStore) -> Self {
        self.store = store;
        self
    }

    /// Checks the configuration. This is done before any video is touched.
    pub fn validate(&self) -> Result<()> {
        if self.videos.is_empty() {
            return Err(Error::AnalyzerMissingPaths);
        }
        validate_percentage(self.opening_search_percentage)?;
        validate_percentage(self.ending_search_percentage)?;
        Ok(())
    }

    /// Returns the fingerprint of the video at `index`, in the order the paths were given.
    pub fn get_frame_hashes(&self, index: usize) -> Result<&AudioFingerprint> {
        self.frame_hashes
            .get(index)
            .ok_or(Error::InvalidVideoIndex(index))
    }

    /// Returns the fingerprints computed by the last successful [Analyzer::run].
    pub fn frame_hashes(&self) -> &[AudioFingerprint] {
        &self.frame_hashes
    }

    /// Consumes the analyzer and returns its fingerprints.
    pub fn into_frame_hashes(self) -> Vec<AudioFingerprint> {
        self.frame_hashes
    }

    fn hash_params(&self, hash_period: f32, hash_duration: f32) -> Result<HashParams> {
        let sample_rate = self.hasher.sample_rate();
        if !hash_period.is_finite() || hash_period <= 0.0 {
            return Err(Error::AnalyzerInvalidHashPeriod(hash_period));
        }
        let step = (hash_period as f64 * sample_rate as f64).round() as usize;
        if step == 0 {
            return Err(Error::AnalyzerInvalidHashPeriod(hash_period));
        }

        let min_window = self.hasher.min_window_len();
        let window = if hash_duration.is_finite() && hash_duration > 0.0 {
            (hash_duration as f64 * sample_rate as f64).round() as usize
        } else {
            0
        };
        if window < min_window {
            return Err(Error::AnalyzerInvalidHashDuration {
                duration: hash_duration,
                reason: format!(
                    "must be at least {:.3} seconds",
                    min_window as f64 / sample_rate as f64
                ),
            });
        }

        Ok(HashParams {
            sample_rate,
            step,
            window,
            hash_period: Duration::from_secs_f64(step as f64 / sample_rate as f64),
            hash_duration: Duration::from_secs_f64(window as f64 / sample_rate as f64),
        })
    }

    // Returns true if a cached fingerprint can stand in for a fresh analysis.
    fn is_reusable(&self, data: &AudioFingerprint, md5: &str, params: &HashParams) -> bool {
        if data.md5() != md5
            || data.sample_rate() != params.sample_rate
            || data.hash_period() != params.hash_period
            || data.hash_duration() != params.hash_duration
        {
            return false;
        }
        if data.is_complete() {
            return true;
        }
        if self.include_endings {
            return false;
        }
        // A partial fingerprint is fine as long as it covers the opening search window.
        let opening_end = data.duration().mul_f32(self.opening_search_percentage);
        data.hashes()
            .last()
            .map_or(false, |h| h.timestamp + params.hash_period >= opening_end)
    }

    fn hash_samples(&self, samples: &[i16], params: &HashParams) -> Result<Vec<FrameHash>> {
        samples
            .windows(params.window)
            .step_by(params.step)
            .enumerate()
            .map(|(i, window)| {
                Ok(FrameHash {
                    timestamp: params.hash_period * i as u32,
                    hash: self.hasher.hash(window)?,
                })
            })
            .collect()
    }

    fn run_single(
        &self,
        path: &Path,
        params: &HashParams,
        decoder: &dyn Decoder,
        persist: bool,
    ) -> Result<AudioFingerprint> {
        let span = tracing::span!(tracing::Level::TRACE, "run");
        let _enter = span.enter();

        // Check if we've already analyzed this video by comparing MD5 hashes.
        let md5 = util::compute_header_md5sum(path)?;
        if !self.force {
            match self.store.load(path) {
                Ok(data) if self.is_reusable(&data, &md5, params) => {
                    tracing::debug!("skipping analysis for {}", path.display());
                    return Ok(data);
                }
                Ok(_) => tracing::debug!("outdated frame hash data for {}", path.display()),
                Err(e) if e.is_cache_miss() => {
                    tracing::debug!("no usable frame hash data for {}: {}", path.display(), e)
                }
                Err(e) => return Err(e),
            }
        }

        let duration = decoder.duration(path)?;
        if params.hash_duration > duration {
            return Err(Error::AnalyzerInvalidHashDuration {
                duration: params.hash_duration.as_secs_f32(),
                reason: format!(
                    "longer than the audio in {} ({})",
                    path.display(),
                    util::format_time(duration)
                ),
            });
        }

        let until = if self.include_endings {
            None
        } else {
            Some(duration.mul_f32(self.opening_search_percentage) + params.hash_duration)
                .filter(|until| *until < duration)
        };

        tracing::debug!("starting frame processing for {}", path.display());

        let pcm = decoder.decode(path, params.sample_rate, until)?;
        let hashes = self.hash_samples(&pcm.samples, params)?;

        tracing::debug!(
            num_hashes = hashes.len(),
            complete = until.is_none(),
            "completed frame processing for {}",
            path.display(),
        );

        let frame_hashes = AudioFingerprint::new(
            hashes,
            params.sample_rate,
            params.hash_period,
            params.hash_duration,
            duration,
            until.is_none(),
            md5,
        );

        if persist {
            self.store.save(path, &frame_hashes)?;
        }

        Ok(frame_hashes)
    }
}

impl<P: AsRef<Path> + Sync> Analyzer<P> {
    /// Analyzes every video and returns one result per video, in path order.
    ///
    /// The outer error is only returned for an invalid configuration, before any video is
    /// decoded. A failure for one video does not stop the others.
    pub fn run_each(
        &self,
        hash_period: f32,
        hash_duration: f32,
        persist: bool,
        threading: bool,
    ) -> Result<Vec<Result<AudioFingerprint>>> {
        self.validate()?;
        let params = self.hash_params(hash_period, hash_duration)?;
        let decoder = self
            .decoder
            .clone()
            .unwrap_or_else(|| default_decoder(self.threaded_decoding));
        let decoder = decoder.as_ref();

        let mut data = Vec::new();

        if cfg!(feature = "rayon") && threading {
            #[cfg(feature = "rayon")]
            {
                data = self
                    .videos
                    .par_iter()
                    .map(|path| self.run_single(path.as_ref(), &params, decoder, persist))
                    .collect::<Vec<_>>();
            }
        } else {
            data.extend(
                self.videos
                    .iter()
                    .map(|path| self.run_single(path.as_ref(), &params, decoder, persist)),
            );
        }

        Ok(data)
    }

    /// Runs this analyzer.
    ///
    /// Every video is processed even if another one fails. Once all are done, the first failure
    /// (in path order) is returned as an [Error::Analysis] naming the video.
    pub fn run(
        &mut self,
        hash_period: f32,
        hash_duration: f32,
        persist: bool,
        threading: bool,
    ) -> Result<&[AudioFingerprint]> {
        let results = self.run_each(hash_period, hash_duration, persist, threading)?;

        let mut frame_hashes = Vec::with_capacity(results.len());
        for (path, result) in self.videos.iter().zip(results) {
            match result {
                Ok(data) => frame_hashes.push(data),
                Err(e) => {
                    return Err(Error::Analysis {
                        path: path.as_ref().to_owned(),
                        source: Box::new(e),
                    })
                }
            }
        }
        self.frame_hashes = frame_hashes;

        Ok(&self.frame_hashes)
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::audio::test_util::{episodes, noise, seconds, MemoryDecoder};

    fn new_analyzer(paths: &[PathBuf], decoder: Arc<MemoryDecoder>) -> Analyzer<PathBuf> {
        Analyzer::new(paths.to_vec(), 0.5, 0.5, true, false, false)
            .unwrap()
            .with_decoder(decoder)
    }

    #[test]
    fn test_invalid_config() {
        let err = Analyzer::<PathBuf>::new(Vec::new(), 0.5, 0.5, true, false, false).unwrap_err();
        assert!(matches!(err, Error::AnalyzerMissingPaths));

        let err = Analyzer::new(vec![PathBuf::from("a.mkv")], 1.5, 0.5, true, false, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSearchPercentage(_)));

        let mut analyzer = Analyzer::from_files(vec![PathBuf::from("a.mkv")], false, false);
        assert!(matches!(
            analyzer.run(0.0, 3.0, false, false),
            Err(Error::AnalyzerInvalidHashPeriod(_))
        ));
        assert!(matches!(
            analyzer.run(-1.0, 3.0, false, false),
            Err(Error::AnalyzerInvalidHashPeriod(_))
        ));
        let err = analyzer.run(0.3, 0.1, false, false).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"invalid hash duration 0.1: must be at least 0.495 seconds");
    }

    #[test]
    fn test_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, decoder) = episodes(dir.path(), &[0.0], 5.0, 10.0);
        let mut analyzer = new_analyzer(&paths, decoder);

        let data = analyzer.run(0.4, 2.0, false, false).unwrap()[0].clone();
        assert!(data.validate().is_ok());
        assert!(data.is_complete());
        assert_eq!(data.duration(), Duration::from_secs(10));
        assert_eq!(data.hash_period(), Duration::from_millis(400));
        // (10s - 2s) / 0.4s windows, plus the one at zero.
        assert_eq!(data.len(), 21);
        for (i, h) in data.hashes().iter().enumerate() {
            assert_eq!(h.timestamp, Duration::from_millis(400) * i as u32);
        }
        assert_eq!(analyzer.get_frame_hashes(0).unwrap(), &data);
        assert!(matches!(
            analyzer.get_frame_hashes(1),
            Err(Error::InvalidVideoIndex(1))
        ));
    }

    #[test]
    fn test_openings_only() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, decoder) = episodes(dir.path(), &[0.0], 5.0, 20.0);
        let mut analyzer = new_analyzer(&paths, decoder).with_include_endings(false);

        let data = &analyzer.run(0.4, 2.0, false, false).unwrap()[0];
        assert!(!data.is_complete());
        assert_eq!(data.duration(), Duration::from_secs(20));
        // Opening window is 10s; decoding stops one hash duration later.
        assert_eq!(data.hashes().last().unwrap().timestamp, Duration::from_secs(10));
    }

    #[test]
    fn test_hash_duration_longer_than_video() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, decoder) = episodes(dir.path(), &[0.0], 1.0, 2.0);
        let mut analyzer = new_analyzer(&paths, decoder);

        let err = analyzer.run(0.4, 3.0, false, false).unwrap_err();
        assert!(matches!(err, Error::Analysis { .. }));
        assert!(matches!(
            err.root(),
            Error::AnalyzerInvalidHashDuration { .. }
        ));
    }

    #[test]
    fn test_failure_attributed_to_video() {
        let dir = tempfile::tempdir().unwrap();
        let (mut paths, decoder) = episodes(dir.path(), &[0.0, 1.0], 5.0, 10.0);

        // A file on disk that the decoder knows nothing about.
        let broken = dir.path().join("episode-0.mkv");
        std::fs::write(&broken, "broken").unwrap();
        paths.insert(1, broken.clone());

        let mut analyzer = new_analyzer(&paths, decoder.clone());
        let results = analyzer.run_each(0.4, 2.0, false, false).unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());

        match analyzer.run(0.4, 2.0, false, true) {
            Err(Error::Analysis { path, source }) => {
                assert_eq!(path, broken);
                assert!(matches!(*source, Error::NoAudioStream(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // All other videos were decoded both times.
        assert_eq!(decoder.decodes(), 4);
    }

    #[test]
    fn test_cache_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, decoder) = episodes(dir.path(), &[0.0, 2.0], 5.0, 10.0);

        let mut analyzer = new_analyzer(&paths, decoder.clone());
        let first = analyzer.run(0.4, 2.0, true, true).unwrap().to_vec();
        assert_eq!(decoder.decodes(), 2);
        assert!(dir.path().join("episode-1.mkv.needle.bin").exists());

        // Served from the store.
        let second = analyzer.run(0.4, 2.0, true, true).unwrap().to_vec();
        assert_eq!(decoder.decodes(), 2);
        assert_eq!(first, second);

        // Different settings are never served from the store.
        analyzer.run(0.8, 2.0, false, false).unwrap();
        assert_eq!(decoder.decodes(), 4);

        // A forced run recomputes the same fingerprints.
        let mut forced = new_analyzer(&paths, decoder.clone()).with_force(true);
        let third = forced.run(0.4, 2.0, false, false).unwrap().to_vec();
        assert_eq!(decoder.decodes(), 6);
        assert_eq!(first, third);
    }

    #[test]
    fn test_cache_invalidated_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ep1.mkv");
        std::fs::write(&path, "version one").unwrap();

        let mut decoder = MemoryDecoder::default();
        decoder.insert(&path, noise(1, seconds(4.0)));
        let decoder = Arc::new(decoder);
        let store = FingerprintStore::new().with_cache_dir(dir.path().join("cache"));

        let mut analyzer = new_analyzer(&[path.clone()], decoder.clone()).with_store(store.clone());
        analyzer.run(0.4, 2.0, true, false).unwrap();
        assert!(store.load(&path).is_ok());

        std::fs::write(&path, "version two").unwrap();
        analyzer.run(0.4, 2.0, true, false).unwrap();
        assert_eq!(decoder.decodes(), 2);

        // Corrupt entries are recomputed and replaced.
        std::fs::write(store.path_for(&path), b"garbage").unwrap();
        analyzer.run(0.4, 2.0, true, false).unwrap();
        assert_eq!(decoder.decodes(), 3);
        assert!(store.load(&path).is_ok());
    }
}
