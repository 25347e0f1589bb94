#[cfg(feature = "rayon")]
extern crate rayon;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::aligner::{Aligner, Match, SearchConfig, SegmentKind, SkipRange};
use super::analyzer::Analyzer;
use super::data::{AudioFingerprint, FingerprintStore};
use super::decoder::Decoder;
use super::hasher::{Hasher, SpectralHasher};
use super::skip::SkipStore;
use crate::util;
use crate::{Error, Result};

/// Represents a single result for a video file. This is output by [Comparator::run].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SearchResult {
    /// Detected opening, if any.
    pub opening: Option<SkipRange>,
    /// Detected ending, if any.
    pub ending: Option<SkipRange>,
}

impl SearchResult {
    /// Returns true if neither an opening nor an ending was found.
    pub fn is_empty(&self) -> bool {
        self.opening.is_none() && self.ending.is_none()
    }
}

impl Display for SearchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (kind, range) in [
            (SegmentKind::Opening, self.opening),
            (SegmentKind::Ending, self.ending),
        ] {
            match range {
                Some(r) => writeln!(
                    f,
                    "* {} - {}-{}",
                    kind,
                    util::format_time(r.start),
                    util::format_time(r.end)
                )?,
                None => writeln!(f, "* {} - N/A", kind)?,
            }
        }
        Ok(())
    }
}

// Matches found between one pair of videos.
#[derive(Debug, Default)]
struct PairMatches {
    opening: Option<Match>,
    ending: Option<Match>,
}

// A candidate skip range for one video, found by aligning it with `partner`.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    range: SkipRange,
    len: usize,
    distance: u32,
    partner: usize,
}

impl Candidate {
    // Longest first, then lowest distance, then lowest partner index.
    fn is_better_than(&self, other: &Candidate) -> bool {
        (other.len, self.distance, self.partner) < (self.len, other.distance, other.partner)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct BestCandidates {
    opening: Option<Candidate>,
    ending: Option<Candidate>,
}

impl BestCandidates {
    fn offer(&mut self, candidate: Candidate) {
        let slot = match candidate.range.kind {
            SegmentKind::Opening => &mut self.opening,
            SegmentKind::Ending => &mut self.ending,
        };
        if slot.map_or(true, |c| candidate.is_better_than(&c)) {
            *slot = Some(candidate);
        }
    }

    fn into_result(self) -> SearchResult {
        SearchResult {
            opening: self.opening.map(|c| c.range),
            ending: self.ending.map(|c| c.range),
        }
    }
}

/// Compares two or more video files using either existing [AudioFingerprint]s or by running an
/// [Analyzer] in-place.
///
/// Every pair of videos is aligned with an [Aligner]. Each video then keeps the best opening
/// and the best ending it shares with any other video: the longest run, then the closest match,
/// then the earliest partner in path order.
#[derive(Debug)]
pub struct Comparator<P: AsRef<Path>> {
    videos: Vec<P>,
    config: SearchConfig,
    include_endings: bool,
    hash_period: f32,
    hash_duration: f32,
    threaded_decoding: bool,
    decoder: Option<Arc<dyn Decoder>>,
    hasher: Arc<dyn Hasher>,
    store: FingerprintStore,
    skip_store: SkipStore,
    frame_hashes: Vec<AudioFingerprint>,
}

impl<P: AsRef<Path>> Default for Comparator<P> {
    fn default() -> Self {
        Self {
            videos: Vec::new(),
            config: SearchConfig::default(),
            include_endings: false,
            hash_period: super::DEFAULT_HASH_PERIOD,
            hash_duration: super::DEFAULT_HASH_DURATION,
            threaded_decoding: false,
            decoder: None,
            hasher: Arc::new(SpectralHasher::new()),
            store: FingerprintStore::default(),
            skip_store: SkipStore::default(),
            frame_hashes: Vec::new(),
        }
    }
}

impl<P: AsRef<Path> + Ord> Comparator<P> {
    /// Constructs and validates a new [Comparator].
    pub fn new(
        videos: impl Into<Vec<P>>,
        include_endings: bool,
        hash_match_threshold: u32,
        min_opening_duration: Duration,
        min_ending_duration: Duration,
        time_padding: Duration,
    ) -> Result<Self> {
        let comparator = Self::from_files(videos)
            .with_include_endings(include_endings)
            .with_hash_match_threshold(hash_match_threshold)
            .with_min_opening_duration(min_opening_duration)
            .with_min_ending_duration(min_ending_duration)
            .with_time_padding(time_padding);
        comparator.validate()?;
        Ok(comparator)
    }

    /// Constructs a [Comparator] from a list of video paths.
    pub fn from_files(videos: impl Into<Vec<P>>) -> Self {
        let mut comparator = Self::default();
        comparator.videos = videos.into();
        comparator.videos.sort();
        comparator
    }
}

impl<P: AsRef<Path>> Comparator<P> {
    /// Returns the video paths used by this comparator.
    pub fn videos(&self) -> &[P] {
        &self.videos
    }

    /// Returns the search configuration.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Returns a new [Comparator] with the provided [SearchConfig].
    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns a new [Comparator] with the provided `hash_match_threshold`.
    pub fn with_hash_match_threshold(mut self, hash_match_threshold: u32) -> Self {
        self.config.hash_match_threshold = hash_match_threshold;
        self
    }

    /// Returns a new [Comparator] with the provided `opening_search_percentage`.
    pub fn with_opening_search_percentage(mut self, opening_search_percentage: f32) -> Self {
        self.config.opening_search_percentage = opening_search_percentage;
        self
    }

    /// Returns a new [Comparator] with the provided `ending_search_percentage`.
    pub fn with_ending_search_percentage(mut self, ending_search_percentage: f32) -> Self {
        self.config.ending_search_percentage = ending_search_percentage;
        self
    }

    /// Returns a new [Comparator] with the provided `min_opening_duration`.
    pub fn with_min_opening_duration(mut self, min_opening_duration: Duration) -> Self {
        self.config.min_opening_duration = min_opening_duration;
        self
    }

    /// Returns a new [Comparator] with the provided `min_ending_duration`.
    pub fn with_min_ending_duration(mut self, min_ending_duration: Duration) -> Self {
        self.config.min_ending_duration = min_ending_duration;
        self
    }

    /// Returns a new [Comparator] with the provided `time_padding`.
    pub fn with_time_padding(mut self, time_padding: Duration) -> Self {
        self.config.time_padding = time_padding;
        self
    }

    /// Returns a new [Comparator] with the provided `include_endings`.
    pub fn with_include_endings(mut self, include_endings: bool) -> Self {
        self.include_endings = include_endings;
        self
    }

    /// Returns a new [Comparator] with the `hash_period` used for in-place analysis.
    pub fn with_hash_period(mut self, hash_period: f32) -> Self {
        self.hash_period = hash_period;
        self
    }

    /// Returns a new [Comparator] with the `hash_duration` used for in-place analysis.
    pub fn with_hash_duration(mut self, hash_duration: f32) -> Self {
        self.hash_duration = hash_duration;
        self
    }

    /// Returns a new [Comparator] with `threaded_decoding` set for in-place analysis.
    pub fn with_threaded_decoding(mut self, threaded_decoding: bool) -> Self {
        self.threaded_decoding = threaded_decoding;
        self
    }

    /// Returns a new [Comparator] that decodes audio with the provided [Decoder].
    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Returns a new [Comparator] that hashes audio with the provided [Hasher].
    pub fn with_hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Returns a new [Comparator] that reads fingerprints from the provided [FingerprintStore].
    pub fn with_store(mut self, store: FingerprintStore) -> Self {
        self.store = store;
        self
    }

    /// Returns a new [Comparator] that reads and writes skip files with the provided [SkipStore].
    pub fn with_skip_store(mut self, skip_store: SkipStore) -> Self {
        self.skip_store = skip_store;
        self
    }

    /// Checks the configuration. This is done before any video is touched.
    pub fn validate(&self) -> Result<()> {
        if self.videos.len() < 2 {
            return Err(Error::ComparatorMinimumPaths(self.videos.len()));
        }
        self.config.validate()
    }

    // Returns the cached result for the video if its skip file is valid and up to date.
    fn load_skip_file(&self, path: &Path) -> Result<Option<SearchResult>> {
        let entry = match self.skip_store.load(path) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(e) if e.is_cache_miss() => {
                tracing::warn!("ignoring skip file for {}: {}", path.display(), e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let md5 = util::compute_header_md5sum(path)?;
        if entry.md5 != md5 {
            tracing::debug!("outdated skip file for {}", path.display());
            return Ok(None);
        }
        if entry.include_endings != self.include_endings {
            tracing::debug!(
                include_endings = entry.include_endings,
                "skip file for {} was written by a different search",
                path.display()
            );
            return Ok(None);
        }

        Ok(Some(entry.result))
    }

    // Fingerprints used for a search must cover every window being searched. Loaded ones must
    // also still belong to the file on disk.
    fn check_frame_hashes(
        &self,
        path: &Path,
        frame_hashes: &AudioFingerprint,
        check_md5: bool,
    ) -> Result<()> {
        let outdated = |reason: &str| Error::FrameHashDataOutdated {
            path: path.to_owned(),
            reason: reason.to_string(),
        };
        if self.include_endings && !frame_hashes.is_complete() {
            return Err(outdated(
                "fingerprint only covers the opening; analyze again with endings included",
            ));
        }
        if check_md5 && frame_hashes.md5() != util::compute_header_md5sum(path)? {
            return Err(outdated("video has changed since it was analyzed"));
        }
        Ok(())
    }

    fn check_all_frame_hashes(
        &self,
        frame_hashes: &[AudioFingerprint],
        check_md5: bool,
    ) -> Result<()> {
        self.videos
            .iter()
            .zip(frame_hashes)
            .try_for_each(|(v, fh)| self.check_frame_hashes(v.as_ref(), fh, check_md5))
    }

    fn load_skip_files(&self, use_skip_files: bool) -> Result<Vec<Option<SearchResult>>> {
        if !use_skip_files {
            return Ok(vec![None; self.videos.len()]);
        }
        self.videos
            .iter()
            .map(|v| self.load_skip_file(v.as_ref()))
            .collect()
    }

    fn search(
        &self,
        aligner: &Aligner,
        src: &AudioFingerprint,
        dst: &AudioFingerprint,
    ) -> Result<PairMatches> {
        let _g = tracing::span!(tracing::Level::TRACE, "search").entered();

        let opening = aligner.align(src, dst, SegmentKind::Opening)?;
        let ending = if self.include_endings {
            aligner.align(src, dst, SegmentKind::Ending)?
        } else {
            None
        };

        Ok(PairMatches { opening, ending })
    }
}

impl<P: AsRef<Path> + Sync> Comparator<P> {
    fn analyze(&self, threading: bool) -> Result<Vec<AudioFingerprint>> {
        let videos: Vec<&Path> = self.videos.iter().map(|v| v.as_ref()).collect();
        let mut analyzer = Analyzer::from_files(videos, self.threaded_decoding, false)
            .with_opening_search_percentage(self.config.opening_search_percentage)
            .with_ending_search_percentage(self.config.ending_search_percentage)
            .with_include_endings(self.include_endings)
            .with_hasher(self.hasher.clone())
            .with_store(self.store.clone());
        if let Some(decoder) = &self.decoder {
            analyzer = analyzer.with_decoder(decoder.clone());
        }
        analyzer.run(self.hash_period, self.hash_duration, false, threading)?;
        Ok(analyzer.into_frame_hashes())
    }

    /// Runs the comparator.
    ///
    /// * If this comparator was built from an [Analyzer] that has already run, its fingerprints
    ///   are used as-is. Otherwise, if `analyze` is set, an [Analyzer] is run in-place (reusing
    ///   any cached fingerprints), and if not, fingerprints are loaded from the [FingerprintStore].
    /// * If `use_skip_files` is set, videos with an up-to-date skip file reuse it, and pairs where
    ///   both videos have one are not searched. If `write_skip_files` is set, a skip file is
    ///   written for each video with a new, non-empty result.
    /// * If `display` is set, the final results will be printed to stdout.
    pub fn run(
        &self,
        analyze: bool,
        display: bool,
        use_skip_files: bool,
        write_skip_files: bool,
        threading: bool,
    ) -> Result<BTreeMap<PathBuf, SearchResult>> {
        self.validate()?;
        let cached = self.load_skip_files(use_skip_files)?;

        let loaded;
        let frame_hashes: &[AudioFingerprint] = if cached.iter().all(Option::is_some) {
            &[]
        } else if self.frame_hashes.len() == self.videos.len() {
            self.check_all_frame_hashes(&self.frame_hashes, false)?;
            &self.frame_hashes
        } else if analyze {
            loaded = self.analyze(threading)?;
            &loaded
        } else {
            loaded = self
                .videos
                .iter()
                .map(|v| self.store.load(v))
                .collect::<Result<Vec<_>>>()?;
            self.check_all_frame_hashes(&loaded, true)?;
            &loaded
        };

        self.compare(frame_hashes, cached, display, write_skip_files, threading)
    }

    /// Runs the comparator on the provided fingerprints, given in the same order as
    /// [Comparator::videos].
    pub fn run_with_frame_hashes(
        &self,
        frame_hashes: &[AudioFingerprint],
        display: bool,
        use_skip_files: bool,
        write_skip_files: bool,
        threading: bool,
    ) -> Result<BTreeMap<PathBuf, SearchResult>> {
        self.validate()?;
        if frame_hashes.len() != self.videos.len() {
            return Err(Error::InvalidVideoIndex(
                frame_hashes.len().min(self.videos.len()),
            ));
        }
        self.check_all_frame_hashes(frame_hashes, false)?;
        let cached = self.load_skip_files(use_skip_files)?;
        self.compare(frame_hashes, cached, display, write_skip_files, threading)
    }

    fn compare(
        &self,
        frame_hashes: &[AudioFingerprint],
        cached: Vec<Option<SearchResult>>,
        display: bool,
        write_skip_files: bool,
        threading: bool,
    ) -> Result<BTreeMap<PathBuf, SearchResult>> {
        // Build a list of video pairs for actual search. Pairs should only appear once.
        // Given N videos, this will result in: (N * (N-1)) / 2 pairs, minus the pairs
        // where both sides already have a skip file.
        let num_videos = self.videos.len();
        let mut pairs = Vec::new();
        for i in 0..num_videos {
            for j in i + 1..num_videos {
                if cached[i].is_some() && cached[j].is_some() {
                    continue;
                }
                pairs.push((i, j));
            }
        }

        tracing::debug!(
            num_pairs = pairs.len(),
            num_cached = cached.iter().filter(|c| c.is_some()).count(),
            "started audio comparator"
        );

        let aligner = Aligner::new(self.config);
        let search = |&(i, j): &(usize, usize)| {
            self.search(&aligner, &frame_hashes[i], &frame_hashes[j])
        };

        let mut data = Vec::new();

        if cfg!(feature = "rayon") && threading {
            // Perform the search in parallel for all pairs.
            #[cfg(feature = "rayon")]
            {
                data = pairs.par_iter().map(search).collect::<Vec<_>>();
            }
        } else {
            data.extend(pairs.iter().map(search));
        }

        // For each video, keep the best opening and ending candidate among the other videos.
        let mut best = vec![BestCandidates::default(); num_videos];
        for (&(i, j), matches) in pairs.iter().zip(data) {
            let matches = matches?;
            for m in [matches.opening, matches.ending].into_iter().flatten() {
                best[i].offer(Candidate {
                    range: m.src,
                    len: m.len,
                    distance: m.distance,
                    partner: j,
                });
                best[j].offer(Candidate {
                    range: m.dst,
                    len: m.len,
                    distance: m.distance,
                    partner: i,
                });
            }
        }

        let mut match_map = BTreeMap::new();

        for ((path, cached), best) in self.videos.iter().zip(cached).zip(best) {
            let path = path.as_ref();
            if display {
                println!("\n{}\n", path.display());
            }

            let result = match cached {
                Some(result) => {
                    if display {
                        println!("Using existing skip file...");
                    }
                    result
                }
                None => {
                    let result = best.into_result();
                    if write_skip_files && !result.is_empty() {
                        let md5 = util::compute_header_md5sum(path)?;
                        self.skip_store.save(path, &md5, self.include_endings, &result)?;
                    }
                    result
                }
            };

            if display {
                if result.is_empty() {
                    println!("No opening or ending found.");
                } else {
                    print!("{}", result);
                }
            }
            match_map.insert(path.to_owned(), result);
        }

        Ok(match_map)
    }
}

impl<P: AsRef<Path> + Ord> From<Analyzer<P>> for Comparator<P> {
    /// Builds a [Comparator] with the analyzer's settings. If the analyzer has already run, its
    /// fingerprints are carried over and [Comparator::run] does not need to analyze again.
    fn from(analyzer: Analyzer<P>) -> Self {
        let mut comparator = Self::default()
            .with_opening_search_percentage(analyzer.opening_search_percentage)
            .with_ending_search_percentage(analyzer.ending_search_percentage)
            .with_include_endings(analyzer.include_endings)
            .with_hasher(analyzer.hasher)
            .with_store(analyzer.store);
        comparator.decoder = analyzer.decoder;

        if analyzer.frame_hashes.len() == analyzer.videos.len() {
            let mut entries: Vec<(P, AudioFingerprint)> = analyzer
                .videos
                .into_iter()
                .zip(analyzer.frame_hashes)
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let (videos, frame_hashes): (Vec<P>, Vec<AudioFingerprint>) =
                entries.into_iter().unzip();
            comparator.videos = videos;
            comparator.frame_hashes = frame_hashes;
        } else {
            comparator.videos = analyzer.videos;
            comparator.videos.sort();
        }

        comparator
    }
}
