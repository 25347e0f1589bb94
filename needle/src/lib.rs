#![deny(missing_docs)]

//! # needle
//!
//! needle detects openings/intros and endings/credits across video files that belong to the same
//! series. It can be used standalone via a dedicated CLI, or as a library to implement higher-level
//! tools or plugins (e.g., for intro skipping).
//!
//! The library exposes two central structs:
//!
//! 1. [Analyzer](crate::audio::Analyzer): Decodes one or more videos and converts each audio track into
//!    an [AudioFingerprint](crate::audio::AudioFingerprint).
//! 2. [Comparator](crate::audio::Comparator): Aligns fingerprints across two or more videos and reports
//!    the detected [SkipRange](crate::audio::SkipRange)s.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use needle::audio::{Analyzer, Comparator};
//!
//! let video_paths: Vec<PathBuf> = vec!["/tmp/ep1.mkv".into(), "/tmp/ep2.mkv".into()];
//! let mut analyzer = Analyzer::from_files(video_paths, false, false).with_include_endings(true);
//!
//! // Use a `hash_period` of 0.3, `hash_duration` of 3.0, do not `persist` the fingerprints
//! // and enable `threading`.
//! analyzer.run(0.3, 3.0, false, true).unwrap();
//!
//! let frame_hashes = analyzer.get_frame_hashes(0).unwrap();
//! println!("{} hashes", frame_hashes.len());
//!
//! let comparator: Comparator<PathBuf> = analyzer.into();
//! let results = comparator.run(true, true, false, false, true).unwrap();
//! dbg!(results);
//! ```
//!
//! The output of [Comparator::run](crate::audio::Comparator::run) is a map from each video file to a
//! [SearchResult](crate::audio::SearchResult), which holds the opening and ending skip ranges (if any).

use std::path::PathBuf;

/// Detects opening and endings across videos using just audio streams.
pub mod audio;
/// Common utility functions.
pub mod util;

/// Common error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Frame hash data was not found on disk.
    #[error("frame hash data not found at: {0:?}")]
    FrameHashDataNotFound(PathBuf),
    /// Frame hash data on disk has a version this build does not understand.
    #[error("invalid frame hash data version {version} at: {path:?}")]
    FrameHashDataInvalidVersion {
        /// Path of the cache entry.
        path: PathBuf,
        /// Version tag read from the entry.
        version: u32,
    },
    /// Frame hash data on disk could not be decoded.
    #[error("invalid frame hash data at {path:?}: {reason}")]
    InvalidFrameHashData {
        /// Path of the cache entry.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// Frame hash data does not fit the requested search and the video must be analyzed again.
    #[error("outdated frame hash data for {path:?}: {reason}")]
    FrameHashDataOutdated {
        /// Video the fingerprint belongs to.
        path: PathBuf,
        /// What does not match.
        reason: String,
    },
    /// Skip data on disk has a version this build does not understand.
    #[error("invalid skip data version {version} at: {path:?}")]
    SkipDataInvalidVersion {
        /// Path of the skip file.
        path: PathBuf,
        /// Version tag read from the file.
        version: u32,
    },
    /// Skip data on disk could not be decoded.
    #[error("invalid skip data at {path:?}: {reason}")]
    InvalidSkipData {
        /// Path of the skip file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// No paths were provided to the [crate::audio::Analyzer].
    #[error("no paths provided to analyzer")]
    AnalyzerMissingPaths,
    /// The [crate::audio::Comparator] needs at least two videos.
    #[error("comparator requires at least 2 video paths, got {0}")]
    ComparatorMinimumPaths(usize),
    /// Hash period must be a positive number of seconds.
    #[error("hash period must be greater than 0, got {0}")]
    AnalyzerInvalidHashPeriod(f32),
    /// Hash duration is too short for the hasher, or too long for the video.
    #[error("invalid hash duration {duration}: {reason}")]
    AnalyzerInvalidHashDuration {
        /// Requested duration, in seconds.
        duration: f32,
        /// Why it was rejected.
        reason: String,
    },
    /// Search percentages must be in `(0, 1]`.
    #[error("search percentage must be in (0, 1], got {0}")]
    InvalidSearchPercentage(f32),
    /// Hash match threshold cannot exceed the hash width.
    #[error("hash match threshold cannot be larger than 32, got {0}")]
    InvalidHashMatchThreshold(u32),
    /// Two fingerprints generated with different hash periods cannot be aligned.
    #[error("cannot align fingerprints with different hash periods ({0:?} vs {1:?})")]
    HashPeriodMismatch(std::time::Duration, std::time::Duration),
    /// No frame hashes are available at the given index.
    #[error("no frame hashes available for video index {0}")]
    InvalidVideoIndex(usize),
    /// Invalid path.
    #[error("path does not exist: {0:?}")]
    PathNotFound(PathBuf),
    /// The video has no audio stream.
    #[error("no audio stream found in: {0:?}")]
    NoAudioStream(PathBuf),
    /// No audio decoder was compiled in or configured.
    #[error("no audio decoder available; enable the `ffmpeg` feature or provide a decoder")]
    DecoderUnavailable,
    /// Analysis of a single video failed.
    #[error("failed to analyze {path:?}: {source}")]
    Analysis {
        /// Video that failed.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Wraps [ffmpeg_next::Error].
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
    /// Error raised by the Chromaprint hasher.
    #[cfg(feature = "chromaprint")]
    #[error("chromaprint error: {0}")]
    ChromaprintError(String),
    /// Wraps [realfft::FftError].
    #[error("FFT error: {0}")]
    FftError(#[from] realfft::FftError),
    /// Wraps [bincode::Error].
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    /// Wraps [serde_json::Error].
    #[error("serde_json error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    /// Wraps [std::io::Error].
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl Error {
    /// Returns the innermost error, skipping any per-video [Error::Analysis] wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Analysis { source, .. } => source.root(),
            e => e,
        }
    }

    /// Returns true if this is a recoverable cache miss (missing, outdated, or corrupt entry).
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self.root(),
            Error::FrameHashDataNotFound(_)
                | Error::FrameHashDataInvalidVersion { .. }
                | Error::InvalidFrameHashData { .. }
                | Error::SkipDataInvalidVersion { .. }
                | Error::InvalidSkipData { .. }
        )
    }
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;
