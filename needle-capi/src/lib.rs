#![deny(missing_docs)]
//! # needle-capi
//!
//! C bindings for `needle`. Every function returns a [NeedleError] and writes its result
//! through an output pointer. Objects returned by `*_new` functions are owned by the caller and
//! must be released with the matching `*_free` function.
//!
//! Decoding videos requires the `ffmpeg` feature. Without it, every analysis fails with
//! `NeedleError_DecoderUnavailable`.
//!
//! ```c
//! #include <stdio.h>
//! #include "needle.h"
//!
//! int main(int argc, char **argv) {
//!     NeedleAudioComparator *comparator = NULL;
//!     NeedleError err = needle_audio_comparator_new_default((const char **)&argv[1], argc - 1, &comparator);
//!     if (err != NeedleError_Ok) {
//!         printf("%s\n", needle_error_to_str(err));
//!         return 1;
//!     }
//!     err = needle_audio_comparator_run(comparator, true, true, true, true, true);
//!     needle_audio_comparator_free(comparator);
//!     return err;
//! }
//! ```
extern crate libc;

use std::ffi::{CStr, CString};
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use needle::audio;

/// Error codes returned by this library.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NeedleError {
    /// No error.
    Ok = 0,
    /// A string argument was not valid UTF-8.
    InvalidUtf8String,
    /// A required pointer argument was null.
    NullArgument,
    /// An argument was out of range.
    InvalidArgument,
    /// No fingerprint data was found for a video.
    FrameHashDataNotFound,
    /// Fingerprint data on disk has an unknown version.
    FrameHashDataInvalidVersion,
    /// Fingerprint data on disk could not be read.
    InvalidFrameHashData,
    /// Fingerprint data does not fit the search and the video must be analyzed again.
    FrameHashDataOutdated,
    /// A skip file on disk has an unknown version.
    SkipDataInvalidVersion,
    /// A skip file on disk could not be read.
    InvalidSkipData,
    /// The comparator was given fewer than two videos.
    ComparatorMinimumPaths,
    /// The hash period is not a positive number of seconds.
    AnalyzerInvalidHashPeriod,
    /// The hash duration is too short for the hasher or the videos.
    AnalyzerInvalidHashDuration,
    /// No decoder is available in this build.
    DecoderUnavailable,
    /// An I/O or decoding error.
    IOError,
    /// Any other error.
    Unknown,
}

impl NeedleError {
    // Nul-terminated so that the same text can be handed out to C callers.
    fn description(&self) -> &'static str {
        match self {
            Self::Ok => "No error\0",
            Self::InvalidUtf8String => "Invalid UTF-8 string\0",
            Self::NullArgument => "Input argument is null\0",
            Self::InvalidArgument => "Input argument is invalid\0",
            Self::FrameHashDataNotFound => "Frame hash data not found\0",
            Self::FrameHashDataInvalidVersion => "Frame hash data has an invalid version\0",
            Self::InvalidFrameHashData => "Frame hash data is invalid\0",
            Self::FrameHashDataOutdated => "Frame hash data is outdated\0",
            Self::SkipDataInvalidVersion => "Skip data has an invalid version\0",
            Self::InvalidSkipData => "Skip data is invalid\0",
            Self::ComparatorMinimumPaths => "Comparator requires at least 2 video paths\0",
            Self::AnalyzerInvalidHashPeriod => "Hash period must be greater than 0\0",
            Self::AnalyzerInvalidHashDuration => "Hash duration is invalid\0",
            Self::DecoderUnavailable => "No audio decoder is available\0",
            Self::IOError => "I/O error\0",
            Self::Unknown => "Unknown error\0",
        }
    }
}

impl Display for NeedleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description().trim_end_matches('\0'))
    }
}

impl From<needle::Error> for NeedleError {
    fn from(err: needle::Error) -> Self {
        tracing::error!("{}", err);

        match err.root() {
            needle::Error::FrameHashDataNotFound(_) => Self::FrameHashDataNotFound,
            needle::Error::FrameHashDataInvalidVersion { .. } => Self::FrameHashDataInvalidVersion,
            needle::Error::InvalidFrameHashData { .. } | needle::Error::BincodeError(_) => {
                Self::InvalidFrameHashData
            }
            needle::Error::FrameHashDataOutdated { .. } => Self::FrameHashDataOutdated,
            needle::Error::SkipDataInvalidVersion { .. } => Self::SkipDataInvalidVersion,
            needle::Error::InvalidSkipData { .. } | needle::Error::SerdeJSONError(_) => {
                Self::InvalidSkipData
            }
            needle::Error::ComparatorMinimumPaths(_) => Self::ComparatorMinimumPaths,
            needle::Error::AnalyzerInvalidHashPeriod(_) => Self::AnalyzerInvalidHashPeriod,
            needle::Error::AnalyzerInvalidHashDuration { .. } => Self::AnalyzerInvalidHashDuration,
            needle::Error::AnalyzerMissingPaths
            | needle::Error::InvalidSearchPercentage(_)
            | needle::Error::InvalidHashMatchThreshold(_)
            | needle::Error::HashPeriodMismatch(..)
            | needle::Error::InvalidVideoIndex(_) => Self::InvalidArgument,
            needle::Error::DecoderUnavailable => Self::DecoderUnavailable,
            needle::Error::IOError(_)
            | needle::Error::PathNotFound(_)
            | needle::Error::NoAudioStream(_) => Self::IOError,
            #[cfg(feature = "ffmpeg")]
            needle::Error::FFmpegError(_) => Self::IOError,
            _ => Self::Unknown,
        }
    }
}

/// Returns a static, nul-terminated description of the given error.
#[no_mangle]
pub extern "C" fn needle_error_to_str(error: NeedleError) -> *const libc::c_char {
    error.description().as_ptr() as *const libc::c_char
}

unsafe fn get_paths_from_raw(
    raw_paths: *const *const libc::c_char,
    len: libc::size_t,
) -> Result<Vec<PathBuf>, NeedleError> {
    if raw_paths.is_null() {
        return Err(NeedleError::NullArgument);
    }

    let raw_paths = std::slice::from_raw_parts(raw_paths, len);
    let mut paths = Vec::with_capacity(len);
    for &path in raw_paths {
        if path.is_null() {
            return Err(NeedleError::NullArgument);
        }
        let path = CStr::from_ptr(path)
            .to_str()
            .map_err(|_| NeedleError::InvalidUtf8String)?;
        paths.push(path.into());
    }

    Ok(paths)
}

/// Finds all valid video files under the given paths.
///
/// On success, `videos` points to an array of `num_videos` C strings. The array must be released
/// with [needle_util_find_video_files_free].
///
/// # Safety
///
/// `paths` must point to `num_paths` valid C strings. `videos` and `num_videos` must be valid
/// for writes.
#[no_mangle]
pub unsafe extern "C" fn needle_util_find_video_files(
    paths: *const *const libc::c_char,
    num_paths: libc::size_t,
    full: bool,
    audio: bool,
    videos: *mut *mut *mut libc::c_char,
    num_videos: *mut libc::size_t,
) -> NeedleError {
    if videos.is_null() || num_videos.is_null() {
        return NeedleError::NullArgument;
    }

    let paths = match get_paths_from_raw(paths, num_paths) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let found = match needle::util::find_video_files(&paths, full, audio) {
        Ok(found) => found,
        Err(e) => return e.into(),
    };

    let mut raw: Vec<*mut libc::c_char> = Vec::with_capacity(found.len());
    for path in found {
        let path = match path.to_str() {
            Some(p) => p,
            None => return free_raw(raw, NeedleError::InvalidUtf8String),
        };
        match CString::new(path) {
            Ok(s) => raw.push(s.into_raw()),
            Err(_) => return free_raw(raw, NeedleError::InvalidArgument),
        }
    }

    // Shrink so that the length is enough to rebuild the allocation in the free function.
    let mut raw = raw.into_boxed_slice();
    *num_videos = raw.len();
    *videos = raw.as_mut_ptr();
    std::mem::forget(raw);

    NeedleError::Ok
}

fn free_raw(raw: Vec<*mut libc::c_char>, err: NeedleError) -> NeedleError {
    for s in raw {
        // SAFETY: every entry came from CString::into_raw.
        drop(unsafe { CString::from_raw(s) });
    }
    err
}

/// Releases a list of videos returned by [needle_util_find_video_files].
///
/// # Safety
///
/// `videos` and `num_videos` must come from a single successful call to
/// [needle_util_find_video_files], and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn needle_util_find_video_files_free(
    videos: *mut *mut libc::c_char,
    num_videos: libc::size_t,
) {
    if videos.is_null() {
        return;
    }
    let raw = Vec::from_raw_parts(videos, num_videos, num_videos);
    free_raw(raw, NeedleError::Ok);
}

/// Audio fingerprint of a single video, borrowed from a [NeedleAudioAnalyzer].
#[repr(transparent)]
pub struct NeedleFrameHashes(audio::AudioFingerprint);

/// Returns the number of hashes in the fingerprint.
///
/// # Safety
///
/// `frame_hashes` must come from [needle_audio_analyzer_get_frame_hashes], and its analyzer must
/// still be alive.
#[no_mangle]
pub unsafe extern "C" fn needle_frame_hashes_len(
    frame_hashes: *const NeedleFrameHashes,
    len: *mut libc::size_t,
) -> NeedleError {
    if frame_hashes.is_null() || len.is_null() {
        return NeedleError::NullArgument;
    }
    *len = (*frame_hashes).0.len();
    NeedleError::Ok
}

/// Returns the hash at `index` and the start of its window, in seconds.
///
/// # Safety
///
/// Same as [needle_frame_hashes_len]. `hash` and `timestamp` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn needle_frame_hashes_get(
    frame_hashes: *const NeedleFrameHashes,
    index: libc::size_t,
    hash: *mut u32,
    timestamp: *mut f32,
) -> NeedleError {
    if frame_hashes.is_null() || hash.is_null() || timestamp.is_null() {
        return NeedleError::NullArgument;
    }
    let frame_hash = match (*frame_hashes).0.hashes().get(index) {
        Some(h) => h,
        None => return NeedleError::InvalidArgument,
    };
    *hash = frame_hash.hash;
    *timestamp = frame_hash.timestamp.as_secs_f32();
    NeedleError::Ok
}

/// Analyzes videos and builds their audio fingerprints.
#[derive(Debug)]
pub struct NeedleAudioAnalyzer {
    inner: audio::Analyzer<PathBuf>,
}

/// Returns a new [NeedleAudioAnalyzer] with default settings.
///
/// # Safety
///
/// `paths` must point to `num_paths` valid C strings and `output` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_analyzer_new_default(
    paths: *const *const libc::c_char,
    num_paths: libc::size_t,
    output: *mut *mut NeedleAudioAnalyzer,
) -> NeedleError {
    needle_audio_analyzer_new(
        paths,
        num_paths,
        audio::DEFAULT_OPENING_SEARCH_PERCENTAGE,
        audio::DEFAULT_ENDING_SEARCH_PERCENTAGE,
        false,
        false,
        false,
        output,
    )
}

/// Returns a new [NeedleAudioAnalyzer].
///
/// The analyzer must be released with [needle_audio_analyzer_free].
///
/// # Safety
///
/// `paths` must point to `num_paths` valid C strings and `output` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_analyzer_new(
    paths: *const *const libc::c_char,
    num_paths: libc::size_t,
    opening_search_percentage: f32,
    ending_search_percentage: f32,
    include_endings: bool,
    threaded_decoding: bool,
    force: bool,
    output: *mut *mut NeedleAudioAnalyzer,
) -> NeedleError {
    if output.is_null() {
        return NeedleError::NullArgument;
    }

    let paths = match get_paths_from_raw(paths, num_paths) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let inner = match audio::Analyzer::new(
        paths,
        opening_search_percentage,
        ending_search_percentage,
        include_endings,
        threaded_decoding,
        force,
    ) {
        Ok(a) => a,
        Err(e) => return e.into(),
    };

    *output = Box::into_raw(Box::new(NeedleAudioAnalyzer { inner }));

    NeedleError::Ok
}

/// Releases a [NeedleAudioAnalyzer]. Any [NeedleFrameHashes] borrowed from it become invalid.
///
/// # Safety
///
/// `analyzer` must come from [needle_audio_analyzer_new] and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_analyzer_free(analyzer: *mut NeedleAudioAnalyzer) {
    if analyzer.is_null() {
        return;
    }
    drop(Box::from_raw(analyzer));
}

/// Prints the analyzer's video paths to stdout.
///
/// # Safety
///
/// `analyzer` must be a live analyzer.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_analyzer_print_paths(
    analyzer: *const NeedleAudioAnalyzer,
) -> NeedleError {
    if analyzer.is_null() {
        return NeedleError::NullArgument;
    }
    for path in (*analyzer).inner.videos() {
        println!("{}", path.display());
    }
    NeedleError::Ok
}

/// Runs the analyzer. On success, fingerprints can be read with
/// [needle_audio_analyzer_get_frame_hashes].
///
/// # Safety
///
/// `analyzer` must be a live analyzer.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_analyzer_run(
    analyzer: *mut NeedleAudioAnalyzer,
    hash_period: f32,
    hash_duration: f32,
    persist: bool,
    threading: bool,
) -> NeedleError {
    if analyzer.is_null() {
        return NeedleError::NullArgument;
    }
    match (*analyzer)
        .inner
        .run(hash_period, hash_duration, persist, threading)
    {
        Ok(_) => NeedleError::Ok,
        Err(e) => e.into(),
    }
}

/// Returns the fingerprint of the video at `index`, in path order.
///
/// The returned pointer is borrowed from the analyzer. It is valid until the analyzer is run
/// again or freed.
///
/// # Safety
///
/// `analyzer` must be a live analyzer and `output` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_analyzer_get_frame_hashes(
    analyzer: *const NeedleAudioAnalyzer,
    index: libc::size_t,
    output: *mut *const NeedleFrameHashes,
) -> NeedleError {
    if analyzer.is_null() || output.is_null() {
        return NeedleError::NullArgument;
    }
    match (*analyzer).inner.get_frame_hashes(index) {
        Ok(frame_hashes) => {
            *output = frame_hashes as *const audio::AudioFingerprint as *const NeedleFrameHashes;
            NeedleError::Ok
        }
        Err(e) => e.into(),
    }
}

/// Compares videos and detects their openings and endings.
#[derive(Debug)]
pub struct NeedleAudioComparator(audio::Comparator<PathBuf>);

/// Returns a new [NeedleAudioComparator] with default settings.
///
/// # Safety
///
/// `paths` must point to `num_paths` valid C strings and `output` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_comparator_new_default(
    paths: *const *const libc::c_char,
    num_paths: libc::size_t,
    output: *mut *mut NeedleAudioComparator,
) -> NeedleError {
    needle_audio_comparator_new(
        paths,
        num_paths,
        false,
        audio::DEFAULT_HASH_MATCH_THRESHOLD,
        audio::DEFAULT_MIN_OPENING_DURATION,
        audio::DEFAULT_MIN_ENDING_DURATION,
        audio::DEFAULT_OPENING_AND_ENDING_TIME_PADDING,
        output,
    )
}

/// Returns a new [NeedleAudioComparator].
///
/// Durations are in seconds. The comparator must be released with
/// [needle_audio_comparator_free].
///
/// # Safety
///
/// `paths` must point to `num_paths` valid C strings and `output` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_comparator_new(
    paths: *const *const libc::c_char,
    num_paths: libc::size_t,
    include_endings: bool,
    hash_match_threshold: u16,
    min_opening_duration: u16,
    min_ending_duration: u16,
    time_padding: f32,
    output: *mut *mut NeedleAudioComparator,
) -> NeedleError {
    if output.is_null() {
        return NeedleError::NullArgument;
    }

    let paths = match get_paths_from_raw(paths, num_paths) {
        Ok(p) => p,
        Err(e) => return e,
    };

    if !time_padding.is_finite() || time_padding < 0.0 {
        return NeedleError::InvalidArgument;
    }

    let comparator = match audio::Comparator::new(
        paths,
        include_endings,
        hash_match_threshold as u32,
        Duration::from_secs(min_opening_duration as u64),
        Duration::from_secs(min_ending_duration as u64),
        Duration::from_secs_f32(time_padding),
    ) {
        Ok(c) => c,
        Err(e) => return e.into(),
    };

    *output = Box::into_raw(Box::new(NeedleAudioComparator(comparator)));

    NeedleError::Ok
}

/// Releases a [NeedleAudioComparator].
///
/// # Safety
///
/// `comparator` must come from [needle_audio_comparator_new] and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_comparator_free(comparator: *mut NeedleAudioComparator) {
    if comparator.is_null() {
        return;
    }
    drop(Box::from_raw(comparator));
}

/// Runs the comparator. See `Comparator::run` for the meaning of each flag.
///
/// # Safety
///
/// `comparator` must be a live comparator.
#[no_mangle]
pub unsafe extern "C" fn needle_audio_comparator_run(
    comparator: *const NeedleAudioComparator,
    analyze: bool,
    display: bool,
    use_skip_files: bool,
    write_skip_files: bool,
    threading: bool,
) -> NeedleError {
    if comparator.is_null() {
        return NeedleError::NullArgument;
    }
    match (*comparator)
        .0
        .run(analyze, display, use_skip_files, write_skip_files, threading)
    {
        Ok(_) => NeedleError::Ok,
        Err(e) => e.into(),
    }
}
