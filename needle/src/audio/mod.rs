mod aligner;
mod analyzer;
#[cfg(feature = "chromaprint")]
mod chromaprint;
mod comparator;
mod data;
pub(crate) mod decoder;
mod hasher;
mod skip;
mod store;
#[cfg(test)]
pub(crate) mod test_util;

pub use aligner::{Aligner, Match, MatchWindow, SearchConfig, SegmentKind, SkipRange};
pub use analyzer::Analyzer;
#[cfg(feature = "chromaprint")]
pub use chromaprint::ChromaprintHasher;
pub use comparator::{Comparator, SearchResult};
pub use data::{AudioFingerprint, FingerprintStore, FrameHash, FINGERPRINT_VERSION_V1};
#[cfg(feature = "ffmpeg")]
pub use decoder::FfmpegDecoder;
pub use decoder::{default_decoder, Decoder, Pcm};
pub use hasher::{hamming_distance, simhash32, Hasher, SpectralHasher};
pub use skip::{SkipEntry, SkipStore, SKIP_DATA_VERSION};

/// Default hash match threshold.
///
/// This is used to determine if two frame hashes match. The Hamming distance between two frame
/// hashes ranges from 0 (exact match) to 32 (no bit in common).
pub const DEFAULT_HASH_MATCH_THRESHOLD: u16 = 15;

/// Default opening search percentage.
///
/// If a match is found in the first percentage of the video, it is considered as an opening.
pub const DEFAULT_OPENING_SEARCH_PERCENTAGE: f32 = 0.33;

/// Default ending search percentage.
///
/// If a match is found in the last percentage of the video, it is considered as an ending.
pub const DEFAULT_ENDING_SEARCH_PERCENTAGE: f32 = 0.25;

/// Default minimum opening duration (seconds).
///
/// A match will only be considered as an opening if it runs for at least this long.
pub const DEFAULT_MIN_OPENING_DURATION: u16 = 20; // seconds

/// Default minimum ending duration (seconds).
///
/// A match will only be considered as an ending if it runs for at least this long.
pub const DEFAULT_MIN_ENDING_DURATION: u16 = 20; // seconds

/// Default hash period (seconds).
///
/// This is the time (in seconds) between successive frame hashes.
pub const DEFAULT_HASH_PERIOD: f32 = 0.3;

/// Default hash duration (seconds).
///
/// This is the duration of audio used to generate each frame hash.
pub const DEFAULT_HASH_DURATION: f32 = 3.0;

/// Default opening and ending time padding (seconds).
///
/// Detected ranges are widened by this amount on both sides, clamped to the video.
pub const DEFAULT_OPENING_AND_ENDING_TIME_PADDING: f32 = 0.0; // seconds

/// Maximum drift between two consecutive hash timestamps, as a fraction of the hash period.
const HASH_PERIOD_TOLERANCE: f64 = 0.1;

static FRAME_HASH_DATA_FILE_EXT: &str = "needle.bin";
static SKIP_FILE_EXT: &str = "needle.skip.json";
