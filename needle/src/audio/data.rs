use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::store;
use crate::{Error, Result};

/// Version tag written in front of every fingerprint cache entry.
///
/// IMPORTANT: Changing the serialized layout of [AudioFingerprint] requires a new tag.
pub const FINGERPRINT_VERSION_V1: u32 = 12345;

/// A single perceptual hash and the time at which its window starts.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrameHash {
    /// Start of the hashed window.
    pub timestamp: Duration,
    /// 32-bit perceptual hash of the window.
    pub hash: u32,
}

/// Represents the audio fingerprint of a single video file. This is the result of running
/// an [Analyzer](super::Analyzer) on a video file.
///
/// The struct contains the raw hashes as well as metadata about how they were generated, so
/// that a cached fingerprint computed with different settings is never reused by mistake.
/// Fingerprints are immutable once built.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AudioFingerprint {
    sample_rate: u32,
    hash_period: Duration,
    hash_duration: Duration,
    duration: Duration,
    complete: bool,
    md5: String,
    hashes: Vec<FrameHash>,
}

impl AudioFingerprint {
    pub(crate) fn new(
        hashes: Vec<FrameHash>,
        sample_rate: u32,
        hash_period: Duration,
        hash_duration: Duration,
        duration: Duration,
        complete: bool,
        md5: String,
    ) -> Self {
        Self {
            sample_rate,
            hash_period,
            hash_duration,
            duration,
            complete,
            md5,
            hashes,
        }
    }

    /// Returns the frame hashes, ordered by timestamp.
    pub fn hashes(&self) -> &[FrameHash] {
        &self.hashes
    }

    /// Number of frame hashes.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns true if no audio was hashed.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Sample rate the audio was hashed at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Time between two consecutive hashes.
    pub fn hash_period(&self) -> Duration {
        self.hash_period
    }

    /// Amount of audio summarized by each hash.
    pub fn hash_duration(&self) -> Duration {
        self.hash_duration
    }

    /// Duration of the whole audio stream, even if only part of it was hashed.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Returns true if the entire stream was hashed, false if only the opening search window was.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// MD5 sum of the video header this fingerprint was computed from.
    pub fn md5(&self) -> &str {
        &self.md5
    }

    /// Checks the structural invariants: a positive hash period, and timestamps that strictly
    /// increase by one hash period (within tolerance) and stay within the stream.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.hash_period.is_zero() {
            return Err("hash period is zero".to_string());
        }

        let period = self.hash_period.as_secs_f64();
        let tolerance = period * super::HASH_PERIOD_TOLERANCE;
        for pair in self.hashes.windows(2) {
            let (prev, next) = (pair[0].timestamp, pair[1].timestamp);
            if next <= prev {
                return Err(format!("timestamps not increasing at {:?}", next));
            }
            let delta = (next - prev).as_secs_f64();
            if (delta - period).abs() > tolerance {
                return Err(format!(
                    "timestamps {:?} and {:?} are not one hash period apart",
                    prev, next
                ));
            }
        }

        match self.hashes.last() {
            Some(last) if last.timestamp > self.duration => Err(format!(
                "timestamp {:?} is past the stream duration {:?}",
                last.timestamp, self.duration
            )),
            _ => Ok(()),
        }
    }
}

/// Reads and writes [AudioFingerprint]s to disk.
///
/// Each entry starts with a bincode-encoded `u32` version tag followed by the payload for that
/// version. The tag is checked before the payload is touched; unknown tags are rejected.
///
/// By default, entries are stored alongside each video (`<video file name>.needle.bin`). Use
/// [FingerprintStore::with_cache_dir] to keep them in a dedicated directory instead.
#[derive(Clone, Debug, Default)]
pub struct FingerprintStore {
    cache_dir: Option<PathBuf>,
}

impl FingerprintStore {
    /// Returns a store that keeps entries alongside each video.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new [FingerprintStore] that keeps entries in `cache_dir`.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Returns the path of the entry for the given video.
    pub fn path_for(&self, video: impl AsRef<Path>) -> PathBuf {
        store::entry_path(
            self.cache_dir.as_deref(),
            video.as_ref(),
            super::FRAME_HASH_DATA_FILE_EXT,
        )
    }

    /// Loads the fingerprint of the given video.
    pub fn load(&self, video: impl AsRef<Path>) -> Result<AudioFingerprint> {
        let path = self.path_for(video);
        let f = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FrameHashDataNotFound(path))
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(f);

        let invalid = |reason: String| Error::InvalidFrameHashData {
            path: path.clone(),
            reason,
        };

        let version: u32 =
            bincode::deserialize_from(&mut reader).map_err(|e| invalid(e.to_string()))?;
        let fingerprint: AudioFingerprint = match version {
            FINGERPRINT_VERSION_V1 => {
                bincode::deserialize_from(&mut reader).map_err(|e| invalid(e.to_string()))?
            }
            version => {
                return Err(Error::FrameHashDataInvalidVersion {
                    path: path.clone(),
                    version,
                })
            }
        };
        fingerprint.validate().map_err(invalid)?;

        Ok(fingerprint)
    }

    /// Saves the fingerprint of the given video, replacing any previous entry atomically.
    pub fn save(&self, video: impl AsRef<Path>, fingerprint: &AudioFingerprint) -> Result<()> {
        let path = self.path_for(video);
        store::write_atomic(&path, |w| {
            bincode::serialize_into(&mut *w, &FINGERPRINT_VERSION_V1)?;
            bincode::serialize_into(&mut *w, fingerprint)?;
            Ok(())
        })?;
        tracing::debug!(num_hashes = fingerprint.len(), "wrote {}", path.display());
        Ok(())
    }

    /// Removes the entry for the given video. Returns false if there was none.
    pub fn remove(&self, video: impl AsRef<Path>) -> Result<bool> {
        store::remove_entry(&self.path_for(video))
    }
}
