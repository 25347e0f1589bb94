//! Helpers shared by the audio tests: deterministic noise and an in-memory [Decoder].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::decoder::{Decoder, Pcm};
use super::hasher::{Hasher, SpectralHasher};
use super::{AudioFingerprint, FrameHash};
use crate::{Error, Result};

pub(crate) const SAMPLE_RATE: u32 = 11025;

/// Deterministic white noise (xorshift32), roughly a quarter of full scale.
pub(crate) fn noise(seed: u32, len: usize) -> Vec<i16> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(0x9E3779B9) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            ((state >> 16) as u16 as i16) / 4
        })
        .collect()
}

pub(crate) fn seconds(secs: f32) -> usize {
    (secs * SAMPLE_RATE as f32).round() as usize
}

/// Decoder that serves pre-built tracks keyed by path.
#[derive(Debug, Default)]
pub(crate) struct MemoryDecoder {
    tracks: BTreeMap<PathBuf, Vec<i16>>,
    decodes: AtomicUsize,
}

impl MemoryDecoder {
    pub(crate) fn insert(&mut self, path: impl Into<PathBuf>, samples: Vec<i16>) {
        self.tracks.insert(path.into(), samples);
    }

    /// Number of times [Decoder::decode] was called.
    pub(crate) fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    fn track(&self, path: &Path) -> Result<&Vec<i16>> {
        self.tracks
            .get(path)
            .ok_or_else(|| Error::NoAudioStream(path.to_owned()))
    }
}

impl Decoder for MemoryDecoder {
    fn duration(&self, path: &Path) -> Result<Duration> {
        let track = self.track(path)?;
        Ok(Duration::from_secs_f64(
            track.len() as f64 / SAMPLE_RATE as f64,
        ))
    }

    fn decode(&self, path: &Path, sample_rate: u32, until: Option<Duration>) -> Result<Pcm> {
        assert_eq!(sample_rate, SAMPLE_RATE, "test tracks are not resampled");
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let track = self.track(path)?;
        let len = match until {
            Some(until) => track
                .len()
                .min((until.as_secs_f64() * sample_rate as f64).ceil() as usize),
            None => track.len(),
        };
        Ok(Pcm {
            sample_rate,
            samples: track[..len].to_vec(),
        })
    }
}

/// Builds a set of "episodes" that share the same intro at different offsets.
///
/// Each episode is written to `dir` as a small stand-in file (so header checksums work) and
/// registered with the returned decoder.
pub(crate) fn episodes(
    dir: &Path,
    intro_offsets: &[f32],
    intro_len: f32,
    total_len: f32,
) -> (Vec<PathBuf>, Arc<MemoryDecoder>) {
    let intro = noise(999, seconds(intro_len));
    let mut decoder = MemoryDecoder::default();
    let mut paths = Vec::new();

    for (i, offset) in intro_offsets.iter().enumerate() {
        let path = dir.join(format!("episode-{}.mkv", i + 1));
        std::fs::write(&path, format!("fake video {}", i)).unwrap();

        let seed = i as u32 * 10;
        let mut samples = noise(seed + 1, seconds(*offset));
        samples.extend_from_slice(&intro);
        let rest = seconds(total_len).saturating_sub(samples.len());
        samples.extend(noise(seed + 2, rest));

        decoder.insert(&path, samples);
        paths.push(path);
    }

    (paths, Arc::new(decoder))
}

/// Builds a fingerprint directly from a list of hashes, `period` seconds apart.
pub(crate) fn fingerprint(hashes: &[u32], period: f32) -> AudioFingerprint {
    let period = Duration::from_secs_f32(period);
    let hashes: Vec<FrameHash> = hashes
        .iter()
        .enumerate()
        .map(|(i, hash)| FrameHash {
            timestamp: period * i as u32,
            hash: *hash,
        })
        .collect();
    let duration = period * hashes.len() as u32;
    AudioFingerprint::new(
        hashes,
        SpectralHasher::new().sample_rate(),
        period,
        period * 2,
        duration,
        true,
        "0123456789abcdef".to_string(),
    )
}

/// Pseudo-random hashes that share no long runs with each other.
pub(crate) fn random_hashes(seed: u32, len: usize) -> Vec<u32> {
    let mut state = seed.wrapping_mul(747796405).wrapping_add(2891336453) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        })
        .collect()
}
