use std::fmt::Debug;
use std::sync::Arc;

use realfft::{RealFftPlanner, RealToComplex};

use crate::Result;

/// Converts a window of mono PCM samples into a single 32-bit perceptual hash.
///
/// Implementations must be pure: the same window always yields the same hash. Windows that
/// sound alike should produce hashes with a small Hamming distance, while unrelated windows
/// should land about 16 bits apart.
pub trait Hasher: Debug + Send + Sync {
    /// Sample rate (Hz) the hasher expects its input to be in.
    fn sample_rate(&self) -> u32;

    /// Smallest number of samples a single hash can summarize.
    fn min_window_len(&self) -> usize;

    /// Hashes a window of mono samples at [Hasher::sample_rate].
    fn hash(&self, window: &[i16]) -> Result<u32>;
}

/// Number of bits that differ between two hashes.
#[inline]
pub fn hamming_distance(a: u32, b: u32) -> u32 {
    u32::count_ones(a ^ b)
}

/// Folds a sequence of 32-bit words into one 32-bit simhash.
///
/// Bit `i` of the result is set if bit `i` is set in more than half of the input words.
pub fn simhash32(data: &[u32]) -> u32 {
    let mut v = [0i32; 32];
    for &word in data {
        for (bit, count) in v.iter_mut().enumerate() {
            if (word >> bit) & 1 == 1 {
                *count += 1;
            } else {
                *count -= 1;
            }
        }
    }

    v.iter()
        .enumerate()
        .fold(0, |acc, (bit, count)| if *count > 0 { acc | (1 << bit) } else { acc })
}

const SAMPLE_RATE: u32 = 11025;
const FRAME_SIZE: usize = 4096;
const FRAME_HOP: usize = FRAME_SIZE / 3;
const NUM_BANDS: usize = 33;
const MIN_FREQ: f32 = 300.0;
const MAX_FREQ: f32 = 3000.0;

/// Pure-Rust perceptual hasher based on spectral band energies.
///
/// The window is split into overlapping Hann-windowed frames. Each frame is reduced to the
/// energies of 33 logarithmically spaced bands, and each pair of consecutive frames produces a
/// 32-bit sub-fingerprint: bit `b` records whether the energy difference between bands `b` and
/// `b + 1` went up or down. All sub-fingerprints of the window are then folded with
/// [simhash32].
pub struct SpectralHasher {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    band_edges: Vec<usize>,
}

impl Debug for SpectralHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralHasher")
            .field("sample_rate", &SAMPLE_RATE)
            .field("frame_size", &FRAME_SIZE)
            .field("frame_hop", &FRAME_HOP)
            .field("num_bands", &NUM_BANDS)
            .finish()
    }
}

impl Default for SpectralHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralHasher {
    /// Builds a new hasher. This plans the FFT, so prefer sharing one instance.
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FRAME_SIZE);

        let window = (0..FRAME_SIZE)
            .map(|n| {
                let x = std::f32::consts::PI * 2.0 * n as f32 / (FRAME_SIZE - 1) as f32;
                0.5 - 0.5 * x.cos()
            })
            .collect();

        let bin_width = SAMPLE_RATE as f32 / FRAME_SIZE as f32;
        let mut band_edges: Vec<usize> = Vec::with_capacity(NUM_BANDS + 1);
        for b in 0..=NUM_BANDS {
            let freq = MIN_FREQ * (MAX_FREQ / MIN_FREQ).powf(b as f32 / NUM_BANDS as f32);
            let mut bin = (freq / bin_width).round() as usize;
            if let Some(prev) = band_edges.last() {
                bin = bin.max(prev + 1);
            }
            band_edges.push(bin);
        }

        Self {
            fft,
            window,
            band_edges,
        }
    }

    fn band_energies(
        &self,
        frame: &[i16],
        input: &mut [f32],
        output: &mut [realfft::num_complex::Complex<f32>],
    ) -> Result<[f32; NUM_BANDS]> {
        for ((x, s), w) in input.iter_mut().zip(frame).zip(&self.window) {
            *x = *s as f32 / i16::MAX as f32 * w;
        }
        self.fft.process(input, output)?;

        let mut energies = [0f32; NUM_BANDS];
        for (b, energy) in energies.iter_mut().enumerate() {
            let (lo, hi) = (self.band_edges[b], self.band_edges[b + 1]);
            *energy = output[lo..hi].iter().map(|c| c.norm_sqr()).sum();
        }
        Ok(energies)
    }
}

impl Hasher for SpectralHasher {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn min_window_len(&self) -> usize {
        // Two frames are needed for one sub-fingerprint.
        FRAME_SIZE + FRAME_HOP
    }

    fn hash(&self, window: &[i16]) -> Result<u32> {
        let mut input = self.fft.make_input_vec();
        let mut output = self.fft.make_output_vec();

        let mut sub_fingerprints = Vec::new();
        let mut prev: Option<[f32; NUM_BANDS]> = None;
        let mut start = 0;
        while start + FRAME_SIZE <= window.len() {
            let energies =
                self.band_energies(&window[start..start + FRAME_SIZE], &mut input, &mut output)?;
            if let Some(prev) = prev {
                let mut word = 0u32;
                for b in 0..NUM_BANDS - 1 {
                    let delta = (energies[b] - energies[b + 1]) - (prev[b] - prev[b + 1]);
                    if delta > 0.0 {
                        word |= 1 << b;
                    }
                }
                sub_fingerprints.push(word);
            }
            prev = Some(energies);
            start += FRAME_HOP;
        }

        Ok(simhash32(&sub_fingerprints))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::test_util::noise;

    #[test]
    fn test_simhash32() {
        assert_eq!(simhash32(&[]), 0);
        assert_eq!(simhash32(&[0xDEADBEEF]), 0xDEADBEEF);
        assert_eq!(simhash32(&[0b1011, 0b0011, 0b1000]), 0b1011);
        // Ties resolve to zero.
        assert_eq!(simhash32(&[0b01, 0b10]), 0);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0, u32::MAX), 32);
        assert_eq!(hamming_distance(0b1010, 0b0110), 2);
    }

    #[test]
    fn test_spectral_hasher_deterministic() {
        let hasher = SpectralHasher::new();
        let window = noise(7, 3 * SAMPLE_RATE as usize);
        let h1 = hasher.hash(&window).unwrap();
        let h2 = hasher.hash(&window).unwrap();
        let h3 = SpectralHasher::new().hash(&window).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1, h3);
    }

    #[test]
    fn test_spectral_hasher_silence() {
        let hasher = SpectralHasher::new();
        let window = vec![0i16; hasher.min_window_len()];
        assert_eq!(hasher.hash(&window).unwrap(), 0);
    }

    #[test]
    fn test_spectral_hasher_separation() {
        let hasher = SpectralHasher::new();
        let len = 2 * SAMPLE_RATE as usize;

        let mut similar = 0;
        let mut unrelated = 0;
        let rounds = 8;
        for seed in 0..rounds {
            let original = noise(100 + seed, len);
            // Same content with a bit of low-level noise on top, as a re-encode would add.
            let hiss = noise(200 + seed, len);
            let reencoded: Vec<i16> = original
                .iter()
                .zip(&hiss)
                .map(|(s, n)| s.saturating_add(n / 100))
                .collect();
            let other = noise(300 + seed, len);

            let h = hasher.hash(&original).unwrap();
            similar += hamming_distance(h, hasher.hash(&reencoded).unwrap());
            unrelated += hamming_distance(h, hasher.hash(&other).unwrap());
        }

        let (similar, unrelated) = (similar / rounds as u32, unrelated / rounds as u32);
        assert!(similar < unrelated, "{} >= {}", similar, unrelated);
        assert!(similar <= 6, "similar audio too far apart: {}", similar);
        assert!((10..=22).contains(&unrelated), "unrelated: {}", unrelated);
    }
}
