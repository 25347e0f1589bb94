extern crate chromaprint_rust;

use chromaprint_rust as chromaprint;

use super::hasher::Hasher;
use crate::{Error, Result};

// Chromaprint's internal working rate. Feeding audio at this rate skips its resampler.
const SAMPLE_RATE: u32 = 11025;

// Chromaprint needs a few seconds of audio before it produces a stable fingerprint.
const MIN_WINDOW_SECS: usize = 3;

fn chromaprint_error(e: impl std::fmt::Debug) -> Error {
    Error::ChromaprintError(format!("{:?}", e))
}

/// [Hasher] backed by Chromaprint.
///
/// Each window gets its own raw Chromaprint fingerprint, which is then folded into a single
/// `u32` with a simhash.
#[derive(Debug, Default)]
pub struct ChromaprintHasher;

impl ChromaprintHasher {
    /// Constructs a new [ChromaprintHasher].
    pub fn new() -> Self {
        Self
    }
}

impl Hasher for ChromaprintHasher {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn min_window_len(&self) -> usize {
        SAMPLE_RATE as usize * MIN_WINDOW_SECS
    }

    fn hash(&self, window: &[i16]) -> Result<u32> {
        let mut ctx = chromaprint::Context::default();
        ctx.start(SAMPLE_RATE, 1).map_err(chromaprint_error)?;
        ctx.feed(window).map_err(chromaprint_error)?;
        ctx.finish().map_err(chromaprint_error)?;
        let fingerprint = ctx.get_fingerprint_raw().map_err(chromaprint_error)?;
        Ok(chromaprint::simhash::simhash32(fingerprint.get()))
    }
}
