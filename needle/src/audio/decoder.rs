use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Decoded mono PCM audio.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pcm {
    /// Sample rate of `samples`, in Hz.
    pub sample_rate: u32,
    /// Mono signed 16-bit samples.
    pub samples: Vec<i16>,
}

impl Pcm {
    /// Duration covered by the samples.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Source of PCM audio for a video file.
///
/// The [Analyzer](super::Analyzer) only needs two things from a video: the duration of its audio
/// track, and the track itself as mono samples at the hasher's sample rate.
pub trait Decoder: Debug + Send + Sync {
    /// Returns the duration of the best audio stream in the video.
    fn duration(&self, path: &Path) -> Result<Duration>;

    /// Decodes the best audio stream in the video into mono PCM at `sample_rate`.
    ///
    /// If `until` is set, decoding may stop once that timestamp has been reached.
    fn decode(&self, path: &Path, sample_rate: u32, until: Option<Duration>) -> Result<Pcm>;
}

/// Decoder used when none was configured and FFmpeg support is not compiled in.
#[cfg_attr(feature = "ffmpeg", allow(dead_code))]
#[derive(Debug, Default)]
struct UnavailableDecoder;

impl Decoder for UnavailableDecoder {
    fn duration(&self, _path: &Path) -> Result<Duration> {
        Err(Error::DecoderUnavailable)
    }

    fn decode(&self, _path: &Path, _sample_rate: u32, _until: Option<Duration>) -> Result<Pcm> {
        Err(Error::DecoderUnavailable)
    }
}

/// Returns the decoder used when an [Analyzer](super::Analyzer) is not given one.
///
/// With the `ffmpeg` feature, this is a [FfmpegDecoder]. Otherwise every call fails with
/// [Error::DecoderUnavailable].
pub fn default_decoder(threaded_decoding: bool) -> Arc<dyn Decoder> {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(FfmpegDecoder::new(threaded_decoding))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        let _ = threaded_decoding;
        Arc::new(UnavailableDecoder)
    }
}

#[cfg(feature = "ffmpeg")]
pub(crate) fn ensure_ffmpeg_init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if let Err(e) = ffmpeg_next::init() {
            tracing::warn!("failed to initialize FFmpeg: {}", e);
        }
    });
}

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegDecoder;

#[cfg(feature = "ffmpeg")]
mod ffmpeg {
    use std::path::Path;
    use std::time::Duration;

    use super::{Decoder, Pcm};
    use crate::{Error, Result};

    // Format-level durations are expressed in AV_TIME_BASE units (microseconds).
    const AV_TIME_BASE: f64 = 1_000_000.0;

    // Converts a timestamp in time base units into a [std::time::Duration].
    fn to_timestamp(time_base: ffmpeg_next::util::rational::Rational, raw_timestamp: i64) -> Duration {
        let time_base: f64 = time_base.into();
        let ts = raw_timestamp as f64 * time_base;
        Duration::from_secs_f64(ts.max(0.0))
    }

    fn find_best_audio_stream(
        path: &Path,
        input: &ffmpeg_next::format::context::Input,
    ) -> Result<usize> {
        input
            .streams()
            .best(ffmpeg_next::media::Type::Audio)
            .map(|s| s.index())
            .ok_or_else(|| Error::NoAudioStream(path.to_owned()))
    }

    // Try to get the duration from the stream info. If it is invalid, get it
    // from the format context.
    //
    // As an example, Matroska does not store the duration in the stream; it
    // only stores it in the format context.
    fn stream_duration(
        ctx: &ffmpeg_next::format::context::Input,
        stream_idx: usize,
    ) -> Option<Duration> {
        let stream = ctx.stream(stream_idx)?;
        if stream.duration() > 0 {
            return Some(to_timestamp(stream.time_base(), stream.duration()));
        }
        if ctx.duration() > 0 {
            return Some(Duration::from_secs_f64(ctx.duration() as f64 / AV_TIME_BASE));
        }
        None
    }

    /// Decodes audio with `FFmpeg` and resamples it to mono S16.
    ///
    /// If `threaded` is set, the codec is allowed to use frame threading across all CPUs.
    #[derive(Debug, Default)]
    pub struct FfmpegDecoder {
        threaded: bool,
    }

    impl FfmpegDecoder {
        /// Constructs a new [FfmpegDecoder].
        pub fn new(threaded: bool) -> Self {
            super::ensure_ffmpeg_init();
            Self { threaded }
        }

        fn build_threading_config() -> ffmpeg_next::codec::threading::Config {
            let mut config = ffmpeg_next::codec::threading::Config::default();
            config.count = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            config.kind = ffmpeg_next::codec::threading::Type::Frame;
            config
        }

        fn open_decoder(
            &self,
            stream: ffmpeg_next::format::stream::Stream,
        ) -> Result<ffmpeg_next::codec::decoder::Audio> {
            let ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
            let mut decoder = ctx.decoder();
            if self.threaded {
                decoder.set_threading(Self::build_threading_config());
            }
            Ok(decoder.audio()?)
        }
    }

    // Appends the samples held by a resampled (packed, mono, S16) frame.
    fn extend_samples(samples: &mut Vec<i16>, frame: &ffmpeg_next::frame::Audio) {
        let num_bytes = frame.samples() * frame.channels() as usize * 2;
        let raw = &frame.data(0)[..num_bytes];
        samples.extend(
            raw.chunks_exact(2)
                .map(|b| i16::from_ne_bytes([b[0], b[1]])),
        );
    }

    impl Decoder for FfmpegDecoder {
        fn duration(&self, path: &Path) -> Result<Duration> {
            let ctx = ffmpeg_next::format::input(&path)?;
            let stream_idx = find_best_audio_stream(path, &ctx)?;
            stream_duration(&ctx, stream_idx).ok_or_else(|| Error::NoAudioStream(path.to_owned()))
        }

        fn decode(&self, path: &Path, sample_rate: u32, until: Option<Duration>) -> Result<Pcm> {
            let span = tracing::span!(tracing::Level::TRACE, "decode");
            let _enter = span.enter();

            let mut ctx = ffmpeg_next::format::input(&path)?;
            let stream_idx = find_best_audio_stream(path, &ctx)?;
            let (time_base, mut decoder) = {
                let stream = ctx
                    .stream(stream_idx)
                    .ok_or_else(|| Error::NoAudioStream(path.to_owned()))?;
                (stream.time_base(), self.open_decoder(stream)?)
            };

            let target_format =
                ffmpeg_next::format::Sample::I16(ffmpeg_next::format::sample::Type::Packed);
            let mut resampler = decoder.resampler(
                target_format,
                ffmpeg_next::ChannelLayout::MONO,
                sample_rate,
            )?;

            // Compute the end timestamp in time base units. This allows for quick
            // comparison with the PTS.
            let end_timestamp =
                until.map(|d| (d.as_secs_f64() / f64::from(time_base)) as i64);

            let mut samples = Vec::new();
            let mut frame = ffmpeg_next::frame::Audio::empty();
            let mut frame_resampled = ffmpeg_next::frame::Audio::empty();

            let mut drain = |decoder: &mut ffmpeg_next::codec::decoder::Audio,
                             resampler: &mut ffmpeg_next::software::resampling::Context,
                             samples: &mut Vec<i16>|
             -> Result<()> {
                while decoder.receive_frame(&mut frame).is_ok() {
                    // Resample the frame to S16 mono and return the frame delay.
                    let mut delay = match resampler.run(&frame, &mut frame_resampled) {
                        Ok(v) => v,
                        // If resampling fails due to changed input, construct a new local resampler for this frame
                        // and swap out the existing one.
                        Err(ffmpeg_next::Error::InputChanged) => {
                            let mut local_resampler = frame.resampler(
                                target_format,
                                ffmpeg_next::ChannelLayout::MONO,
                                sample_rate,
                            )?;
                            let delay = local_resampler.run(&frame, &mut frame_resampled)?;
                            *resampler = local_resampler;
                            delay
                        }
                        Err(e) => return Err(e.into()),
                    };

                    loop {
                        extend_samples(samples, &frame_resampled);
                        if delay.is_none() {
                            break;
                        }
                        delay = resampler.flush(&mut frame_resampled)?;
                    }
                }
                Ok(())
            };

            for (stream, packet) in ctx.packets() {
                if stream.index() != stream_idx {
                    continue;
                }
                match (packet.pts(), end_timestamp) {
                    // Skip packets with an invalid PTS. This can happen if, e.g., the
                    // video was trimmed.
                    // See: https://stackoverflow.com/a/41032346/845275
                    (Some(pts), _) if pts < 0 => continue,
                    (Some(pts), Some(end)) if pts >= end => break,
                    _ => (),
                }

                decoder.send_packet(&packet)?;
                drain(&mut decoder, &mut resampler, &mut samples)?;
            }

            decoder.send_eof()?;
            drain(&mut decoder, &mut resampler, &mut samples)?;

            tracing::trace!(
                num_samples = samples.len(),
                "decoded audio for {}",
                path.display()
            );

            Ok(Pcm {
                sample_rate,
                samples,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pcm_duration() {
        let pcm = Pcm {
            sample_rate: 11025,
            samples: vec![0; 22050],
        };
        assert_eq!(pcm.duration(), Duration::from_secs(2));
        assert_eq!(Pcm::default().duration(), Duration::ZERO);
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_default_decoder_unavailable() {
        let decoder = default_decoder(false);
        let path = Path::new("ep1.mkv");
        assert!(matches!(decoder.duration(path), Err(Error::DecoderUnavailable)));
        assert!(matches!(
            decoder.decode(path, 11025, None),
            Err(Error::DecoderUnavailable)
        ));
    }

    // Writes interleaved 16-bit PCM as a minimal WAV file.
    #[cfg(feature = "ffmpeg")]
    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let data_len = (samples.len() * 2) as u32;
        let mut buf = Vec::with_capacity(44 + data_len as usize);
        buf.extend_from_slice(b"RIFF");
        buf.extend_from_slice(&(36 + data_len).to_le_bytes());
        buf.extend_from_slice(b"WAVEfmt ");
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&channels.to_le_bytes());
        buf.extend_from_slice(&sample_rate.to_le_bytes());
        buf.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        buf.extend_from_slice(&(channels * 2).to_le_bytes());
        buf.extend_from_slice(&16u16.to_le_bytes());
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        std::fs::write(path, buf).unwrap();
    }

    #[cfg(feature = "ffmpeg")]
    #[test]
    fn test_ffmpeg_decoder() {
        use crate::audio::test_util::noise;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        // 2 seconds of stereo audio at 22.05 kHz, so both the rate and the layout change.
        write_wav(&path, 22050, 2, &noise(3, 22050 * 2 * 2));

        let decoder = FfmpegDecoder::new(false);
        let duration = decoder.duration(&path).unwrap();
        assert!((duration.as_secs_f32() - 2.0).abs() < 0.05, "{:?}", duration);

        let full = decoder.decode(&path, 11025, None).unwrap();
        assert_eq!(full.sample_rate, 11025);
        let expected = 22050;
        assert!(
            (full.samples.len() as i64 - expected).abs() < expected / 50,
            "{}",
            full.samples.len()
        );

        // Decoding stops at the first packet past `until`.
        let partial = decoder
            .decode(&path, 11025, Some(Duration::from_millis(500)))
            .unwrap();
        let min = 11025 / 2 * 98 / 100;
        assert!(partial.samples.len() >= min, "{}", partial.samples.len());
        assert!(partial.samples.len() < full.samples.len() * 3 / 4);
    }
}
