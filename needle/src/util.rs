use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Number of header bytes used for MD5 checks and file type sniffing.
const HEADER_SIZE: u64 = 8192;

/// Formats the given [Duration] as "MM:SSs"
pub fn format_time(t: Duration) -> String {
    let minutes = t.as_secs() / 60;
    let seconds = t.as_secs() % 60;
    format!("{:02}:{:02}s", minutes, seconds)
}

fn read_header(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let f = std::fs::File::open(path.as_ref())?;
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
    f.take(HEADER_SIZE).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Checks if the given path points to a valid video file.
///
/// If `full` is set to **false**, only the file header will be checked. This is a very cheap
/// operation, but it does not guarantee validity. If set to **true** and the `ffmpeg` feature is
/// enabled, FFmpeg will be used to check the video contents - note that this is more expensive,
/// but much more accurate.
///
/// If `audio` is set to true, this function will ensure that the video contains *at least* one audio stream.
/// This flag is only used for full checks.
pub fn is_valid_video_file(path: impl AsRef<Path>, full: bool, audio: bool) -> bool {
    if full {
        if let Some(valid) = probe_video_file(path.as_ref(), audio) {
            return valid;
        }
    }

    match read_header(path) {
        Ok(buf) => infer::is_video(&buf),
        Err(_) => false,
    }
}

#[cfg(feature = "ffmpeg")]
fn probe_video_file(path: &Path, audio: bool) -> Option<bool> {
    crate::audio::decoder::ensure_ffmpeg_init();
    let valid = match ffmpeg_next::format::input(&path) {
        Ok(input) => {
            let num_video_streams = input
                .streams()
                .filter(|s| s.parameters().medium() == ffmpeg_next::util::media::Type::Video)
                .count();
            let num_audio_streams = input
                .streams()
                .filter(|s| s.parameters().medium() == ffmpeg_next::util::media::Type::Audio)
                .count();
            num_video_streams > 0 && (!audio || num_audio_streams > 0)
        }
        Err(_) => false,
    };
    Some(valid)
}

// Without FFmpeg we can only look at headers.
#[cfg(not(feature = "ffmpeg"))]
fn probe_video_file(_path: &Path, _audio: bool) -> Option<bool> {
    None
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_dir() {
        let mut entries = std::fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        for entry in entries {
            collect_files(&entry, out)?;
        }
    } else {
        out.push(path.to_owned());
    }
    Ok(())
}

/// Given a list of paths (files or directories), returns the sorted list of valid video files.
///
/// Directories are walked recursively. See [is_valid_video_file] for the meaning of `full` and `audio`.
pub fn find_video_files(
    paths: &[impl AsRef<Path>],
    full: bool,
    audio: bool,
) -> Result<Vec<PathBuf>> {
    let mut candidates = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::PathNotFound(path.to_owned()));
        }
        collect_files(path, &mut candidates)?;
    }

    let mut videos: Vec<PathBuf> = candidates
        .into_iter()
        .filter(|p| is_valid_video_file(p, full, audio))
        .collect();
    videos.sort();
    videos.dedup();

    tracing::debug!(num_videos = videos.len(), "found video files");

    Ok(videos)
}

/// Computes the MD5 sum of the first few KiB of the given file.
///
/// This is cheap and good enough to notice that a cache entry belongs to a different file.
pub(crate) fn compute_header_md5sum(video: impl AsRef<Path>) -> Result<String> {
    let buf = read_header(video)?;
    let hash = format!("{:x}", md5::compute(&buf));
    Ok(hash)
}

/// Returns the underlying FFmpeg version integer used by needle.
#[cfg(feature = "ffmpeg")]
pub fn ffmpeg_version() -> u32 {
    ffmpeg_next::util::version()
}

/// Returns the underlying FFmpeg version string used by needle.
#[cfg(feature = "ffmpeg")]
pub fn ffmpeg_version_string() -> String {
    let version_int = ffmpeg_version();

    // Reference: https://github.com/FFmpeg/FFmpeg/blob/130d19bf2044ac76372d1b97ab87ab283c8b37f8/libavutil/version.h#L64
    format!(
        "{}.{}.{}",
        version_int >> 16,             // MAJOR
        (version_int & 0x00FF00) >> 8, // MINOR
        version_int & 0xFF             // MICRO
    )
}

#[cfg(test)]
mod test {
    use super::*;

    // Minimal ISO BMFF header; enough for `infer` to call it a video.
    const MP4_HEADER: &[u8] = &[
        0x00, 0x00, 0x00, 0x18, b'f', b't', b'y', b'p', b'm', b'p', b'4', b'2', 0x00, 0x00, 0x00,
        0x00, b'm', b'p', b'4', b'2', b'i', b's', b'o', b'm',
    ];

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(Duration::from_secs(0)), "00:00s");
        assert_eq!(format_time(Duration::from_secs_f32(61.9)), "01:01s");
        assert_eq!(format_time(Duration::from_secs(3725)), "62:05s");
    }

    #[test]
    fn test_header_md5sum_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mkv");
        let b = dir.path().join("b.mkv");
        std::fs::write(&a, b"short").unwrap();
        std::fs::write(&b, b"other").unwrap();

        let md5_a = compute_header_md5sum(&a).unwrap();
        assert_eq!(md5_a, compute_header_md5sum(&a).unwrap());
        assert_ne!(md5_a, compute_header_md5sum(&b).unwrap());
    }

    #[test]
    fn test_find_video_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("season1");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("ep2.mp4"), MP4_HEADER).unwrap();
        std::fs::write(dir.path().join("ep1.mp4"), MP4_HEADER).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not a video").unwrap();

        let videos = find_video_files(&[dir.path()], false, true).unwrap();
        assert_eq!(
            videos,
            vec![dir.path().join("ep1.mp4"), nested.join("ep2.mp4")]
        );
    }

    #[test]
    fn test_find_video_files_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = find_video_files(&[&missing], false, false).unwrap_err();
        assert!(matches!(err, Error::PathNotFound(p) if p == missing));
    }
}
