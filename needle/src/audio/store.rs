use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// Returns where the cache entry with extension `ext` lives for `video`.
///
/// Without a cache directory, entries sit alongside the video (`ep1.mkv` -> `ep1.mkv.<ext>`).
/// With one, entries are named after the MD5 of the video path so that different
/// directories never collide.
pub(crate) fn entry_path(cache_dir: Option<&Path>, video: &Path, ext: &str) -> PathBuf {
    match cache_dir {
        None => {
            let mut name = video.file_name().unwrap_or_default().to_os_string();
            name.push(".");
            name.push(ext);
            video.with_file_name(name)
        }
        Some(dir) => {
            let key = format!("{:x}", md5::compute(video.to_string_lossy().as_bytes()));
            dir.join(key).with_extension(ext)
        }
    }
}

/// Writes a cache entry atomically.
///
/// The data goes to a temporary file in the destination directory which is then renamed over
/// `path`. Readers see either the previous entry or the new one, never a partial write.
pub(crate) fn write_atomic(
    path: &Path,
    write: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        write(&mut w)?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Removes a cache entry. Returns false if there was nothing to remove.
pub(crate) fn remove_entry(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
