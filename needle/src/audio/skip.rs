use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::aligner::{SegmentKind, SkipRange};
use super::comparator::SearchResult;
use super::store;
use crate::{Error, Result};

/// Version of the skip file format written by this build.
pub const SKIP_DATA_VERSION: u32 = 1;

// Read first so that the payload is only parsed once the version is known.
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

#[derive(Deserialize, Serialize)]
struct SkipFileV1 {
    version: u32,
    md5: String,
    #[serde(default)]
    include_endings: bool,
    opening: Option<(f64, f64)>,
    ending: Option<(f64, f64)>,
}

/// A skip file loaded from disk.
#[derive(Clone, Debug, PartialEq)]
pub struct SkipEntry {
    /// MD5 sum of the video header at the time the entry was written.
    pub md5: String,
    /// Whether the search that produced the entry looked for endings.
    pub include_endings: bool,
    /// The stored result.
    pub result: SearchResult,
}

/// Reads and writes skip files: small JSON documents with the search result for one video.
///
/// Players can read these directly, so times are stored in seconds:
///
/// ```json
/// {"version":1,"md5":"...","include_endings":false,"opening":[12.5,102.0],"ending":null}
/// ```
#[derive(Clone, Debug, Default)]
pub struct SkipStore {
    cache_dir: Option<PathBuf>,
}

fn to_range(kind: SegmentKind, (start, end): (f64, f64)) -> std::result::Result<SkipRange, String> {
    if !(start.is_finite() && end.is_finite()) || start < 0.0 || end <= start {
        return Err(format!("invalid {} range: {}-{}", kind, start, end));
    }
    Ok(SkipRange {
        kind,
        start: Duration::from_secs_f64(start),
        end: Duration::from_secs_f64(end),
    })
}

fn from_range(range: &SkipRange) -> (f64, f64) {
    (range.start.as_secs_f64(), range.end.as_secs_f64())
}

impl SkipStore {
    /// Returns a store that keeps skip files alongside each video.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new [SkipStore] that keeps skip files in `cache_dir`.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Returns the path of the skip file for the given video.
    pub fn path_for(&self, video: impl AsRef<Path>) -> PathBuf {
        store::entry_path(self.cache_dir.as_deref(), video.as_ref(), super::SKIP_FILE_EXT)
    }

    /// Loads the skip file for the given video, if there is one.
    pub fn load(&self, video: impl AsRef<Path>) -> Result<Option<SkipEntry>> {
        let path = self.path_for(video);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let invalid = |reason: String| Error::InvalidSkipData {
            path: path.clone(),
            reason,
        };

        let probe: VersionProbe = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
        if probe.version != SKIP_DATA_VERSION {
            return Err(Error::SkipDataInvalidVersion {
                path: path.clone(),
                version: probe.version,
            });
        }

        let data: SkipFileV1 = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
        let result = SearchResult {
            opening: data
                .opening
                .map(|r| to_range(SegmentKind::Opening, r))
                .transpose()
                .map_err(invalid)?,
            ending: data
                .ending
                .map(|r| to_range(SegmentKind::Ending, r))
                .transpose()
                .map_err(invalid)?,
        };

        Ok(Some(SkipEntry {
            md5: data.md5,
            include_endings: data.include_endings,
            result,
        }))
    }

    /// Writes the skip file for the given video atomically.
    ///
    /// `include_endings` records whether the search looked for endings, so that an openings-only
    /// entry is not mistaken for "no ending" later.
    pub fn save(
        &self,
        video: impl AsRef<Path>,
        md5: &str,
        include_endings: bool,
        result: &SearchResult,
    ) -> Result<()> {
        let path = self.path_for(video);
        let data = SkipFileV1 {
            version: SKIP_DATA_VERSION,
            md5: md5.to_string(),
            include_endings,
            opening: result.opening.as_ref().map(from_range),
            ending: result.ending.as_ref().map(from_range),
        };
        store::write_atomic(&path, |w| Ok(serde_json::to_writer(w, &data)?))?;
        tracing::debug!("wrote {}", path.display());
        Ok(())
    }

    /// Removes the skip file for the given video. Returns false if there was none.
    pub fn remove(&self, video: impl AsRef<Path>) -> Result<bool> {
        store::remove_entry(&self.path_for(video))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn result() -> SearchResult {
        SearchResult {
            opening: Some(SkipRange {
                kind: SegmentKind::Opening,
                start: Duration::from_millis(2500),
                end: Duration::from_millis(92250),
            }),
            ending: None,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("ep1.mkv");
        let store = SkipStore::new();

        assert_eq!(store.load(&video).unwrap(), None);

        store.save(&video, "abc", false, &result()).unwrap();
        assert!(dir.path().join("ep1.mkv.needle.skip.json").exists());
        let entry = store.load(&video).unwrap().unwrap();
        assert_eq!(entry.md5, "abc");
        assert!(!entry.include_endings);
        assert_eq!(entry.result, result());

        let raw = std::fs::read_to_string(store.path_for(&video)).unwrap();
        insta::assert_snapshot!(raw, @r###"{"version":1,"md5":"abc","include_endings":false,"opening":[2.5,92.25],"ending":null}"###);

        assert!(store.remove(&video).unwrap());
        assert_eq!(store.load(&video).unwrap(), None);
    }

    #[test]
    fn test_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipStore::new().with_cache_dir(dir.path());
        let video = Path::new("/videos/ep1.mkv");

        // Payload shape is irrelevant once the version is rejected.
        std::fs::write(store.path_for(video), r#"{"version":2,"ranges":[]}"#).unwrap();
        assert!(matches!(
            store.load(video),
            Err(Error::SkipDataInvalidVersion { version: 2, .. })
        ));
    }

    #[test]
    fn test_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("ep1.mkv");
        let store = SkipStore::new();

        for raw in [
            "not json",
            r#"{"md5":"abc"}"#,
            r#"{"version":1,"opening":null,"ending":null}"#,
            r#"{"version":1,"md5":"abc","opening":[10.0,5.0],"ending":null}"#,
        ] {
            std::fs::write(store.path_for(&video), raw).unwrap();
            let err = store.load(&video).unwrap_err();
            assert!(
                matches!(err, Error::InvalidSkipData { .. }),
                "{}: {:?}",
                raw,
                err
            );
            assert!(err.is_cache_miss());
        }
    }
}
